use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{HostType, LoadFailure, WidgetLoadState};

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system" | "session" | "widget" | "ui")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "widget.state.changed")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// SDK component
    System(String),
    /// The embedding application
    Host,
    /// The content surface (embedded browser)
    Surface,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    StartupComplete,
    ShutdownRequested {
        reason: String,
    },
    ConnectivityChanged {
        available: bool,
    },
    AppWillEnterForeground,
    AppDidEnterBackground,
    SessionConfigChanged {
        app_id: String,
        host: HostType,
    },

    // ── Session events ─────────────────────────────────────────────
    UserChanged {
        user_id: String,
        previous_user_id: Option<String>,
    },
    UserInfoSent {
        user_id: String,
    },
    PushTokenChanged,
    LoggedOut {
        user_id: Option<String>,
    },

    // ── Widget events ──────────────────────────────────────────────
    LoadStateChanged {
        state: WidgetLoadState,
        failure: Option<LoadFailure>,
    },
    SurfaceFinishedLoading {
        url: String,
    },
    SurfaceFailedLoading {
        reason: Option<String>,
    },
    SurfaceMessageReceived {
        body: String,
    },
    OfflineModeSignalled {
        offline: bool,
    },
    SnapshotSaved {
        bytes: u64,
    },

    // ── UI events ──────────────────────────────────────────────────
    UnreadCountChanged {
        count: u32,
    },
    BannerShown {
        notification_id: String,
    },
    BannerHidden,
    OpenSessionRequested {
        notification_id: Option<String>,
    },
    WidgetCloseRequested,
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError>;
    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError>;
}

/// Build an event for `channel_name` and publish it.
pub fn publish_event(
    event_bus: &dyn EventBus,
    channel_name: &str,
    source: EventSource,
    payload: EventPayload,
) -> std::result::Result<(), crate::error::EventBusError> {
    let event = Event::new(Channel::new(channel_name)?, source, payload);
    event_bus.publish(event)
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    session_sender: broadcast::Sender<Event>,
    widget_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (session_sender, _) = broadcast::channel(capacity);
        let (widget_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            session_sender,
            widget_sender,
            ui_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "session" => Some(&self.session_sender),
            "widget" => Some(&self.widget_sender),
            "ui" => Some(&self.ui_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, crate::error::EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            ));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                session: Some(self.session_sender.subscribe()),
                widget: Some(self.widget_sender.subscribe()),
                ui: Some(self.ui_sender.subscribe()),
            });
        }

        let mut receivers = DomainReceivers::default();
        match first_segment {
            "system" => receivers.system = Some(self.system_sender.subscribe()),
            "session" => receivers.session = Some(self.session_sender.subscribe()),
            "widget" => receivers.widget = Some(self.widget_sender.subscribe()),
            "ui" => receivers.ui = Some(self.ui_sender.subscribe()),
            _ => {
                return Err(crate::error::EventBusError::InvalidPattern(
                    pattern.to_string(),
                ));
            }
        }
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| {
                crate::error::EventBusError::InvalidChannel(event.channel.to_string())
            })?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| crate::error::EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    session: Option<broadcast::Receiver<Event>>,
    widget: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
}

/// A live subscription. Dropping it unsubscribes.
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, crate::error::EventBusError> {
        loop {
            let received = tokio::select! {
                result = recv_from_domain(self.receivers.system.as_mut()) => result,
                result = recv_from_domain(self.receivers.session.as_mut()) => result,
                result = recv_from_domain(self.receivers.widget.as_mut()) => result,
                result = recv_from_domain(self.receivers.ui.as_mut()) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(crate::error::EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(crate::error::EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', ']', '{', '}', '!'])
}
