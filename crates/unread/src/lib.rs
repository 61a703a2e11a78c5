use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use sabycom_api::RemoteApi;
use sabycom_connectivity::ConnectivityMonitor;
use sabycom_core::config::UnreadConfig;
use sabycom_core::error::EventBusError;
use sabycom_core::event::{
    Event, EventBus, EventPayload, EventSource, EventSubscription, publish_event,
};

const UNREAD_SOURCE: &str = "unread";
pub const UNREAD_CHANNEL: &str = "ui.unread.changed";

#[derive(Debug, thiserror::Error)]
pub enum UnreadError {
    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    user_id: String,
    channel_id: String,
}

#[derive(Debug, Default)]
struct TrackerState {
    count: u32,
    last_fetch: Option<Instant>,
    fetching: bool,
    target: Option<Target>,
}

/// Keeps the unread conversation count for the current user and channel.
///
/// Remote fetches are throttled by a cooldown; the [`run`](Self::run) loop rechecks on a short
/// interval so the cooldown alone decides the real polling rate. Nothing is fetched while the
/// network is unavailable.
pub struct UnreadCountTracker {
    api: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityMonitor>,
    event_bus: Arc<dyn EventBus>,
    state: Mutex<TrackerState>,
    cooldown: Duration,
    recheck: Duration,
    reschedule: Notify,
}

impl UnreadCountTracker {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
        event_bus: Arc<dyn EventBus>,
        config: &UnreadConfig,
    ) -> Self {
        Self {
            api,
            connectivity,
            event_bus,
            state: Mutex::new(TrackerState::default()),
            cooldown: config.cooldown(),
            recheck: config.recheck(),
            reschedule: Notify::new(),
        }
    }

    /// Last known count, 0 until the first successful update.
    pub fn unread_count(&self) -> u32 {
        self.state.lock().unwrap().count
    }

    /// Observe `ui.unread.changed` until the handle is dropped.
    pub fn subscribe(&self) -> Result<EventSubscription, UnreadError> {
        Ok(self.event_bus.subscribe(UNREAD_CHANNEL)?)
    }

    /// Point the tracker at a user and channel, or detach it with `None`.
    ///
    /// A new target forgets the previous fetch time and is polled right away.
    pub async fn set_target(&self, target: Option<(String, String)>) {
        let target = target.map(|(user_id, channel_id)| Target {
            user_id,
            channel_id,
        });
        {
            let mut state = self.state.lock().unwrap();
            if state.target == target {
                return;
            }
            state.target = target;
            state.last_fetch = None;
        }
        self.load(false).await;
    }

    /// Take `count` as authoritative without asking the backend. Always notifies.
    pub fn update_unread_messages_count(&self, count: u32) {
        self.apply(count, true);
        self.reschedule.notify_one();
    }

    /// Fetch the count if the network is up, nothing is in flight and the cooldown has passed
    /// (or `force` is set). Returns whether a fetch was made.
    pub async fn load(&self, force: bool) -> bool {
        let target = {
            let mut state = self.state.lock().unwrap();
            if !self.connectivity.is_available() {
                debug!("network unavailable, unread fetch skipped");
                return false;
            }
            if state.fetching {
                return false;
            }
            let Some(target) = state.target.clone() else {
                return false;
            };
            let due = force
                || state
                    .last_fetch
                    .is_none_or(|at| at.elapsed() >= self.cooldown);
            if !due {
                return false;
            }
            state.fetching = true;
            state.last_fetch = Some(Instant::now());
            target
        };

        let count = match self
            .api
            .unread_count(&target.user_id, &target.channel_id)
            .await
        {
            Ok(count) => count,
            Err(error) => {
                warn!(%error, user_id = %target.user_id, "failed to fetch unread count");
                0
            }
        };

        self.state.lock().unwrap().fetching = false;
        self.apply(count, false);
        self.reschedule.notify_one();
        true
    }

    fn apply(&self, count: u32, force_notify: bool) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = state.count != count;
            state.count = count;
            changed
        };

        if !(changed || force_notify) {
            return;
        }

        debug!(count, "unread count updated");
        if let Err(error) = publish_event(
            self.event_bus.as_ref(),
            UNREAD_CHANNEL,
            EventSource::System(UNREAD_SOURCE.to_string()),
            EventPayload::UnreadCountChanged { count },
        ) {
            warn!(%error, "failed to publish unread count");
        }
    }

    pub async fn handle_event(&self, event: &Event) {
        if let EventPayload::ConnectivityChanged { available } = &event.payload {
            if *available {
                self.load(false).await;
            } else {
                debug!("unread polling suspended while offline");
            }
        }
    }

    /// Subscription for [`run`](Self::run), taken before the loop is spawned.
    pub fn listen(&self) -> Result<EventSubscription, EventBusError> {
        self.event_bus.subscribe("system.connectivity.changed")
    }

    /// Poll loop. The recheck timer restarts after every fetch attempt or forced update.
    pub async fn run(self: Arc<Self>, mut sub: EventSubscription) -> Result<(), UnreadError> {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.recheck) => {
                    self.load(false).await;
                }
                _ = self.reschedule.notified() => {}
                received = sub.recv() => match received {
                    Ok(event) => self.handle_event(&event).await,
                    Err(EventBusError::ChannelClosed) => {
                        debug!("event bus closed, unread tracker stopping");
                        return Ok(());
                    }
                    Err(EventBusError::Lagged(count)) => {
                        warn!(count, "unread tracker lagged, some events dropped");
                    }
                    Err(e) => {
                        error!(error = %e, "unread tracker subscription error");
                        return Err(e.into());
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sabycom_core::event::BroadcastEventBus;
    use sabycom_test_support::fakes::FakeRemoteApi;
    use tokio::time::timeout;

    struct Harness {
        tracker: Arc<UnreadCountTracker>,
        api: Arc<FakeRemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
    }

    fn make_tracker(online: bool) -> Harness {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let api = Arc::new(FakeRemoteApi::new());
        let connectivity = Arc::new(ConnectivityMonitor::new(event_bus.clone(), online));
        let tracker = Arc::new(UnreadCountTracker::new(
            api.clone(),
            connectivity.clone(),
            event_bus,
            &UnreadConfig::default(),
        ));
        Harness {
            tracker,
            api,
            connectivity,
        }
    }

    fn target() -> Option<(String, String)> {
        Some(("u1".to_string(), "a1".to_string()))
    }

    async fn next_count(sub: &mut EventSubscription) -> Option<u32> {
        match timeout(Duration::from_millis(100), sub.recv()).await {
            Ok(Ok(Event {
                payload: EventPayload::UnreadCountChanged { count },
                ..
            })) => Some(count),
            _ => None,
        }
    }

    // ── Fetch conditions ──────────────────────────────────────────

    #[tokio::test]
    async fn starts_at_zero_without_fetching() {
        let h = make_tracker(true);
        assert_eq!(h.tracker.unread_count(), 0);
        assert!(!h.tracker.load(false).await, "no target yet");
        assert_eq!(h.api.unread_calls(), 0);
    }

    #[tokio::test]
    async fn setting_target_fetches_immediately() {
        let h = make_tracker(true);
        h.api.set_unread(3);
        h.tracker.set_target(target()).await;

        assert_eq!(h.api.unread_calls(), 1);
        assert_eq!(h.tracker.unread_count(), 3);
    }

    #[tokio::test]
    async fn cooldown_blocks_unforced_fetch() {
        let h = make_tracker(true);
        h.tracker.set_target(target()).await;

        assert!(!h.tracker.load(false).await);
        assert!(h.tracker.load(true).await, "forced fetch ignores cooldown");
        assert_eq!(h.api.unread_calls(), 2);
    }

    #[tokio::test]
    async fn offline_suppresses_fetch_even_when_forced() {
        let h = make_tracker(false);
        h.tracker.set_target(target()).await;

        assert!(!h.tracker.load(true).await);
        assert_eq!(h.api.unread_calls(), 0);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn failed_fetch_counts_as_zero() {
        let h = make_tracker(true);
        h.tracker.update_unread_messages_count(5);
        h.api.fail_unread(true);
        h.tracker.set_target(target()).await;

        assert_eq!(h.tracker.unread_count(), 0);
        assert!(logs_contain("failed to fetch unread count"));
    }

    // ── Notifications ─────────────────────────────────────────────

    #[tokio::test]
    async fn fetch_notifies_only_on_change() {
        let h = make_tracker(true);
        let mut sub = h.tracker.subscribe().unwrap();
        h.api.set_unread(2);

        h.tracker.set_target(target()).await;
        h.tracker.load(true).await;

        assert_eq!(next_count(&mut sub).await, Some(2));
        assert_eq!(next_count(&mut sub).await, None, "same count must not re-notify");
    }

    #[tokio::test]
    async fn forced_update_always_notifies() {
        let h = make_tracker(true);
        let mut sub = h.tracker.subscribe().unwrap();

        h.tracker.update_unread_messages_count(4);
        h.tracker.update_unread_messages_count(4);

        assert_eq!(next_count(&mut sub).await, Some(4));
        assert_eq!(next_count(&mut sub).await, Some(4));
        assert_eq!(h.tracker.unread_count(), 4);
    }

    #[tokio::test]
    async fn forced_update_bypasses_network() {
        let h = make_tracker(false);
        h.tracker.update_unread_messages_count(7);
        assert_eq!(h.tracker.unread_count(), 7);
        assert_eq!(h.api.unread_calls(), 0);
    }

    // ── Poll loop ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn sustained_polling_respects_cooldown() {
        let h = make_tracker(true);
        let handle = tokio::spawn(h.tracker.clone().run(h.tracker.listen().unwrap()));

        h.tracker.set_target(target()).await;
        assert_eq!(h.api.unread_calls(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(h.api.unread_calls(), 1, "rechecks inside the cooldown must not fetch");

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(h.api.unread_calls(), 2);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(h.api.unread_calls() <= 12);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn polling_suspends_offline_and_resumes_on_reconnect() {
        let h = make_tracker(true);
        let handle = tokio::spawn(h.tracker.clone().run(h.tracker.listen().unwrap()));
        h.tracker.set_target(target()).await;

        h.connectivity.report(false);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.api.unread_calls(), 1);

        h.connectivity.report(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.api.unread_calls(), 2, "reconnect must fetch without waiting for a tick");

        handle.abort();
    }

    #[tokio::test]
    async fn clearing_target_stops_fetching() {
        let h = make_tracker(true);
        h.tracker.set_target(target()).await;
        h.tracker.set_target(None).await;

        assert!(!h.tracker.load(true).await);
        assert_eq!(h.api.unread_calls(), 1);
    }
}
