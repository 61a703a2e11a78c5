//! Sabycom customer-support chat widget SDK.
//!
//! [`Sabycom`] is the session object the host application constructs and owns. It wires the
//! connectivity monitor, unread-count tracker, user registry, widget controller and message
//! banner together over one event bus and exposes the calls a host makes:
//!
//! ```text
//! host ──initialize / register / show / push / lifecycle──► Sabycom
//!                                                             │ direct calls
//!            ┌───────────────┬───────────────┬────────────────┼───────────────┐
//!            ▼               ▼               ▼                ▼               ▼
//!      Connectivity    UserRegistry    UnreadTracker    WidgetController   Banner
//!            └───────────────┴──── event bus (system/session/widget/ui) ──────┘
//! ```

mod error;

use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sabycom_api::RemoteApi;
use sabycom_connectivity::ConnectivityMonitor;
use sabycom_core::config::{ConfigError, UnreadConfig};
use sabycom_core::event::{EventBus, EventPayload, EventSource, EventSubscription, publish_event};
use sabycom_core::surface::ContentSurface;
use sabycom_notifications::{BannerController, NotificationModel};
use sabycom_session::UserRegistry;
use sabycom_storage::{KeyValueStore, OfflineArchive, keys};
use sabycom_unread::UnreadCountTracker;
use sabycom_widget::{WidgetDeps, WidgetSessionController};

pub use error::SdkError;
pub use sabycom_core::model::{
    HostType, LoadFailure, PushToken, PushTokenType, SessionConfig, User, WidgetLoadState,
};
pub use sabycom_notifications::{Banner, BannerError, BannerPresenter};

const SDK_SOURCE: &str = "sdk";

/// Everything a session needs from the host.
pub struct SessionDeps {
    pub kv: Arc<dyn KeyValueStore>,
    pub api: Arc<dyn RemoteApi>,
    pub banner_presenter: Arc<dyn BannerPresenter>,
    pub archive: OfflineArchive,
    pub event_bus: Arc<dyn EventBus>,
    pub unread: UnreadConfig,
    /// Reachability at construction; later changes go through [`Sabycom::report_reachability`].
    pub initially_online: bool,
}

pub struct Sabycom {
    kv: Arc<dyn KeyValueStore>,
    api: Arc<dyn RemoteApi>,
    event_bus: Arc<dyn EventBus>,
    connectivity: Arc<ConnectivityMonitor>,
    registry: Arc<UserRegistry>,
    unread: Arc<UnreadCountTracker>,
    widget: Arc<WidgetSessionController>,
    banner: Arc<BannerController>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sabycom {
    /// Build the session, restore what the previous run persisted and start the component
    /// loops. Must be called inside a tokio runtime.
    pub async fn start(deps: SessionDeps) -> Result<Self, SdkError> {
        let SessionDeps {
            kv,
            api,
            banner_presenter,
            archive,
            event_bus,
            unread,
            initially_online,
        } = deps;

        let connectivity = Arc::new(ConnectivityMonitor::new(
            event_bus.clone(),
            initially_online,
        ));
        let registry = Arc::new(UserRegistry::new(kv.clone(), api.clone(), event_bus.clone()));
        let unread = Arc::new(UnreadCountTracker::new(
            api.clone(),
            connectivity.clone(),
            event_bus.clone(),
            &unread,
        ));
        let widget = Arc::new(WidgetSessionController::new(WidgetDeps {
            registry: registry.clone(),
            connectivity: connectivity.clone(),
            unread: unread.clone(),
            archive,
            kv: kv.clone(),
            event_bus: event_bus.clone(),
        }));
        let banner = Arc::new(BannerController::new(banner_presenter, event_bus.clone()));

        let sdk = Self {
            kv,
            api,
            event_bus,
            connectivity,
            registry,
            unread,
            widget,
            banner,
            tasks: Mutex::new(Vec::new()),
        };

        sdk.registry.restore().await?;
        sdk.restore_session_config().await?;
        sdk.spawn_background_tasks()?;

        sdk.publish("system.startup.complete", EventPayload::StartupComplete);
        info!(online = initially_online, "sabycom session started");
        Ok(sdk)
    }

    async fn restore_session_config(&self) -> Result<(), SdkError> {
        let (Some(app_id), Some(host)) = (
            self.kv.get(keys::APP_ID).await?,
            self.kv.get(keys::HOST).await?,
        ) else {
            return Ok(());
        };
        let host = match host.parse::<HostType>() {
            Ok(host) => host,
            Err(error) => {
                warn!(%error, "stored host is unknown, falling back to prod");
                HostType::Prod
            }
        };

        debug!(app_id = %app_id, %host, "restoring session config");
        self.api.set_host(host);
        self.registry
            .set_session_config(SessionConfig::new(app_id, host));
        Ok(())
    }

    /// Every loop subscribes here, before any of them is spawned, so nothing published
    /// after `start` returns can slip past a loop that has not been polled yet.
    fn spawn_background_tasks(&self) -> Result<(), SdkError> {
        let unread = self.unread.listen()?;
        let session = self.registry.listen()?;
        let widget = self.widget.listen()?;
        let banner = self.banner.listen()?;

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(spawn_component("unread", self.unread.clone().run(unread)));
        tasks.push(spawn_component("session", self.registry.clone().run(session)));
        tasks.push(spawn_component("widget", self.widget.clone().run(widget)));
        tasks.push(spawn_component("banner", self.banner.clone().run(banner)));
        Ok(())
    }

    // ── Configuration and identity ────────────────────────────────

    /// Set the channel (`app_id`, a UUID) and backend environment.
    pub async fn initialize(&self, app_id: &str, host: HostType) -> Result<(), SdkError> {
        let session = SessionConfig::new(app_id, host);
        debug_assert!(
            session.has_valid_app_id(),
            "initialize called with an app id that is not a UUID: {app_id}"
        );
        if !session.has_valid_app_id() {
            return Err(ConfigError::InvalidValue {
                field: "app_id".to_string(),
                message: "must be a UUID".to_string(),
            }
            .into());
        }

        self.kv.set(keys::APP_ID, &session.app_id).await?;
        self.kv.set(keys::HOST, host.as_str()).await?;
        self.api.set_host(host);
        self.registry.set_session_config(session.clone());

        info!(app_id = %session.app_id, %host, "sabycom initialized");
        self.publish(
            "system.config.changed",
            EventPayload::SessionConfigChanged {
                app_id: session.app_id,
                host,
            },
        );
        self.refresh_unread_target().await;
        Ok(())
    }

    pub async fn register_user(&self, user: User) -> Result<(), SdkError> {
        let switched = self.registry.register_user(user).await?;
        self.after_identity_change(switched).await;
        Ok(())
    }

    /// Reuse the persisted anonymous user or create one.
    pub async fn register_anonymous_user(&self) -> Result<User, SdkError> {
        let (user, switched) = self.registry.register_anonymous_user().await?;
        self.after_identity_change(switched).await;
        Ok(user)
    }

    async fn after_identity_change(&self, switched: bool) {
        if switched {
            self.widget.user_switched().await;
            if self.widget.is_presented() {
                self.widget.reload().await;
            }
        }
        self.refresh_unread_target().await;
    }

    pub fn register_push_token(&self, push_token: Option<PushToken>) {
        self.registry.set_push_token(push_token);
    }

    /// Unsubscribe this device and forget the current user. The offline archive stays until
    /// the next identity change.
    pub async fn logout(&self) -> Result<(), SdkError> {
        self.registry.logout().await?;
        self.unread.set_target(None).await;
        self.unread.update_unread_messages_count(0);
        Ok(())
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.registry.current_user_id()
    }

    async fn refresh_unread_target(&self) {
        let target = match (
            self.registry.current_user_id(),
            self.registry.session_config(),
        ) {
            (Some(user_id), Some(session)) => Some((user_id, session.app_id)),
            _ => None,
        };
        self.unread.set_target(target).await;
    }

    // ── Unread count ──────────────────────────────────────────────

    pub fn unread_count(&self) -> u32 {
        self.unread.unread_count()
    }

    /// Observe SDK events, e.g. `ui.unread.changed` or `ui.**`.
    pub fn subscribe(&self, pattern: &str) -> Result<EventSubscription, SdkError> {
        Ok(self.event_bus.subscribe(pattern)?)
    }

    // ── Widget ────────────────────────────────────────────────────

    /// Present the widget in `surface` and start loading it.
    pub async fn show(&self, surface: Arc<dyn ContentSurface>) -> Result<(), SdkError> {
        let initialized = self.registry.session_config().is_some();
        debug_assert!(initialized, "show called before initialize");
        if !initialized {
            return Err(SdkError::NotInitialized);
        }

        self.banner.hide();
        self.widget.attach_surface(surface);
        self.widget.reload().await;
        Ok(())
    }

    pub fn hide(&self) {
        self.widget.detach_surface();
    }

    pub async fn reload(&self) {
        self.widget.reload().await;
    }

    pub async fn load_state(&self) -> WidgetLoadState {
        self.widget.load_state().await
    }

    pub async fn last_failure(&self) -> Option<LoadFailure> {
        self.widget.last_failure().await
    }

    pub fn widget(&self) -> &Arc<WidgetSessionController> {
        &self.widget
    }

    // ── Push notifications ────────────────────────────────────────

    pub fn is_sabycom_push(&self, payload: &Value) -> bool {
        sabycom_notifications::is_sabycom_push(payload, self.current_user_id().as_deref())
    }

    /// Route a push payload: update the unread count and show the banner over `anchor`.
    ///
    /// Returns whether the payload was ours. Pushes arriving while the widget is on screen are
    /// left to the widget itself.
    pub fn handle_push(&self, payload: &Value, anchor: &str) -> bool {
        if !self.is_sabycom_push(payload) {
            debug!("push is not addressed to the current widget user");
            return false;
        }
        let Ok(model) = NotificationModel::parse(payload) else {
            return false;
        };
        if self.widget.is_presented() {
            debug!(notification_id = %model.id, "widget is presented, push ignored");
            return true;
        }

        self.unread.update_unread_messages_count(model.unread_count);
        self.banner.show(&model, anchor);
        true
    }

    pub fn banner(&self) -> &Arc<BannerController> {
        &self.banner
    }

    // ── App lifecycle ─────────────────────────────────────────────

    pub async fn app_will_enter_foreground(&self) {
        self.publish(
            "system.app.foreground",
            EventPayload::AppWillEnterForeground,
        );
        self.unread.load(true).await;
        self.widget.app_will_enter_foreground().await;
    }

    pub async fn app_did_enter_background(&self) {
        self.publish("system.app.background", EventPayload::AppDidEnterBackground);
        self.banner.hide();
        self.widget.app_did_enter_background().await;
    }

    /// Feed an OS-level reachability signal. Duplicates are ignored.
    pub fn report_reachability(&self, available: bool) -> bool {
        self.connectivity.report(available)
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Hide the banner and stop the component loops.
    pub fn shutdown(&self) {
        self.banner.hide();
        self.publish(
            "system.shutdown.requested",
            EventPayload::ShutdownRequested {
                reason: "host shutdown".to_string(),
            },
        );
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("sabycom session stopped");
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        if let Err(error) = publish_event(
            self.event_bus.as_ref(),
            channel,
            EventSource::System(SDK_SOURCE.to_string()),
            payload,
        ) {
            warn!(%error, channel, "failed to publish sdk event");
        }
    }
}

impl Drop for Sabycom {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

fn spawn_component<F, E>(component: &'static str, run: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display,
{
    tokio::spawn(async move {
        if let Err(error) = run.await {
            error!(component, %error, "component loop stopped");
        }
    })
}
