//! Widget session controller.
//!
//! Decides, on every reload trigger, whether the content surface loads the widget live, renders
//! the offline archive, or shows the error state:
//!
//! ```text
//! Preparing ─┬─ no app id / user ──────────────────────────────► Error
//!            ├─ offline, archive present ─► LoadingFromCache ─┐
//!            ├─ offline, no archive ───────────────────────────► Error
//!            ├─ online, user not synced ─► (wait for sync) ─┐ │
//!            └─ online, user synced ─────► LoadingLive ◄────┘ │
//!                                               │             │
//!                                               ▼             ▼
//!                                             Loaded ◄────────┘
//! ```
//!
//! Any state goes back to `Preparing` on the next reload.

pub mod bridge;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

use sabycom_connectivity::ConnectivityMonitor;
use sabycom_core::endpoint;
use sabycom_core::error::EventBusError;
use sabycom_core::event::{
    Event, EventBus, EventPayload, EventSource, EventSubscription, publish_event,
};
use sabycom_core::model::{LoadFailure, WidgetLoadState};
use sabycom_core::surface::ContentSurface;
use sabycom_session::UserRegistry;
use sabycom_storage::{KeyValueStore, OfflineArchive, keys};
use sabycom_unread::UnreadCountTracker;

use crate::bridge::{BridgeMessage, offline_mode_script};

const WIDGET_SOURCE: &str = "widget";

#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

#[derive(Debug)]
struct ControllerState {
    load_state: WidgetLoadState,
    last_failure: Option<LoadFailure>,
    loaded_from_cache: bool,
    archived_this_session: bool,
    /// A live load is owed once the user sync completes.
    should_load_from_cloud: bool,
    snapshot_pending: bool,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            load_state: WidgetLoadState::Preparing,
            last_failure: None,
            loaded_from_cache: false,
            archived_this_session: false,
            should_load_from_cloud: false,
            snapshot_pending: false,
        }
    }
}

/// Collaborators the controller reads from or drives.
pub struct WidgetDeps {
    pub registry: Arc<UserRegistry>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub unread: Arc<UnreadCountTracker>,
    pub archive: OfflineArchive,
    pub kv: Arc<dyn KeyValueStore>,
    pub event_bus: Arc<dyn EventBus>,
}

pub struct WidgetSessionController {
    registry: Arc<UserRegistry>,
    connectivity: Arc<ConnectivityMonitor>,
    unread: Arc<UnreadCountTracker>,
    archive: OfflineArchive,
    kv: Arc<dyn KeyValueStore>,
    event_bus: Arc<dyn EventBus>,
    surface: RwLock<Option<Arc<dyn ContentSurface>>>,
    /// Set when a surface is attached; the next reload starts a new archiving session.
    new_presentation: AtomicBool,
    /// Held for the whole of a reload so two reload sequences never interleave.
    state: Mutex<ControllerState>,
}

impl WidgetSessionController {
    pub fn new(deps: WidgetDeps) -> Self {
        Self {
            registry: deps.registry,
            connectivity: deps.connectivity,
            unread: deps.unread,
            archive: deps.archive,
            kv: deps.kv,
            event_bus: deps.event_bus,
            surface: RwLock::new(None),
            new_presentation: AtomicBool::new(false),
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn attach_surface(&self, surface: Arc<dyn ContentSurface>) {
        *self.surface.write().unwrap() = Some(surface);
        self.new_presentation.store(true, Ordering::SeqCst);
    }

    pub fn detach_surface(&self) {
        *self.surface.write().unwrap() = None;
    }

    /// Whether a content surface is currently showing the widget.
    pub fn is_presented(&self) -> bool {
        self.surface.read().unwrap().is_some()
    }

    fn surface(&self) -> Option<Arc<dyn ContentSurface>> {
        self.surface.read().unwrap().clone()
    }

    pub async fn load_state(&self) -> WidgetLoadState {
        self.state.lock().await.load_state.clone()
    }

    /// The failure behind the current `Error` state, if that is the state.
    pub async fn last_failure(&self) -> Option<LoadFailure> {
        self.state.lock().await.last_failure.clone()
    }

    pub async fn is_loaded_from_cache(&self) -> bool {
        self.state.lock().await.loaded_from_cache
    }

    // ── Load decision ─────────────────────────────────────────────

    /// Restart the load decision from `Preparing`.
    pub async fn reload(&self) {
        let mut state = self.state.lock().await;
        if self.new_presentation.swap(false, Ordering::SeqCst) {
            state.archived_this_session = false;
            state.snapshot_pending = false;
        }
        self.set_state(&mut state, WidgetLoadState::Preparing, None);

        let Some(surface) = self.surface() else {
            debug!("no content surface attached, reload stops at preparing");
            return;
        };

        let Some(url) = self.session_url() else {
            self.fail(&mut state, LoadFailure::ConfigurationMissing);
            return;
        };
        self.remember_url(&url, surface.as_ref()).await;

        if !self.connectivity.is_available() {
            self.load_from_cache(&mut state, surface.as_ref(), url).await;
            return;
        }

        if !self.registry.user_info_sent() {
            debug!("user sync pending, live load deferred");
            state.should_load_from_cloud = true;
            return;
        }

        self.load_live(&mut state, surface.as_ref(), url);
    }

    async fn load_from_cache(
        &self,
        state: &mut ControllerState,
        surface: &dyn ContentSurface,
        url: Url,
    ) {
        let Some(path) = self.archive.snapshot_location().await else {
            self.fail(state, LoadFailure::NetworkUnavailable);
            return;
        };
        let Ok(archive_url) = Url::from_file_path(&path) else {
            warn!(path = %path.display(), "offline archive path is not absolute");
            self.fail(state, LoadFailure::NetworkUnavailable);
            return;
        };

        state.should_load_from_cloud = false;
        state.loaded_from_cache = true;
        self.set_state(state, WidgetLoadState::LoadingFromCache(url), None);
        surface.load(&archive_url, true);
    }

    fn load_live(&self, state: &mut ControllerState, surface: &dyn ContentSurface, url: Url) {
        state.should_load_from_cloud = false;
        state.loaded_from_cache = false;
        self.set_state(state, WidgetLoadState::LoadingLive(url.clone()), None);
        surface.load(&url, false);
    }

    fn session_url(&self) -> Option<Url> {
        let session = self.registry.session_config()?;
        let user_id = self.registry.current_user_id()?;
        if session.app_id.is_empty() {
            return None;
        }
        match endpoint::session_url(&session, &user_id) {
            Ok(url) => Some(url),
            Err(error) => {
                warn!(%error, "failed to build session URL");
                None
            }
        }
    }

    /// Persist the URL about to be loaded; a different URL than last time drops the old
    /// site data so the previous user's cookies do not leak.
    async fn remember_url(&self, url: &Url, surface: &dyn ContentSurface) {
        match self.kv.get(keys::LAST_USED_URL).await {
            Ok(Some(previous)) if previous != url.as_str() => {
                if let Ok(previous) = Url::parse(&previous) {
                    debug!(%previous, "session URL changed, forgetting site data");
                    surface.forget_site_data(&previous);
                }
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "failed to read last used URL"),
        }

        if let Err(error) = self.kv.set(keys::LAST_USED_URL, url.as_str()).await {
            warn!(%error, "failed to persist last used URL");
        }
    }

    fn fail(&self, state: &mut ControllerState, failure: LoadFailure) {
        warn!(%failure, "widget load failed");
        state.should_load_from_cloud = false;
        self.set_state(state, WidgetLoadState::Error, Some(failure));
    }

    fn set_state(
        &self,
        state: &mut ControllerState,
        load_state: WidgetLoadState,
        failure: Option<LoadFailure>,
    ) {
        info!(state = %load_state, "widget load state changed");
        state.load_state = load_state.clone();
        state.last_failure = failure.clone();
        self.publish(
            "widget.state.changed",
            EventPayload::LoadStateChanged {
                state: load_state,
                failure,
            },
        );
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        if let Err(error) = publish_event(
            self.event_bus.as_ref(),
            channel,
            EventSource::System(WIDGET_SOURCE.to_string()),
            payload,
        ) {
            warn!(%error, channel, "failed to publish widget event");
        }
    }

    // ── Triggers ──────────────────────────────────────────────────

    /// The backend accepted the current user; run a deferred live load if one is owed.
    pub async fn handle_user_info_sent(&self) {
        let mut state = self.state.lock().await;
        if !state.should_load_from_cloud {
            return;
        }
        let Some(surface) = self.surface() else {
            return;
        };
        if !self.connectivity.is_available() {
            debug!("user synced while offline, waiting for the next reload");
            return;
        }

        match self.session_url() {
            Some(url) => {
                self.remember_url(&url, surface.as_ref()).await;
                self.load_live(&mut state, surface.as_ref(), url);
            }
            None => self.fail(&mut state, LoadFailure::ConfigurationMissing),
        }
    }

    pub async fn handle_connectivity_changed(&self, available: bool) {
        self.signal_offline_mode(!available);

        let needs_reload = {
            let state = self.state.lock().await;
            if available {
                matches!(state.load_state, WidgetLoadState::Error) || state.loaded_from_cache
            } else {
                // A deferred live load can no longer happen; fall back now.
                state.should_load_from_cloud
            }
        };

        if needs_reload && self.is_presented() {
            info!(available, "connectivity changed, reloading widget");
            self.reload().await;
        }
    }

    fn signal_offline_mode(&self, offline: bool) {
        let Some(surface) = self.surface() else {
            return;
        };
        surface.evaluate_script(&offline_mode_script(offline));
        self.publish(
            "widget.offline.signalled",
            EventPayload::OfflineModeSignalled { offline },
        );
    }

    pub async fn app_will_enter_foreground(&self) {
        if self.is_presented() {
            self.reload().await;
        }
    }

    /// Keep whatever is on screen so the next cold start has something to show offline.
    pub async fn app_did_enter_background(&self) {
        let state = self.state.lock().await;
        if !matches!(state.load_state, WidgetLoadState::Loaded(_)) {
            return;
        }
        if let Some(surface) = self.surface() {
            self.save_snapshot(surface.as_ref()).await;
        }
    }

    /// A different user became current: the archive belongs to someone else now.
    pub async fn user_switched(&self) {
        let mut state = self.state.lock().await;
        self.archive.clear().await;
        state.archived_this_session = false;
        state.snapshot_pending = false;
        info!("offline archive cleared after user switch");
    }

    // ── Content surface callbacks ─────────────────────────────────

    pub async fn surface_did_finish(&self, url: &Url) {
        let mut state = self.state.lock().await;
        let session_url = match &state.load_state {
            WidgetLoadState::LoadingLive(session_url)
            | WidgetLoadState::LoadingFromCache(session_url) => session_url.clone(),
            other => {
                debug!(%url, state = %other, "load finished outside of a load, ignored");
                return;
            }
        };

        self.set_state(&mut state, WidgetLoadState::Loaded(session_url), None);

        let Some(surface) = self.surface() else {
            return;
        };
        if state.loaded_from_cache {
            self.signal_offline_mode(!self.connectivity.is_available());
        } else if !state.archived_this_session {
            state.snapshot_pending = true;
            if self.save_snapshot(surface.as_ref()).await {
                state.archived_this_session = true;
                state.snapshot_pending = false;
            }
        }
    }

    pub async fn surface_did_fail(&self, reason: Option<String>) {
        let mut state = self.state.lock().await;
        let detail = reason.unwrap_or_else(|| "unknown error".to_string());
        self.fail(&mut state, LoadFailure::ContentLoadFailed(detail));
    }

    pub async fn surface_message(&self, body: &str) {
        match BridgeMessage::parse(body) {
            BridgeMessage::CloseRequested => {
                self.publish("ui.widget.close", EventPayload::WidgetCloseRequested);
            }
            BridgeMessage::UnreadChanged(count) => {
                self.unread.update_unread_messages_count(count);
            }
            BridgeMessage::WindowLoaded => self.retry_pending_snapshot().await,
            BridgeMessage::Ignored => debug!(body, "bridge message ignored"),
        }
    }

    async fn retry_pending_snapshot(&self) {
        let mut state = self.state.lock().await;
        let retry = state.snapshot_pending
            && !state.loaded_from_cache
            && matches!(state.load_state, WidgetLoadState::Loaded(_));
        if !retry {
            return;
        }
        let Some(surface) = self.surface() else {
            return;
        };
        if self.save_snapshot(surface.as_ref()).await {
            state.archived_this_session = true;
            state.snapshot_pending = false;
        }
    }

    async fn save_snapshot(&self, surface: &dyn ContentSurface) -> bool {
        let Some(data) = surface.capture_snapshot().await else {
            debug!("content surface produced no snapshot");
            return false;
        };
        let bytes = data.len() as u64;
        if !self.archive.save_snapshot(data).await {
            return false;
        }
        self.publish("widget.archive.saved", EventPayload::SnapshotSaved { bytes });
        true
    }

    // ── Event loop ────────────────────────────────────────────────

    pub async fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::ConnectivityChanged { available } => {
                self.handle_connectivity_changed(*available).await;
            }
            EventPayload::UserInfoSent { .. } => self.handle_user_info_sent().await,
            EventPayload::SurfaceFinishedLoading { url } => match Url::parse(url) {
                Ok(url) => self.surface_did_finish(&url).await,
                Err(error) => warn!(%error, url = %url, "surface reported an unparsable URL"),
            },
            EventPayload::SurfaceFailedLoading { reason } => {
                self.surface_did_fail(reason.clone()).await;
            }
            EventPayload::SurfaceMessageReceived { body } => self.surface_message(body).await,
            _ => {}
        }
    }

    /// Subscription for [`run`](Self::run). Taking it before the loop is spawned means a
    /// `session.user.synced` published right after start is not missed.
    pub fn listen(&self) -> Result<EventSubscription, EventBusError> {
        self.event_bus.subscribe("{system,session,widget}.**")
    }

    pub async fn run(self: Arc<Self>, mut sub: EventSubscription) -> Result<(), WidgetError> {
        loop {
            match sub.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, widget controller stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "widget controller lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "widget controller subscription error");
                    return Err(e.into());
                }
            }
        }
    }
}
