use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sabycom_api::{RemoteApi, UserSync};
use sabycom_core::error::EventBusError;
use sabycom_core::event::{
    Event, EventBus, EventPayload, EventSource, EventSubscription, publish_event,
};
use sabycom_core::model::{PushToken, SessionConfig, User};
use sabycom_storage::{KeyValueStore, KvError, keys};

const SESSION_SOURCE: &str = "session";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("key-value storage error: {0}")]
    Kv(#[from] KvError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("failed to serialize user: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct RegistryState {
    user: Option<User>,
    current_user_id: Option<String>,
    session: Option<SessionConfig>,
    push_token: Option<PushToken>,
    user_info_sent: bool,
    /// Bumped on every user, session or push token change.
    generation: u64,
    syncing: Option<u64>,
}

impl RegistryState {
    fn invalidate(&mut self) {
        self.generation += 1;
        self.user_info_sent = false;
    }
}

/// Owns who the widget talks as and whether the backend knows about it yet.
pub struct UserRegistry {
    kv: Arc<dyn KeyValueStore>,
    api: Arc<dyn RemoteApi>,
    event_bus: Arc<dyn EventBus>,
    state: Mutex<RegistryState>,
}

impl UserRegistry {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        api: Arc<dyn RemoteApi>,
        event_bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            kv,
            api,
            event_bus,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Load the persisted current user id and sync flag from the previous run.
    pub async fn restore(&self) -> Result<(), SessionError> {
        let current_user_id = self.kv.get(keys::CURRENT_USER_ID).await?;
        let user_info_sent = self
            .kv
            .get(keys::USER_INFO_SENT)
            .await?
            .is_some_and(|flag| flag == "true");

        debug!(?current_user_id, user_info_sent, "user registry restored");
        let mut state = self.state.lock().unwrap();
        state.current_user_id = current_user_id;
        state.user_info_sent = user_info_sent;
        Ok(())
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.state.lock().unwrap().current_user_id.clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.state.lock().unwrap().user.clone()
    }

    pub fn session_config(&self) -> Option<SessionConfig> {
        self.state.lock().unwrap().session.clone()
    }

    pub fn push_token(&self) -> Option<PushToken> {
        self.state.lock().unwrap().push_token.clone()
    }

    /// Whether the current user, app id and push token have been accepted by the backend.
    pub fn user_info_sent(&self) -> bool {
        self.state.lock().unwrap().user_info_sent
    }

    pub fn subscribe(&self, pattern: &str) -> Result<EventSubscription, SessionError> {
        Ok(self.event_bus.subscribe(pattern)?)
    }

    /// Make `user` current and forget any anonymous identity.
    ///
    /// Returns `true` when this switched to a different user id than the one active before.
    pub async fn register_user(self: &Arc<Self>, user: User) -> Result<bool, SessionError> {
        self.kv.delete(keys::ANONYMOUS_USER).await?;
        self.kv.set(keys::CURRENT_USER_ID, &user.id).await?;
        Ok(self.set_user(user))
    }

    /// Reuse the persisted anonymous user or mint a new one, and make it current.
    pub async fn register_anonymous_user(self: &Arc<Self>) -> Result<(User, bool), SessionError> {
        let stored = match self.kv.get(keys::ANONYMOUS_USER).await? {
            Some(blob) => match serde_json::from_str::<User>(&blob) {
                Ok(user) => Some(user),
                Err(error) => {
                    warn!(%error, "stored anonymous user is unreadable, minting a new one");
                    None
                }
            },
            None => None,
        };

        let user = match stored {
            Some(user) => user,
            None => {
                let user = User::new(Uuid::new_v4().to_string().to_uppercase());
                let blob = serde_json::to_string(&user)?;
                self.kv.set(keys::ANONYMOUS_USER, &blob).await?;
                info!(user_id = %user.id, "anonymous user created");
                user
            }
        };

        self.kv.set(keys::CURRENT_USER_ID, &user.id).await?;
        let switched = self.set_user(user.clone());
        Ok((user, switched))
    }

    pub fn set_session_config(self: &Arc<Self>, session: SessionConfig) {
        {
            let mut state = self.state.lock().unwrap();
            if state.session.as_ref() == Some(&session) {
                return;
            }
            state.session = Some(session);
            state.invalidate();
        }
        self.after_change();
    }

    pub fn set_push_token(self: &Arc<Self>, push_token: Option<PushToken>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.push_token == push_token {
                return;
            }
            state.push_token = push_token;
            state.invalidate();
        }
        self.publish("session.pushtoken.changed", EventPayload::PushTokenChanged);
        self.after_change();
    }

    /// Tell the backend to stop delivering to this device, then forget the current user.
    ///
    /// The unsubscribe call is best effort; the local identity is dropped either way.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let request = {
            let state = self.state.lock().unwrap();
            match (&state.user, &state.session) {
                (Some(user), Some(session)) => Some(
                    UserSync::new(user.clone(), session.app_id.clone())
                        .with_push_token(state.push_token.clone())
                        .unsubscribing(),
                ),
                _ => None,
            }
        };

        if let Some(request) = request {
            if let Err(error) = self.api.register_user(&request).await {
                warn!(%error, user_id = %request.user.id, "unsubscribe on logout failed");
            }
        }

        self.kv.delete(keys::CURRENT_USER_ID).await?;
        self.persist_sent_flag(false).await;

        let user_id = {
            let mut state = self.state.lock().unwrap();
            state.user = None;
            state.invalidate();
            state.current_user_id.take()
        };

        info!(?user_id, "user logged out");
        self.publish("session.user.loggedout", EventPayload::LoggedOut { user_id });
        Ok(())
    }

    fn set_user(self: &Arc<Self>, user: User) -> bool {
        let (changed, previous_user_id) = {
            let mut state = self.state.lock().unwrap();
            if state.user.as_ref() == Some(&user) {
                return false;
            }
            let previous_user_id = state
                .user
                .as_ref()
                .map(|u| u.id.clone())
                .or_else(|| state.current_user_id.clone());
            state.current_user_id = Some(user.id.clone());
            state.user = Some(user.clone());
            state.invalidate();
            (previous_user_id.as_deref() != Some(&user.id), previous_user_id)
        };

        if changed {
            info!(user_id = %user.id, ?previous_user_id, "current user changed");
            self.publish(
                "session.user.changed",
                EventPayload::UserChanged {
                    user_id: user.id.clone(),
                    previous_user_id,
                },
            );
        }
        self.after_change();
        changed
    }

    fn after_change(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.sync().await;
        });
    }

    /// Push the current user record to the backend unless it is already there.
    ///
    /// Results that arrive after a newer change are dropped. Returns whether the current
    /// combination is known to be synced.
    pub async fn sync(&self) -> bool {
        let synced = self.try_sync().await;
        self.persist_sent_flag(self.user_info_sent()).await;
        synced
    }

    async fn try_sync(&self) -> bool {
        let (request, generation) = {
            let mut state = self.state.lock().unwrap();
            if state.user_info_sent {
                return true;
            }
            if state.syncing == Some(state.generation) {
                return false;
            }
            let (Some(user), Some(session)) = (&state.user, &state.session) else {
                debug!("user sync postponed, user or app id missing");
                return false;
            };
            let request = UserSync::new(user.clone(), session.app_id.clone())
                .with_push_token(state.push_token.clone());
            state.syncing = Some(state.generation);
            (request, state.generation)
        };

        let result = self.api.register_user(&request).await;

        let newly_sent = {
            let mut state = self.state.lock().unwrap();
            if state.syncing == Some(generation) {
                state.syncing = None;
            }
            match &result {
                Ok(_) if state.generation == generation => {
                    let newly_sent = !state.user_info_sent;
                    state.user_info_sent = true;
                    newly_sent
                }
                Ok(_) => {
                    debug!(user_id = %request.user.id, "stale user sync result dropped");
                    return false;
                }
                Err(error) => {
                    warn!(%error, user_id = %request.user.id, "user sync failed");
                    return false;
                }
            }
        };

        if newly_sent {
            info!(user_id = %request.user.id, "user info sent");
            self.publish(
                "session.user.synced",
                EventPayload::UserInfoSent {
                    user_id: request.user.id.clone(),
                },
            );
        }
        true
    }

    async fn persist_sent_flag(&self, sent: bool) {
        let value = if sent { "true" } else { "false" };
        if let Err(error) = self.kv.set(keys::USER_INFO_SENT, value).await {
            warn!(%error, "failed to persist user sync flag");
        }
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        if let Err(error) = publish_event(
            self.event_bus.as_ref(),
            channel,
            EventSource::System(SESSION_SOURCE.to_string()),
            payload,
        ) {
            warn!(%error, channel, "failed to publish session event");
        }
    }

    pub async fn handle_event(&self, event: &Event) {
        if let EventPayload::ConnectivityChanged { available: true } = &event.payload {
            if !self.user_info_sent() {
                debug!("connectivity restored, retrying user sync");
                self.sync().await;
            }
        }
    }

    pub fn listen(&self) -> Result<EventSubscription, EventBusError> {
        self.event_bus.subscribe("system.connectivity.changed")
    }

    pub async fn run(self: Arc<Self>, mut sub: EventSubscription) -> Result<(), SessionError> {
        loop {
            match sub.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, user registry stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "user registry lagged, some events dropped");
                }
                Err(e) => {
                    error!(error = %e, "user registry subscription error");
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use assert_matches::assert_matches;
    use sabycom_core::event::BroadcastEventBus;
    use sabycom_core::model::{HostType, PushTokenType};
    use sabycom_storage::MemoryKeyValueStore;
    use sabycom_test_support::fakes::FakeRemoteApi;
    use tokio::time::timeout;

    const APP_ID: &str = "9b0a0a94-4e0c-4c39-8f34-6fcf8f1d1f6e";

    struct Harness {
        registry: Arc<UserRegistry>,
        api: Arc<FakeRemoteApi>,
        kv: Arc<MemoryKeyValueStore>,
        event_bus: Arc<dyn EventBus>,
    }

    fn make_registry() -> Harness {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let api = Arc::new(FakeRemoteApi::new());
        let kv = Arc::new(MemoryKeyValueStore::new());
        let registry = Arc::new(UserRegistry::new(kv.clone(), api.clone(), event_bus.clone()));
        Harness {
            registry,
            api,
            kv,
            event_bus,
        }
    }

    fn session() -> SessionConfig {
        SessionConfig::new(APP_ID, HostType::Prod)
    }

    async fn wait_synced(sub: &mut EventSubscription) -> Option<String> {
        loop {
            match timeout(Duration::from_millis(500), sub.recv()).await {
                Ok(Ok(Event {
                    payload: EventPayload::UserInfoSent { user_id },
                    ..
                })) => return Some(user_id),
                Ok(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    // ── Identity ──────────────────────────────────────────────────

    #[tokio::test]
    async fn register_user_persists_current_id_and_drops_anonymous() {
        let h = make_registry();
        h.kv.set(keys::ANONYMOUS_USER, r#"{"id":"ANON"}"#).await.unwrap();

        let switched = h.registry.register_user(User::new("u1")).await.unwrap();

        assert!(switched);
        assert_eq!(h.registry.current_user_id().as_deref(), Some("u1"));
        assert_eq!(
            h.kv.get(keys::CURRENT_USER_ID).await.unwrap().as_deref(),
            Some("u1")
        );
        assert_eq!(h.kv.get(keys::ANONYMOUS_USER).await.unwrap(), None);
    }

    #[tokio::test]
    async fn anonymous_user_is_minted_once_and_reused() {
        let h = make_registry();

        let (first, _) = h.registry.register_anonymous_user().await.unwrap();
        assert!(first.is_anonymous());
        assert!(Uuid::parse_str(&first.id).is_ok());
        assert_eq!(first.id, first.id.to_uppercase());

        let restarted = Arc::new(UserRegistry::new(
            h.kv.clone(),
            h.api.clone(),
            h.event_bus.clone(),
        ));
        let (second, _) = restarted.register_anonymous_user().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(restarted.current_user_id(), Some(first.id));
    }

    #[tokio::test]
    async fn same_user_after_restart_is_not_a_switch() {
        let h = make_registry();
        h.kv.set(keys::CURRENT_USER_ID, "u1").await.unwrap();
        h.registry.restore().await.unwrap();

        assert!(!h.registry.register_user(User::new("u1")).await.unwrap());
        assert!(h.registry.register_user(User::new("u2")).await.unwrap());
    }

    #[tokio::test]
    async fn user_change_is_published_with_previous_id() {
        let h = make_registry();
        let mut sub = h.event_bus.subscribe("session.user.changed").unwrap();

        h.registry.register_user(User::new("u1")).await.unwrap();
        h.registry.register_user(User::new("u2")).await.unwrap();

        let first = timeout(Duration::from_millis(100), sub.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_millis(100), sub.recv()).await.unwrap().unwrap();
        assert_matches!(first.payload, EventPayload::UserChanged { ref user_id, previous_user_id: None } if user_id == "u1");
        assert_matches!(
            second.payload,
            EventPayload::UserChanged { ref user_id, previous_user_id: Some(ref prev) } if user_id == "u2" && prev == "u1"
        );
    }

    // ── Sync ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn sync_waits_for_both_user_and_app_id() {
        let h = make_registry();
        let mut sub = h.event_bus.subscribe("session.user.synced").unwrap();

        h.registry.register_user(User::new("u1")).await.unwrap();
        assert!(!h.registry.sync().await);
        assert_eq!(h.api.registration_count(), 0);

        h.registry.set_session_config(session());
        assert_eq!(wait_synced(&mut sub).await.as_deref(), Some("u1"));
        assert!(h.registry.user_info_sent());
        assert_eq!(
            h.kv.get(keys::USER_INFO_SENT).await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn every_attribute_change_clears_sent_flag() {
        let h = make_registry();
        let mut sub = h.event_bus.subscribe("session.user.synced").unwrap();
        h.registry.set_session_config(session());
        h.registry.register_user(User::new("u1")).await.unwrap();
        wait_synced(&mut sub).await.unwrap();

        h.api.hold_registrations();

        h.registry
            .set_push_token(Some(PushToken::new("0aff", PushTokenType::Prod)));
        assert!(!h.registry.user_info_sent());

        h.api.release_registrations();
        wait_synced(&mut sub).await.unwrap();
        h.api.hold_registrations();

        h.registry.register_user(User::new("u1").with_name("Ivan")).await.unwrap();
        assert!(!h.registry.user_info_sent());

        h.api.release_registrations();
        wait_synced(&mut sub).await.unwrap();
        h.api.hold_registrations();

        h.registry
            .set_session_config(SessionConfig::new(APP_ID, HostType::Test));
        assert!(!h.registry.user_info_sent());
        h.api.release_registrations();
    }

    #[tokio::test]
    async fn failed_sync_stays_unsent_until_connectivity_returns() {
        let h = make_registry();
        h.api.fail_register(true);
        h.registry.set_session_config(session());
        h.registry.register_user(User::new("u1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!h.registry.user_info_sent());
        let attempts = h.api.registration_count();

        h.api.fail_register(false);
        let restored = Event::new(
            sabycom_core::event::Channel::new("system.connectivity.changed").unwrap(),
            EventSource::Host,
            EventPayload::ConnectivityChanged { available: true },
        );
        h.registry.handle_event(&restored).await;

        assert!(h.registry.user_info_sent());
        assert_eq!(h.api.registration_count(), attempts + 1);
    }

    #[tokio::test]
    async fn stale_sync_result_is_dropped() {
        let h = make_registry();
        let mut sub = h.event_bus.subscribe("session.user.synced").unwrap();
        h.registry.set_session_config(session());
        h.api.hold_registrations();

        h.registry.register_user(User::new("u1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.registry.register_user(User::new("u2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.api.release_registrations();

        assert_eq!(wait_synced(&mut sub).await.as_deref(), Some("u2"));
        assert!(wait_synced(&mut sub).await.is_none(), "u1 result arrived late");
        assert_eq!(h.api.registration_count(), 2);
    }

    #[tokio::test]
    async fn synced_notification_fires_once_per_transition() {
        let h = make_registry();
        let mut sub = h.event_bus.subscribe("session.user.synced").unwrap();
        h.registry.set_session_config(session());
        h.registry.register_user(User::new("u1")).await.unwrap();
        wait_synced(&mut sub).await.unwrap();

        assert!(h.registry.sync().await);
        assert!(wait_synced(&mut sub).await.is_none());
    }

    #[tokio::test]
    async fn restore_reads_persisted_sync_flag() {
        let h = make_registry();
        h.kv.set(keys::USER_INFO_SENT, "true").await.unwrap();
        h.registry.restore().await.unwrap();
        assert!(h.registry.user_info_sent());
    }

    // ── Logout ────────────────────────────────────────────────────

    #[tokio::test]
    async fn logout_unsubscribes_then_clears_identity() {
        let h = make_registry();
        let mut sub = h.event_bus.subscribe("session.user.**").unwrap();
        h.registry.set_session_config(session());
        h.registry.register_user(User::new("u1")).await.unwrap();
        wait_synced(&mut sub).await.unwrap();

        h.registry.logout().await.unwrap();

        let last = h.api.registrations().pop().unwrap();
        assert!(last.unsubscribe);
        assert_eq!(last.user.id, "u1");
        assert_eq!(h.registry.current_user_id(), None);
        assert!(!h.registry.user_info_sent());
        assert_eq!(h.kv.get(keys::CURRENT_USER_ID).await.unwrap(), None);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn logout_clears_identity_even_if_unsubscribe_fails() {
        let h = make_registry();
        h.registry.set_session_config(session());
        h.registry.register_user(User::new("u1")).await.unwrap();
        h.api.fail_register(true);

        h.registry.logout().await.unwrap();
        assert_eq!(h.registry.current_user_id(), None);
        assert!(logs_contain("unsubscribe on logout failed"));
    }
}
