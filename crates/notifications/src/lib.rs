use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};
use url::Url;

use sabycom_core::error::EventBusError;
use sabycom_core::event::{
    Event, EventBus, EventPayload, EventSource, EventSubscription, publish_event,
};

mod push;

pub use push::{NotificationModel, is_sabycom_push};

const BANNER_SOURCE: &str = "banner";

#[derive(Debug, thiserror::Error)]
pub enum BannerError {
    #[error("banner presentation failed: {0}")]
    PresentationFailed(String),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

/// What the banner shows. `anchor` names the host view it is attached to.
#[derive(Debug, Clone, PartialEq)]
pub struct Banner {
    pub notification_id: String,
    pub title: String,
    pub body: String,
    pub avatar_url: Option<Url>,
    pub unread_count: u32,
    pub anchor: String,
}

impl Banner {
    fn from_model(model: &NotificationModel, anchor: &str) -> Self {
        Self {
            notification_id: model.id.clone(),
            title: model.title.clone(),
            body: model.body.clone(),
            avatar_url: model.avatar_url.clone(),
            unread_count: model.unread_count,
            anchor: anchor.to_string(),
        }
    }
}

/// Host-side drawing of the banner. Calls arrive in order: `present`, any number of `update`,
/// then `dismiss`.
pub trait BannerPresenter: Send + Sync {
    fn present(&self, banner: &Banner) -> Result<(), BannerError>;
    fn update(&self, banner: &Banner) -> Result<(), BannerError>;
    fn dismiss(&self) -> Result<(), BannerError>;
}

/// Owns the single in-app message banner.
pub struct BannerController {
    presenter: Arc<dyn BannerPresenter>,
    event_bus: Arc<dyn EventBus>,
    displayed: Mutex<Option<Banner>>,
}

impl BannerController {
    pub fn new(presenter: Arc<dyn BannerPresenter>, event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            presenter,
            event_bus,
            displayed: Mutex::new(None),
        }
    }

    pub fn is_displayed(&self) -> bool {
        self.displayed.lock().unwrap().is_some()
    }

    pub fn displayed(&self) -> Option<Banner> {
        self.displayed.lock().unwrap().clone()
    }

    /// Show `model` over `anchor`, replacing the content of a banner already on screen.
    /// Nothing is shown for a push that carries no unread messages.
    pub fn show(&self, model: &NotificationModel, anchor: &str) -> bool {
        if model.unread_count == 0 {
            debug!(notification_id = %model.id, "push without unread messages, banner skipped");
            return false;
        }

        let banner = Banner::from_model(model, anchor);
        {
            let mut displayed = self.displayed.lock().unwrap();
            let result = if displayed.is_some() {
                self.presenter.update(&banner)
            } else {
                self.presenter.present(&banner)
            };
            if let Err(error) = result {
                error!(error = %error, "failed to present banner");
                return false;
            }
            *displayed = Some(banner);
        }

        self.publish(
            "ui.banner.shown",
            EventPayload::BannerShown {
                notification_id: model.id.clone(),
            },
        );
        true
    }

    /// Remove the banner if one is on screen.
    pub fn hide(&self) -> Option<Banner> {
        let hidden = self.displayed.lock().unwrap().take()?;
        if let Err(error) = self.presenter.dismiss() {
            error!(error = %error, "failed to dismiss banner");
        }
        self.publish("ui.banner.hidden", EventPayload::BannerHidden);
        Some(hidden)
    }

    /// The user tapped the banner: hide it and ask the host to open the conversation.
    pub fn tap(&self) {
        let notification_id = self.hide().map(|banner| banner.notification_id);
        self.publish(
            "ui.session.open",
            EventPayload::OpenSessionRequested { notification_id },
        );
    }

    fn update_unread_count(&self, count: u32) {
        let mut displayed = self.displayed.lock().unwrap();
        let Some(banner) = displayed.as_mut() else {
            return;
        };
        if banner.unread_count == count {
            return;
        }
        banner.unread_count = count;
        if let Err(error) = self.presenter.update(banner) {
            error!(error = %error, "failed to update banner");
        }
    }

    pub fn handle_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::UnreadCountChanged { count: 0 } => {
                self.hide();
            }
            EventPayload::UnreadCountChanged { count } => self.update_unread_count(*count),
            _ => {}
        }
    }

    pub fn listen(&self) -> Result<EventSubscription, EventBusError> {
        self.event_bus.subscribe("ui.unread.changed")
    }

    pub async fn run(
        self: Arc<Self>,
        mut subscription: EventSubscription,
    ) -> Result<(), BannerError> {
        loop {
            match subscription.recv().await {
                Ok(event) => self.handle_event(&event),
                Err(EventBusError::ChannelClosed) => {
                    debug!("event bus closed, banner controller stopping");
                    return Ok(());
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "banner controller lagged, some events dropped");
                }
                Err(error) => {
                    error!(error = %error, "banner controller subscription error");
                    return Err(error.into());
                }
            }
        }
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        if let Err(error) = publish_event(
            self.event_bus.as_ref(),
            channel,
            EventSource::System(BANNER_SOURCE.to_string()),
            payload,
        ) {
            warn!(%error, channel, "failed to publish banner event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use sabycom_core::event::{BroadcastEventBus, Channel, EventSubscription};
    use sabycom_test_support::fixtures;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Present(Banner),
        Update(Banner),
        Dismiss,
    }

    #[derive(Default)]
    struct RecordingPresenter {
        calls: Mutex<Vec<Call>>,
        fail: AtomicBool,
    }

    impl RecordingPresenter {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::Relaxed);
        }

        fn record(&self, call: Call) -> Result<(), BannerError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(BannerError::PresentationFailed("forced failure".to_string()));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    impl BannerPresenter for RecordingPresenter {
        fn present(&self, banner: &Banner) -> Result<(), BannerError> {
            self.record(Call::Present(banner.clone()))
        }

        fn update(&self, banner: &Banner) -> Result<(), BannerError> {
            self.record(Call::Update(banner.clone()))
        }

        fn dismiss(&self) -> Result<(), BannerError> {
            self.record(Call::Dismiss)
        }
    }

    fn make_controller() -> (
        Arc<BannerController>,
        Arc<RecordingPresenter>,
        Arc<dyn EventBus>,
    ) {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        let presenter = Arc::new(RecordingPresenter::default());
        let controller = Arc::new(BannerController::new(presenter.clone(), event_bus.clone()));
        (controller, presenter, event_bus)
    }

    fn make_model() -> NotificationModel {
        NotificationModel::parse(&fixtures::push("new-message.json")).unwrap()
    }

    fn make_unread_event(count: u32) -> Event {
        Event::new(
            Channel::new("ui.unread.changed").unwrap(),
            EventSource::System("test".to_string()),
            EventPayload::UnreadCountChanged { count },
        )
    }

    async fn next_payload(sub: &mut EventSubscription) -> Option<EventPayload> {
        timeout(Duration::from_millis(100), sub.recv())
            .await
            .ok()
            .and_then(Result::ok)
            .map(|event| event.payload)
    }

    // ── Show / hide ───────────────────────────────────────────────

    #[tokio::test]
    async fn show_presents_banner_and_announces_it() {
        let (controller, presenter, bus) = make_controller();
        let mut sub = bus.subscribe("ui.banner.*").unwrap();

        assert!(controller.show(&make_model(), "root"));

        let calls = presenter.calls();
        assert_eq!(calls.len(), 1);
        let Call::Present(banner) = &calls[0] else {
            panic!("expected present, got {:?}", calls[0]);
        };
        assert_eq!(banner.title, "Support");
        assert_eq!(banner.unread_count, 3);
        assert_eq!(banner.anchor, "root");
        assert!(matches!(
            next_payload(&mut sub).await,
            Some(EventPayload::BannerShown { notification_id })
                if notification_id == "5f1c2a7e-0d9b-4c2e-9a51-2f3e4d5c6b7a"
        ));
    }

    #[tokio::test]
    async fn zero_unread_push_is_not_shown() {
        let (controller, presenter, _bus) = make_controller();
        let model = NotificationModel::parse(&fixtures::push("zero-unread.json")).unwrap();

        assert!(!controller.show(&model, "root"));
        assert!(presenter.calls().is_empty());
        assert!(!controller.is_displayed());
    }

    #[tokio::test]
    async fn second_show_updates_in_place() {
        let (controller, presenter, _bus) = make_controller();
        let mut model = make_model();
        controller.show(&model, "root");
        model.unread_count = 4;
        controller.show(&model, "root");

        let calls = presenter.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[1], Call::Update(banner) if banner.unread_count == 4));
    }

    #[tokio::test]
    async fn hide_without_banner_is_noop() {
        let (controller, presenter, _bus) = make_controller();
        assert!(controller.hide().is_none());
        assert!(presenter.calls().is_empty());
    }

    #[tokio::test]
    async fn tap_hides_and_requests_session() {
        let (controller, presenter, bus) = make_controller();
        let mut sub = bus.subscribe("ui.session.open").unwrap();
        controller.show(&make_model(), "root");

        controller.tap();

        assert_eq!(presenter.calls().last(), Some(&Call::Dismiss));
        assert!(!controller.is_displayed());
        assert!(matches!(
            next_payload(&mut sub).await,
            Some(EventPayload::OpenSessionRequested { notification_id: Some(_) })
        ));
    }

    // ── Unread count ──────────────────────────────────────────────

    #[tokio::test]
    async fn unread_reaching_zero_hides_banner() {
        let (controller, presenter, _bus) = make_controller();
        controller.show(&make_model(), "root");

        controller.handle_event(&make_unread_event(0));

        assert!(!controller.is_displayed());
        assert_eq!(presenter.calls().last(), Some(&Call::Dismiss));
    }

    #[tokio::test]
    async fn unread_change_refreshes_badge() {
        let (controller, presenter, _bus) = make_controller();
        controller.show(&make_model(), "root");

        controller.handle_event(&make_unread_event(5));
        controller.handle_event(&make_unread_event(5));

        assert_eq!(presenter.calls().len(), 2);
        assert_eq!(controller.displayed().unwrap().unread_count, 5);
    }

    #[tokio::test]
    async fn run_loop_reacts_to_bus() {
        let (controller, _presenter, bus) = make_controller();
        let handle = tokio::spawn(controller.clone().run(controller.listen().unwrap()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.show(&make_model(), "root");

        bus.publish(make_unread_event(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!controller.is_displayed());
        handle.abort();
    }

    // ── Failures ──────────────────────────────────────────────────

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn presenter_failures_are_non_fatal() {
        let (controller, presenter, _bus) = make_controller();
        presenter.set_fail(true);

        assert!(!controller.show(&make_model(), "root"));
        assert!(!controller.is_displayed());
        assert!(logs_contain("failed to present banner"));
    }
}
