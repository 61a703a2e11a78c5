use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use sabycom_core::config::ConnectivityConfig;
use sabycom_core::error::EventBusError;
use sabycom_core::event::{
    EventBus, EventPayload, EventSource, EventSubscription, publish_event,
};

const CONNECTIVITY_SOURCE: &str = "connectivity";
const CONNECTIVITY_CHANNEL: &str = "system.connectivity.changed";

#[derive(Debug, thiserror::Error)]
pub enum ConnectivityError {
    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

/// Tracks whether the network is reachable and announces every actual flip.
pub struct ConnectivityMonitor {
    /// Guarded so that compare, store and publish happen as one step.
    available: Mutex<bool>,
    event_bus: Arc<dyn EventBus>,
}

impl ConnectivityMonitor {
    pub fn new(event_bus: Arc<dyn EventBus>, initially_available: bool) -> Self {
        Self {
            available: Mutex::new(initially_available),
            event_bus,
        }
    }

    pub fn is_available(&self) -> bool {
        *self.available.lock().unwrap()
    }

    /// Feed a reachability reading. Returns `true` when it changed the state;
    /// repeated identical readings are swallowed.
    pub fn report(&self, available: bool) -> bool {
        let mut current = self.available.lock().unwrap();
        if *current == available {
            return false;
        }
        *current = available;

        info!(available, "connectivity changed");
        if let Err(error) = publish_event(
            self.event_bus.as_ref(),
            CONNECTIVITY_CHANNEL,
            EventSource::System(CONNECTIVITY_SOURCE.to_string()),
            EventPayload::ConnectivityChanged { available },
        ) {
            warn!(%error, "failed to publish connectivity change");
        }
        true
    }

    /// Observe changes until the returned handle is dropped.
    pub fn subscribe(&self) -> Result<ConnectivitySubscription, ConnectivityError> {
        Ok(ConnectivitySubscription {
            inner: self.event_bus.subscribe(CONNECTIVITY_CHANNEL)?,
        })
    }
}

pub struct ConnectivitySubscription {
    inner: EventSubscription,
}

impl ConnectivitySubscription {
    /// Wait for the next availability flip.
    pub async fn changed(&mut self) -> Result<bool, ConnectivityError> {
        loop {
            match self.inner.recv().await {
                Ok(event) => {
                    if let EventPayload::ConnectivityChanged { available } = event.payload {
                        return Ok(available);
                    }
                }
                Err(EventBusError::Lagged(count)) => {
                    warn!(count, "connectivity subscriber lagged");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

/// Periodic TCP reachability check for hosts without an OS-level signal.
pub struct ReachabilityProbe {
    monitor: Arc<ConnectivityMonitor>,
    host: String,
    port: u16,
    every: Duration,
    connect_timeout: Duration,
}

impl ReachabilityProbe {
    pub fn new(monitor: Arc<ConnectivityMonitor>, config: &ConnectivityConfig) -> Self {
        Self {
            monitor,
            host: config.probe_host.clone(),
            port: config.probe_port,
            every: Duration::from_secs(config.probe_interval_seconds),
            connect_timeout: Duration::from_secs(config.probe_timeout_seconds),
        }
    }

    pub async fn probe_once(&self) -> bool {
        match timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(error)) => {
                debug!(%error, host = %self.host, "reachability probe failed");
                false
            }
            Err(_) => {
                debug!(host = %self.host, "reachability probe timed out");
                false
            }
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let reachable = self.probe_once().await;
            self.monitor.report(reachable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sabycom_core::event::BroadcastEventBus;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn make_monitor(initial: bool) -> Arc<ConnectivityMonitor> {
        let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
        Arc::new(ConnectivityMonitor::new(event_bus, initial))
    }

    fn probe_config(port: u16) -> ConnectivityConfig {
        ConnectivityConfig {
            probe_host: "127.0.0.1".to_string(),
            probe_port: port,
            probe_interval_seconds: 1,
            probe_timeout_seconds: 1,
        }
    }

    async fn drain(sub: &mut ConnectivitySubscription) -> Vec<bool> {
        let mut seen = Vec::new();
        while let Ok(Ok(available)) = timeout(Duration::from_millis(50), sub.changed()).await {
            seen.push(available);
        }
        seen
    }

    // ── Deduplication ─────────────────────────────────────────────

    #[tokio::test]
    async fn reports_initial_state() {
        assert!(make_monitor(true).is_available());
        assert!(!make_monitor(false).is_available());
    }

    #[tokio::test]
    async fn identical_readings_are_suppressed() {
        let monitor = make_monitor(true);
        let mut sub = monitor.subscribe().unwrap();

        assert!(!monitor.report(true));
        assert!(drain(&mut sub).await.is_empty());
    }

    #[tokio::test]
    async fn notifies_once_per_actual_flip() {
        let monitor = make_monitor(true);
        let mut sub = monitor.subscribe().unwrap();

        for reading in [false, false, true, true, true, false, true] {
            monitor.report(reading);
        }

        assert_eq!(drain(&mut sub).await, vec![false, true, false, true]);
        assert!(monitor.is_available());
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_change() {
        let monitor = make_monitor(false);
        let mut first = monitor.subscribe().unwrap();
        let mut second = monitor.subscribe().unwrap();

        monitor.report(true);

        assert_eq!(drain(&mut first).await, vec![true]);
        assert_eq!(drain(&mut second).await, vec![true]);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_observing() {
        let monitor = make_monitor(true);
        let sub = monitor.subscribe().unwrap();
        drop(sub);

        assert!(monitor.report(false));
        assert!(!monitor.is_available());
    }

    // ── Probe ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn probe_succeeds_against_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = ReachabilityProbe::new(make_monitor(false), &probe_config(port));

        assert!(probe.probe_once().await);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn probe_fails_against_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = ReachabilityProbe::new(make_monitor(true), &probe_config(port));

        assert!(!probe.probe_once().await);
        assert!(logs_contain("reachability probe"));
    }

    #[tokio::test]
    async fn running_probe_feeds_monitor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let monitor = make_monitor(false);
        let mut sub = monitor.subscribe().unwrap();

        let handle = tokio::spawn(ReachabilityProbe::new(monitor.clone(), &probe_config(port)).run());
        let available = timeout(Duration::from_secs(2), sub.changed())
            .await
            .expect("probe never reported")
            .unwrap();
        handle.abort();

        assert!(available);
        assert!(monitor.is_available());
    }
}
