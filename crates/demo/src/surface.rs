use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use sabycom_core::event::{EventBus, EventPayload, EventSource, publish_event};
use sabycom_core::surface::ContentSurface;

use crate::error::DemoError;

/// A content surface without a renderer: fetches the page body over HTTP (or reads the
/// archive from disk) and reports the outcome on the event bus.
pub struct HttpContentSurface {
    client: Client,
    event_bus: Arc<dyn EventBus>,
    last_body: Arc<Mutex<Option<Vec<u8>>>>,
    /// Bumped by every `load`; a finished load that is no longer the latest is dropped.
    generation: Arc<AtomicU64>,
}

impl HttpContentSurface {
    pub fn new(event_bus: Arc<dyn EventBus>, timeout: Duration) -> Result<Self, DemoError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            event_bus,
            last_body: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }
}

async fn fetch(client: &Client, url: &Url) -> Result<Vec<u8>, String> {
    if url.scheme() == "file" {
        let path = url
            .to_file_path()
            .map_err(|_| format!("not a local file: {url}"))?;
        return tokio::fs::read(&path)
            .await
            .map_err(|error| format!("failed to read {}: {error}", path.display()));
    }

    let response = client
        .get(url.clone())
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|error| error.to_string())?;
    let body = response.bytes().await.map_err(|error| error.to_string())?;
    Ok(body.to_vec())
}

#[async_trait]
impl ContentSurface for HttpContentSurface {
    fn load(&self, url: &Url, from_cache: bool) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let latest = self.generation.clone();
        let client = self.client.clone();
        let event_bus = self.event_bus.clone();
        let last_body = self.last_body.clone();
        let url = url.clone();

        tokio::spawn(async move {
            let result = fetch(&client, &url).await;
            if latest.load(Ordering::SeqCst) != generation {
                debug!(%url, "superseded load dropped");
                return;
            }

            let (channel, payload) = match result {
                Ok(body) => {
                    info!(%url, bytes = body.len(), from_cache, "surface finished loading");
                    *last_body.lock().unwrap() = Some(body);
                    (
                        "widget.surface.finished",
                        EventPayload::SurfaceFinishedLoading {
                            url: url.to_string(),
                        },
                    )
                }
                Err(reason) => {
                    warn!(%url, reason = %reason, "surface failed loading");
                    (
                        "widget.surface.failed",
                        EventPayload::SurfaceFailedLoading {
                            reason: Some(reason),
                        },
                    )
                }
            };

            if let Err(error) =
                publish_event(event_bus.as_ref(), channel, EventSource::Surface, payload)
            {
                warn!(%error, "failed to publish surface event");
            }
        });
    }

    fn evaluate_script(&self, script: &str) {
        debug!(script, "script evaluated");
    }

    async fn capture_snapshot(&self) -> Option<Vec<u8>> {
        self.last_body.lock().unwrap().clone()
    }

    fn forget_site_data(&self, url: &Url) {
        info!(%url, "site data forgotten");
    }
}
