use async_trait::async_trait;
use url::Url;

/// The embedded browser the widget renders into.
///
/// Load outcomes are not returned from [`ContentSurface::load`]; the surface reports them
/// later as `widget.surface.finished` / `widget.surface.failed` events (or by calling the
/// controller directly). A new `load` supersedes any load still in flight.
#[async_trait]
pub trait ContentSurface: Send + Sync {
    /// Start loading `url`. With `from_cache` set, `url` points at the offline archive.
    fn load(&self, url: &Url, from_cache: bool);

    /// Fire-and-forget script injection.
    fn evaluate_script(&self, script: &str);

    /// Serialize whatever is currently rendered, if anything is.
    async fn capture_snapshot(&self) -> Option<Vec<u8>>;

    /// Drop cookies and site data that belong to `url`.
    fn forget_site_data(&self, _url: &Url) {}
}
