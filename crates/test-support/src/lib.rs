pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    /// A push payload from `push/`, parsed into a JSON value.
    pub fn push(name: &str) -> serde_json::Value {
        let relative = Path::new("push").join(name);
        let raw = read_or_panic(&relative);
        serde_json::from_str(&raw).unwrap_or_else(|error| {
            panic!(
                "fixture {} is not valid json: {error}",
                relative.to_string_lossy()
            )
        })
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

pub mod fakes {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::watch;
    use url::Url;

    use sabycom_api::{ApiError, RemoteApi, UserSync};
    use sabycom_core::surface::ContentSurface;

    fn fake_failure() -> ApiError {
        ApiError::Status {
            status: 503,
            body: "fake failure".to_string(),
        }
    }

    /// Scriptable [`RemoteApi`] that counts calls and can hold registrations open.
    pub struct FakeRemoteApi {
        unread: AtomicU32,
        fail_unread: AtomicBool,
        fail_register: AtomicBool,
        unread_calls: AtomicUsize,
        registrations: Mutex<Vec<UserSync>>,
        gate: watch::Sender<bool>,
    }

    impl Default for FakeRemoteApi {
        fn default() -> Self {
            let (gate, _) = watch::channel(true);
            Self {
                unread: AtomicU32::new(0),
                fail_unread: AtomicBool::new(false),
                fail_register: AtomicBool::new(false),
                unread_calls: AtomicUsize::new(0),
                registrations: Mutex::new(Vec::new()),
                gate,
            }
        }
    }

    impl FakeRemoteApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_unread(count: u32) -> Self {
            let api = Self::default();
            api.set_unread(count);
            api
        }

        pub fn set_unread(&self, count: u32) {
            self.unread.store(count, Ordering::SeqCst);
        }

        pub fn fail_unread(&self, fail: bool) {
            self.fail_unread.store(fail, Ordering::SeqCst);
        }

        pub fn fail_register(&self, fail: bool) {
            self.fail_register.store(fail, Ordering::SeqCst);
        }

        /// Park every `register_user` call until [`release_registrations`](Self::release_registrations).
        pub fn hold_registrations(&self) {
            self.gate.send_replace(false);
        }

        pub fn release_registrations(&self) {
            self.gate.send_replace(true);
        }

        pub fn unread_calls(&self) -> usize {
            self.unread_calls.load(Ordering::SeqCst)
        }

        pub fn registrations(&self) -> Vec<UserSync> {
            self.registrations.lock().unwrap().clone()
        }

        pub fn registration_count(&self) -> usize {
            self.registrations.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RemoteApi for FakeRemoteApi {
        async fn unread_count(&self, _user_id: &str, _channel_id: &str) -> Result<u32, ApiError> {
            self.unread_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_unread.load(Ordering::SeqCst) {
                return Err(fake_failure());
            }
            Ok(self.unread.load(Ordering::SeqCst))
        }

        async fn register_user(&self, sync: &UserSync) -> Result<String, ApiError> {
            self.registrations.lock().unwrap().push(sync.clone());

            let mut gate = self.gate.subscribe();
            let opened = gate.wait_for(|open| *open).await.is_ok();

            if !opened || self.fail_register.load(Ordering::SeqCst) {
                return Err(fake_failure());
            }
            Ok(sync.user.id.clone())
        }
    }

    pub const DEFAULT_SNAPSHOT: &[u8] = b"<html><body>widget</body></html>";

    /// [`ContentSurface`] that only remembers what it was asked to do.
    pub struct RecordingSurface {
        loads: Mutex<Vec<(Url, bool)>>,
        scripts: Mutex<Vec<String>>,
        forgotten: Mutex<Vec<Url>>,
        snapshot: Mutex<Option<Vec<u8>>>,
        snapshot_calls: AtomicUsize,
    }

    impl Default for RecordingSurface {
        fn default() -> Self {
            Self {
                loads: Mutex::new(Vec::new()),
                scripts: Mutex::new(Vec::new()),
                forgotten: Mutex::new(Vec::new()),
                snapshot: Mutex::new(Some(DEFAULT_SNAPSHOT.to_vec())),
                snapshot_calls: AtomicUsize::new(0),
            }
        }
    }

    impl RecordingSurface {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_snapshot(&self, snapshot: Option<Vec<u8>>) {
            *self.snapshot.lock().unwrap() = snapshot;
        }

        pub fn loads(&self) -> Vec<(Url, bool)> {
            self.loads.lock().unwrap().clone()
        }

        pub fn last_load(&self) -> Option<(Url, bool)> {
            self.loads.lock().unwrap().last().cloned()
        }

        pub fn live_load_count(&self) -> usize {
            self.loads
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, from_cache)| !from_cache)
                .count()
        }

        pub fn scripts(&self) -> Vec<String> {
            self.scripts.lock().unwrap().clone()
        }

        pub fn forgotten(&self) -> Vec<Url> {
            self.forgotten.lock().unwrap().clone()
        }

        pub fn snapshot_calls(&self) -> usize {
            self.snapshot_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentSurface for RecordingSurface {
        fn load(&self, url: &Url, from_cache: bool) {
            self.loads.lock().unwrap().push((url.clone(), from_cache));
        }

        fn evaluate_script(&self, script: &str) {
            self.scripts.lock().unwrap().push(script.to_string());
        }

        async fn capture_snapshot(&self) -> Option<Vec<u8>> {
            self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            self.snapshot.lock().unwrap().clone()
        }

        fn forget_site_data(&self, url: &Url) {
            self.forgotten.lock().unwrap().push(url.clone());
        }
    }
}
