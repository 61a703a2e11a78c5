use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::task;
use tracing::{debug, warn};

pub const ARCHIVE_FILE_NAME: &str = "sabycom.webarchive";

/// Single-slot store for the last rendered widget snapshot.
///
/// Every operation is best-effort: failures are logged and reported as
/// `false`/`None`, never as errors.
#[derive(Debug, Clone)]
pub struct OfflineArchive {
    dir: PathBuf,
}

impl OfflineArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_FILE_NAME)
    }

    /// Replace the stored snapshot. The old one stays intact if the write fails.
    pub async fn save_snapshot(&self, data: Vec<u8>) -> bool {
        let dir = self.dir.clone();
        let target = self.path();
        let bytes = data.len();

        let result = task::spawn_blocking(move || write_atomically(&dir, &target, &data)).await;
        match result {
            Ok(Ok(())) => {
                debug!(bytes, "offline archive saved");
                true
            }
            Ok(Err(error)) => {
                warn!(%error, path = %self.path().display(), "failed to save offline archive");
                false
            }
            Err(error) => {
                warn!(%error, "offline archive save task failed");
                false
            }
        }
    }

    pub async fn snapshot_location(&self) -> Option<PathBuf> {
        let path = self.path();
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Some(path),
            Ok(_) => None,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => {
                warn!(%error, path = %path.display(), "failed to inspect offline archive");
                None
            }
        }
    }

    pub async fn clear(&self) {
        let path = self.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("offline archive cleared"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => warn!(%error, path = %path.display(), "failed to clear offline archive"),
        }
    }
}

fn write_atomically(dir: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(target).map_err(|error| error.error)?;
    Ok(())
}
