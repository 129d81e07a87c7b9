//! Filesystem tier: `<dir>/<shard>/<fingerprint>.<ext>`, expired by mtime.
//!
//! Every operation is best-effort. Read failures count as misses and write
//! failures are logged and dropped, so a broken cache directory degrades to
//! "always render" rather than failing requests.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{fingerprint::Fingerprint, request::OutputFormat};

const SOURCE: &str = "cache::local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub bytes: Bytes,
    pub format: OutputFormat,
    pub created_at: SystemTime,
}

impl CacheEntry {
    pub fn content_type(&self) -> &'static str {
        self.format.content_type()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
}

#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    root: PathBuf,
    max_age: Duration,
}

impl LocalCacheStore {
    pub fn new(root: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            root: root.into(),
            max_age,
        }
    }

    pub fn path_for(&self, fingerprint: &Fingerprint, format: OutputFormat) -> PathBuf {
        self.root.join(fingerprint.sharded_name(format))
    }

    /// Cached bytes for `fingerprint`, or `None` when absent, expired, or unreadable.
    ///
    /// An expired entry is deleted as part of the read.
    pub async fn get(&self, fingerprint: &Fingerprint, format: OutputFormat) -> Option<CacheEntry> {
        let path = self.path_for(fingerprint, format);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "local::get",
                    result = "stat_error",
                    path = %path.display(),
                    error = %err,
                    "Failed to stat cache entry; treating as miss"
                );
                return None;
            }
        };

        let created_at = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if self.is_expired(created_at) {
            debug!(
                target = SOURCE,
                op = "local::get",
                result = "expired",
                fingerprint = %fingerprint,
                "Evicting expired cache entry"
            );
            remove_quietly(&path).await;
            return None;
        }

        match fs::read(&path).await {
            Ok(bytes) => Some(CacheEntry {
                fingerprint: fingerprint.clone(),
                bytes: Bytes::from(bytes),
                format,
                created_at,
            }),
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(
                        target = SOURCE,
                        op = "local::get",
                        result = "read_error",
                        path = %path.display(),
                        error = %err,
                        "Failed to read cache entry; treating as miss"
                    );
                }
                None
            }
        }
    }

    /// Store `bytes` under `fingerprint`. Returns whether the entry landed on disk.
    ///
    /// Writes go to a uniquely named sibling first and are renamed into place,
    /// so readers never observe a partially written entry.
    pub async fn put(&self, fingerprint: &Fingerprint, format: OutputFormat, bytes: &[u8]) -> bool {
        let path = self.path_for(fingerprint, format);
        let staging = path.with_extension(format!("{}.{}.tmp", format.extension(), Uuid::new_v4()));

        let result = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&staging, bytes).await?;
            fs::rename(&staging, &path).await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(
                    target = SOURCE,
                    op = "local::put",
                    result = "stored",
                    fingerprint = %fingerprint,
                    bytes = bytes.len(),
                    "Cached rendered diagram"
                );
                true
            }
            Err(err) => {
                warn!(
                    target = SOURCE,
                    op = "local::put",
                    result = "write_error",
                    path = %path.display(),
                    error = %err,
                    "Failed to cache rendered diagram"
                );
                remove_quietly(&staging).await;
                false
            }
        }
    }

    /// Delete every expired entry (and abandoned staging file) under the root.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(shards) => shards,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(
                        target = SOURCE,
                        op = "local::sweep",
                        root = %self.root.display(),
                        error = %err,
                        "Failed to list cache directory"
                    );
                }
                return report;
            }
        };

        while let Ok(Some(shard)) = shards.next_entry().await {
            let Ok(mut entries) = fs::read_dir(shard.path()).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                report.scanned += 1;
                let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if self.is_expired(modified) && fs::remove_file(entry.path()).await.is_ok() {
                    report.removed += 1;
                }
            }
        }

        info!(
            target = SOURCE,
            op = "local::sweep",
            scanned = report.scanned,
            removed = report.removed,
            "Local cache sweep finished"
        );
        report
    }

    fn is_expired(&self, created_at: SystemTime) -> bool {
        SystemTime::now()
            .duration_since(created_at)
            .is_ok_and(|age| age > self.max_age)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != ErrorKind::NotFound
    {
        debug!(
            target = SOURCE,
            path = %path.display(),
            error = %err,
            "Failed to remove cache file"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use tempfile::TempDir;

    use super::*;
    use crate::domain::request::RenderRequestDraft;

    const HOUR: Duration = Duration::from_secs(3600);

    fn fingerprint(code: &str) -> Fingerprint {
        Fingerprint::of(&RenderRequestDraft::new(code).validate().expect("valid"))
    }

    fn backdate(path: &Path, by: Duration) {
        let file = File::options().write(true).open(path).expect("open entry");
        file.set_modified(SystemTime::now() - by).expect("set mtime");
    }

    #[tokio::test]
    async fn stored_entry_is_read_back_from_sharded_path() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalCacheStore::new(dir.path(), HOUR);
        let fp = fingerprint("graph TD\nA-->B");

        assert!(store.get(&fp, OutputFormat::Svg).await.is_none());
        assert!(store.put(&fp, OutputFormat::Svg, b"<svg/>").await);

        let entry = store.get(&fp, OutputFormat::Svg).await.expect("hit");
        assert_eq!(&entry.bytes[..], b"<svg/>");
        assert_eq!(entry.content_type(), "image/svg+xml");
        let expected = dir.path().join(fp.shard()).join(format!("{fp}.svg"));
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_and_is_deleted() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalCacheStore::new(dir.path(), HOUR);
        let fp = fingerprint("graph TD\nA-->B");
        store.put(&fp, OutputFormat::Png, b"png").await;
        let path = store.path_for(&fp, OutputFormat::Png);
        backdate(&path, 2 * HOUR);

        assert!(store.get(&fp, OutputFormat::Png).await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unwritable_directory_is_swallowed() {
        let dir = TempDir::new().expect("temp dir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write blocker");
        let store = LocalCacheStore::new(&blocker, HOUR);
        let fp = fingerprint("graph TD\nA-->B");

        assert!(!store.put(&fp, OutputFormat::Svg, b"<svg/>").await);
        assert!(store.get(&fp, OutputFormat::Svg).await.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalCacheStore::new(dir.path(), HOUR);
        let fresh = fingerprint("graph TD\nA-->B");
        let stale = fingerprint("graph TD\nB-->C");
        store.put(&fresh, OutputFormat::Svg, b"fresh").await;
        store.put(&stale, OutputFormat::Svg, b"stale").await;
        backdate(&store.path_for(&stale, OutputFormat::Svg), 3 * HOUR);

        let report = store.sweep().await;

        assert_eq!(report, SweepReport { scanned: 2, removed: 1 });
        assert!(store.get(&fresh, OutputFormat::Svg).await.is_some());
        assert!(!store.path_for(&stale, OutputFormat::Svg).exists());
    }

    #[tokio::test]
    async fn sweep_of_missing_root_is_empty() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalCacheStore::new(dir.path().join("absent"), HOUR);
        assert_eq!(store.sweep().await, SweepReport::default());
    }
}
