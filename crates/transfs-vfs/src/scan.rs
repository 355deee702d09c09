//! Physical directory scans, cached.
//!
//! A `DirScan` is the unit the listing cache stores: one physical
//! directory's children with the stat hints the listing engine needs.
//! Entries are keyed by `(path, mtime_ns, size)`; a cached scan is served
//! only while the directory's current stat still matches. Population is
//! single-flight per path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use transfs_cache::{stat_pair, CacheKey, DiskStore};
use transfs_core::types::is_hidden_name;
use transfs_core::{TransFsError, TransFsResult};

/// Stat hints for one scanned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub mtime_ns: u64,
}

/// One physical directory's children, sorted by name. Hidden (dot) names
/// are never recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirScan {
    /// The scanned directory's stat at scan time
    pub mtime_ns: u64,
    pub size: u64,
    pub dirs: Vec<String>,
    pub files: Vec<FileStat>,
}

impl DirScan {
    pub fn file(&self, name: &str) -> Option<&FileStat> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn has_dir(&self, name: &str) -> bool {
        self.dirs.iter().any(|d| d == name)
    }
}

pub(crate) struct ListingCache {
    cache: moka::future::Cache<PathBuf, Arc<DirScan>>,
    store: Option<DiskStore>,
}

impl ListingCache {
    pub(crate) fn new(capacity: u64, store: Option<DiskStore>) -> Self {
        ListingCache {
            cache: moka::future::Cache::builder().max_capacity(capacity).build(),
            store,
        }
    }

    /// Scan a physical directory, read-through cached.
    pub(crate) async fn scan(&self, dir: &Path) -> TransFsResult<Arc<DirScan>> {
        let meta = tokio::fs::symlink_metadata(dir)
            .await
            .map_err(TransFsError::from_stat)?;
        if !meta.is_dir() {
            return Err(TransFsError::NotFound);
        }
        let key = CacheKey::from_metadata(dir, &meta);

        let path = dir.to_path_buf();
        if let Some(scan) = self.cache.get(&path).await {
            if scan.mtime_ns == key.mtime_ns && scan.size == key.size {
                return Ok(scan);
            }
            debug!(dir = %path.display(), "directory changed, dropping stale listing");
            self.cache.invalidate(&path).await;
        }

        let store = self.store.clone();
        let init_path = path.clone();

        self.cache
            .try_get_with(path, async move {
                if let Some(store) = &store {
                    if let Some(bytes) = store.get(&key.token()).await {
                        if let Ok(scan) = serde_json::from_slice::<DirScan>(&bytes) {
                            if scan.mtime_ns == key.mtime_ns && scan.size == key.size {
                                return Ok(Arc::new(scan));
                            }
                        }
                    }
                }

                let scan = scan_physical_dir(&init_path, key.mtime_ns, key.size).await?;

                if let Some(store) = &store {
                    match serde_json::to_vec(&scan) {
                        Ok(bytes) => {
                            if let Err(e) = store.put(&key.token(), &bytes).await {
                                warn!(dir = %init_path.display(), "failed to persist listing: {e}");
                            }
                        }
                        Err(e) => {
                            warn!(dir = %init_path.display(), "failed to serialise listing: {e}");
                        }
                    }
                }

                Ok(Arc::new(scan))
            })
            .await
            .map_err(TransFsError::from_shared)
    }
}

async fn scan_physical_dir(dir: &Path, mtime_ns: u64, size: u64) -> TransFsResult<DirScan> {
    let mut scan = DirScan {
        mtime_ns,
        size,
        dirs: Vec::new(),
        files: Vec::new(),
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(TransFsError::from_stat)?;
    while let Some(entry) = entries.next_entry().await.map_err(TransFsError::Io)? {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                debug!(dir = %dir.display(), name = ?raw, "skipping non-UTF-8 entry");
                continue;
            }
        };
        if is_hidden_name(&name) {
            continue;
        }

        // Follow symlinks so linked content participates in the view.
        let meta = match tokio::fs::metadata(entry.path()).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %entry.path().display(), "skipping unstattable entry: {e}");
                continue;
            }
        };

        if meta.is_dir() {
            scan.dirs.push(name);
        } else if meta.is_file() {
            let (file_mtime, file_size) = stat_pair(&meta);
            scan.files.push(FileStat {
                name,
                size: file_size,
                mtime_ns: file_mtime,
            });
        }
    }

    scan.dirs.sort();
    scan.files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path, content: &[u8]) {
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn scans_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("b.uef"), b"bb");
        touch(&dir.path().join("a.uef"), b"a");
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir.path().join(".hidden"), b"x");

        let cache = ListingCache::new(16, None);
        let scan = cache.scan(dir.path()).await.unwrap();

        assert_eq!(scan.dirs, ["sub"]);
        let names: Vec<&str> = scan.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["a.uef", "b.uef"]);
        assert_eq!(scan.file("b.uef").unwrap().size, 2);
        assert!(scan.file(".hidden").is_none());
    }

    #[tokio::test]
    async fn cached_until_directory_changes() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.uef"), b"a");

        let cache = ListingCache::new(16, None);
        let first = cache.scan(dir.path()).await.unwrap();
        let second = cache.scan(dir.path()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Adding an entry bumps the directory mtime and invalidates.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        touch(&dir.path().join("b.uef"), b"b");
        let third = cache.scan(dir.path()).await.unwrap();
        assert_eq!(third.files.len(), 2);
    }

    #[tokio::test]
    async fn missing_or_file_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("plain.bin"), b"x");

        let cache = ListingCache::new(16, None);
        assert!(matches!(
            cache.scan(&dir.path().join("absent")).await,
            Err(TransFsError::NotFound)
        ));
        assert!(matches!(
            cache.scan(&dir.path().join("plain.bin")).await,
            Err(TransFsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_scan() {
        // Single-flight: all concurrent waiters observe the same Arc.
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.uef"), b"a");

        let cache = Arc::new(ListingCache::new(16, None));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let path = dir.path().to_path_buf();
            tasks.push(tokio::spawn(
                async move { cache.scan(&path).await.unwrap() },
            ));
        }
        let mut scans = Vec::new();
        for task in tasks {
            scans.push(task.await.unwrap());
        }
        for scan in &scans[1..] {
            assert!(Arc::ptr_eq(&scans[0], scan));
        }
    }

    #[tokio::test]
    async fn persists_across_cache_instances() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        touch(&data.join("a.uef"), b"a");

        let store = DiskStore::new(dir.path().join("cache"), 10 * 1024 * 1024);
        let cache = ListingCache::new(16, Some(store.clone()));
        let first = cache.scan(&data).await.unwrap();

        let cache2 = ListingCache::new(16, Some(store));
        let second = cache2.scan(&data).await.unwrap();
        assert_eq!(second.files, first.files);
    }
}
