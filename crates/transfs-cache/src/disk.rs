//! On-disk store for serialised listings and archive snapshots.
//!
//! Entries are named by cache-key token, and a token already encodes the
//! backing path's `(mtime, size)`. When a directory or archive changes, the
//! superseded token is simply never asked for again, so the store
//! accumulates orphans rather than serving stale hits. Reclaim handles
//! both: reads touch their entry, and every few writes the oldest-touched
//! entries are dropped until the store fits its byte budget, which retires
//! orphans first.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::fs;

/// Run a reclaim pass every this many writes.
const RECLAIM_EVERY: u64 = 32;

#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
    max_bytes: u64,
    writes: Arc<AtomicU64>,
}

impl DiskStore {
    pub fn new(dir: PathBuf, max_bytes: u64) -> Self {
        DiskStore {
            dir,
            max_bytes,
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    fn entry_path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{token}.json"))
    }

    /// Look up a serialised entry, marking it recently used.
    pub async fn get(&self, token: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(token);
        let data = fs::read(&path).await.ok()?;
        // Touch, so live tokens stay behind the reclaim horizon.
        let _ = std::fs::File::options()
            .append(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        Some(data)
    }

    /// Store a serialised entry: write aside in the store directory, then
    /// publish over the final name in one rename.
    pub async fn put(&self, token: &str, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating store dir: {}", self.dir.display()))?;

        let dir = self.dir.clone();
        let path = self.entry_path(token);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut aside = tempfile::NamedTempFile::new_in(&dir)
                .with_context(|| format!("creating write-aside entry in {}", dir.display()))?;
            aside.write_all(&data)?;
            aside
                .persist(&path)
                .with_context(|| format!("publishing store entry: {}", path.display()))?;
            Ok(())
        })
        .await??;

        if self.writes.fetch_add(1, Ordering::Relaxed) % RECLAIM_EVERY == 0 {
            // Best-effort; a failed reclaim never fails the write.
            let _ = self.reclaim().await;
        }

        Ok(())
    }

    /// Drop the oldest-touched entries until the store fits `max_bytes`.
    /// Orphaned tokens are never read again, so they age out first.
    pub async fn reclaim(&self) -> Result<()> {
        let mut entries: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut total = 0u64;

        let mut listing = fs::read_dir(&self.dir).await?;
        while let Some(entry) = listing.next_entry().await? {
            // Write-aside files that have not been published yet are not
            // entries and are left for their writers.
            let name = entry.file_name();
            if name.to_str().is_none_or(|n| !n.ends_with(".json")) {
                continue;
            }
            let meta = entry.metadata().await?;
            total += meta.len();
            entries.push((
                entry.path(),
                meta.len(),
                meta.modified().unwrap_or(UNIX_EPOCH),
            ));
        }

        if total <= self.max_bytes {
            return Ok(());
        }

        // Most recently touched first; whatever overflows the budget goes.
        entries.sort_by(|a, b| b.2.cmp(&a.2));
        let mut kept = 0u64;
        for (path, len, _) in entries {
            kept += len;
            if kept > self.max_bytes {
                let _ = fs::remove_file(&path).await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().to_path_buf(), 10 * 1024 * 1024);

        store.put("aabbcc", b"listing bytes").await.unwrap();
        assert_eq!(store.get("aabbcc").await.unwrap(), b"listing bytes");
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().to_path_buf(), 10 * 1024 * 1024);
        assert!(store.get("deadbeef").await.is_none());
    }

    #[tokio::test]
    async fn reclaim_keeps_recently_touched_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().to_path_buf(), 64);

        store.put("aa01", &[1u8; 48]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.put("bb02", &[2u8; 48]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Reading aa01 touches it, so the over-budget reclaim retires bb02.
        assert!(store.get("aa01").await.is_some());
        store.reclaim().await.unwrap();

        assert!(store.get("aa01").await.is_some());
        assert!(store.get("bb02").await.is_none());
    }

    #[tokio::test]
    async fn reclaim_is_a_no_op_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path().to_path_buf(), 1024);

        store.put("aa01", &[1u8; 48]).await.unwrap();
        store.put("bb02", &[2u8; 48]).await.unwrap();
        store.reclaim().await.unwrap();

        assert!(store.get("aa01").await.is_some());
        assert!(store.get("bb02").await.is_some());
    }
}
