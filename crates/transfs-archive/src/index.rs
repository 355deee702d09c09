//! Archive index front-end: snapshot cache plus member access.
//!
//! Snapshots are cached in-memory (LRU) and optionally persisted through the
//! disk store. Population is single-flight per archive path: concurrent
//! misses collapse to one indexing pass, and waiters share the result.

use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use transfs_cache::{CacheKey, DiskStore};
use transfs_core::{TransFsError, TransFsResult};

use crate::snapshot::ArchiveSnapshot;

pub struct ArchiveIndex {
    cache: moka::future::Cache<PathBuf, Arc<ArchiveSnapshot>>,
    store: Option<DiskStore>,
}

/// An opened archive member: a descriptor plus the window holding the
/// member's bytes. For stored members this is the archive file itself at
/// `data_start`; for compressed members it is an anonymous (already
/// unlinked) temp file holding the inflated bytes.
#[derive(Debug)]
pub struct MemberReader {
    file: std::fs::File,
    base: u64,
    len: u64,
}

impl MemberReader {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read up to `size` bytes at `offset` within the member. Reads past the
    /// end return an empty buffer; short reads happen only at the end.
    pub fn read_at(&self, offset: u64, size: u32) -> std::io::Result<Vec<u8>> {
        if offset >= self.len {
            return Ok(Vec::new());
        }
        let end = (offset + u64::from(size)).min(self.len);
        let mut buf = vec![0u8; (end - offset) as usize];
        let mut done = 0usize;
        while done < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[done..], self.base + offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        buf.truncate(done);
        Ok(buf)
    }
}

impl ArchiveIndex {
    pub fn new(capacity: u64, store: Option<DiskStore>) -> Self {
        ArchiveIndex {
            cache: moka::future::Cache::builder().max_capacity(capacity).build(),
            store,
        }
    }

    /// Open (index) an archive. Idempotent: while the archive's
    /// `(mtime, size)` is unchanged, every call returns the same snapshot.
    pub async fn open(&self, archive: &Path) -> TransFsResult<Arc<ArchiveSnapshot>> {
        let meta = tokio::fs::symlink_metadata(archive)
            .await
            .map_err(TransFsError::from_stat)?;
        if !meta.is_file() {
            return Err(TransFsError::NotFound);
        }
        let key = CacheKey::from_metadata(archive, &meta);

        let path = archive.to_path_buf();
        if let Some(snap) = self.cache.get(&path).await {
            if snap.mtime_ns == key.mtime_ns && snap.size == key.size {
                return Ok(snap);
            }
            debug!(archive = %path.display(), "archive changed, dropping stale snapshot");
            self.cache.invalidate(&path).await;
        }

        let store = self.store.clone();
        let init_path = path.clone();

        self.cache
            .try_get_with(path, async move {
                if let Some(store) = &store {
                    if let Some(bytes) = store.get(&key.token()).await {
                        if let Ok(snap) = serde_json::from_slice::<ArchiveSnapshot>(&bytes) {
                            if snap.mtime_ns == key.mtime_ns && snap.size == key.size {
                                debug!(archive = %init_path.display(), "snapshot loaded from disk store");
                                return Ok(Arc::new(snap));
                            }
                        }
                    }
                }

                let build_path = init_path.clone();
                let (mtime_ns, size) = (key.mtime_ns, key.size);
                let snap = tokio::task::spawn_blocking(move || {
                    ArchiveSnapshot::build(&build_path, mtime_ns, size)
                })
                .await
                .map_err(|e| {
                    TransFsError::Io(std::io::Error::other(format!("indexing task: {e}")))
                })??;

                debug!(
                    archive = %init_path.display(),
                    members = snap.file_count(),
                    "archive indexed"
                );

                if let Some(store) = &store {
                    match serde_json::to_vec(&snap) {
                        Ok(bytes) => {
                            if let Err(e) = store.put(&key.token(), &bytes).await {
                                warn!(archive = %init_path.display(), "failed to persist snapshot: {e}");
                            }
                        }
                        Err(e) => {
                            warn!(archive = %init_path.display(), "failed to serialise snapshot: {e}");
                        }
                    }
                }

                Ok(Arc::new(snap))
            })
            .await
            .map_err(TransFsError::from_shared)
    }

    /// Open one member for random-access reads.
    pub async fn open_member(
        &self,
        snapshot: &Arc<ArchiveSnapshot>,
        member: &str,
    ) -> TransFsResult<MemberReader> {
        let snapshot = Arc::clone(snapshot);
        let member = member.to_string();
        tokio::task::spawn_blocking(move || open_member_blocking(&snapshot, &member))
            .await
            .map_err(|e| TransFsError::Io(std::io::Error::other(format!("open task: {e}"))))?
    }

    /// Read `size` bytes of a member at `offset` without keeping a handle.
    pub async fn read_member(
        &self,
        snapshot: &Arc<ArchiveSnapshot>,
        member: &str,
        offset: u64,
        size: u32,
    ) -> TransFsResult<Vec<u8>> {
        let snapshot = Arc::clone(snapshot);
        let member = member.to_string();
        tokio::task::spawn_blocking(move || {
            let reader = open_member_blocking(&snapshot, &member)?;
            reader.read_at(offset, size).map_err(TransFsError::Io)
        })
        .await
        .map_err(|e| TransFsError::Io(std::io::Error::other(format!("read task: {e}"))))?
    }

    /// Materialise a member to an anonymous temp file, positioned at the
    /// start. The file has no name on disk; dropping the handle reclaims it.
    pub async fn extract(
        &self,
        snapshot: &Arc<ArchiveSnapshot>,
        member: &str,
    ) -> TransFsResult<std::fs::File> {
        use std::io::Seek;

        let snapshot = Arc::clone(snapshot);
        let member = member.to_string();
        tokio::task::spawn_blocking(move || {
            let info = snapshot.member(&member).ok_or(TransFsError::NotFound)?;
            let file = std::fs::File::open(&snapshot.path).map_err(TransFsError::from_stat)?;
            let mut zip = zip::ZipArchive::new(file).map_err(|e| {
                TransFsError::malformed_archive(snapshot.path.display().to_string(), e)
            })?;
            let mut entry = zip.by_index(info.index).map_err(|e| {
                TransFsError::malformed_archive(snapshot.path.display().to_string(), e)
            })?;
            let mut tmp = tempfile::tempfile().map_err(TransFsError::Io)?;
            std::io::copy(&mut entry, &mut tmp).map_err(TransFsError::Io)?;
            tmp.seek(std::io::SeekFrom::Start(0)).map_err(TransFsError::Io)?;
            Ok(tmp)
        })
        .await
        .map_err(|e| TransFsError::Io(std::io::Error::other(format!("extract task: {e}"))))?
    }
}

fn open_member_blocking(
    snapshot: &ArchiveSnapshot,
    member: &str,
) -> TransFsResult<MemberReader> {
    let info = snapshot.member(member).ok_or(TransFsError::NotFound)?;
    let file = std::fs::File::open(&snapshot.path).map_err(TransFsError::from_stat)?;

    if info.stored {
        return Ok(MemberReader {
            file,
            base: info.data_start,
            len: info.size,
        });
    }

    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| TransFsError::malformed_archive(snapshot.path.display().to_string(), e))?;
    let mut entry = zip
        .by_index(info.index)
        .map_err(|e| TransFsError::malformed_archive(snapshot.path.display().to_string(), e))?;
    let mut tmp = tempfile::tempfile().map_err(TransFsError::Io)?;
    std::io::copy(&mut entry, &mut tmp).map_err(TransFsError::Io)?;

    Ok(MemberReader {
        file: tmp,
        base: 0,
        len: info.size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_zip, write_zip_deflated};

    #[tokio::test]
    async fn open_is_idempotent_while_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(&zip_path, &[("one.ssd", b"111")]);

        let index = ArchiveIndex::new(16, None);
        let first = index.open(&zip_path).await.unwrap();
        let second = index.open(&zip_path).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn snapshot_refreshes_when_archive_changes() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(&zip_path, &[("one.ssd", b"111")]);

        let index = ArchiveIndex::new(16, None);
        let first = index.open(&zip_path).await.unwrap();
        assert_eq!(first.file_count(), 1);

        write_zip(&zip_path, &[("one.ssd", b"111"), ("two.ssd", b"222")]);
        let second = index.open(&zip_path).await.unwrap();
        assert_eq!(second.file_count(), 2);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(&zip_path, &[("one.ssd", b"111")]);

        let index = Arc::new(ArchiveIndex::new(16, None));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let index = Arc::clone(&index);
            let path = zip_path.clone();
            tasks.push(tokio::spawn(async move { index.open(&path).await.unwrap() }));
        }
        let mut snaps = Vec::new();
        for task in tasks {
            snaps.push(task.await.unwrap());
        }
        for snap in &snaps[1..] {
            assert!(Arc::ptr_eq(&snaps[0], snap));
        }
    }

    #[tokio::test]
    async fn missing_archive_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let index = ArchiveIndex::new(16, None);
        let err = index.open(&dir.path().join("absent.zip")).await.unwrap_err();
        assert!(matches!(err, TransFsError::NotFound));
    }

    #[tokio::test]
    async fn garbage_archive_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.zip");
        std::fs::write(&bad, b"this is not a zip file").unwrap();

        let index = ArchiveIndex::new(16, None);
        let err = index.open(&bad).await.unwrap_err();
        assert!(matches!(err, TransFsError::MalformedArchive { .. }));
    }

    #[tokio::test]
    async fn reads_stored_member_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(&zip_path, &[("hoglet.vhd", b"HELLOWORLD")]);

        let index = ArchiveIndex::new(16, None);
        let snap = index.open(&zip_path).await.unwrap();

        assert_eq!(
            index.read_member(&snap, "hoglet.vhd", 0, 5).await.unwrap(),
            b"HELLO"
        );
        assert_eq!(
            index.read_member(&snap, "hoglet.vhd", 5, 100).await.unwrap(),
            b"WORLD"
        );
        assert!(index
            .read_member(&snap, "hoglet.vhd", 10, 4)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reads_deflated_member_through_temp_copy() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        let body = b"the quick brown fox jumps over the lazy dog".repeat(50);
        write_zip_deflated(&zip_path, &[("story.uef", &body)]);

        let index = ArchiveIndex::new(16, None);
        let snap = index.open(&zip_path).await.unwrap();

        let reader = index.open_member(&snap, "story.uef").await.unwrap();
        assert_eq!(reader.len(), body.len() as u64);
        assert_eq!(reader.read_at(4, 5).unwrap(), &body[4..9]);
        assert_eq!(reader.read_at(0, body.len() as u32 + 64).unwrap(), body);
    }

    #[tokio::test]
    async fn extract_materialises_full_member() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip_deflated(&zip_path, &[("Elite.ssd", b"ELITEDATA")]);

        let index = ArchiveIndex::new(16, None);
        let snap = index.open(&zip_path).await.unwrap();

        let mut file = index.extract(&snap, "Elite.ssd").await.unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"ELITEDATA");
    }

    #[tokio::test]
    async fn unknown_member_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(&zip_path, &[("one.ssd", b"111")]);

        let index = ArchiveIndex::new(16, None);
        let snap = index.open(&zip_path).await.unwrap();
        let err = index.open_member(&snap, "missing.ssd").await.unwrap_err();
        assert!(matches!(err, TransFsError::NotFound));
    }

    #[tokio::test]
    async fn snapshots_persist_through_the_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(&zip_path, &[("one.ssd", b"111")]);

        let store = DiskStore::new(dir.path().join("cache"), 10 * 1024 * 1024);

        let index = ArchiveIndex::new(16, Some(store.clone()));
        let snap = index.open(&zip_path).await.unwrap();
        assert_eq!(snap.file_count(), 1);

        // A fresh index (fresh process) accepts the persisted snapshot.
        let index2 = ArchiveIndex::new(16, Some(store));
        let snap2 = index2.open(&zip_path).await.unwrap();
        assert_eq!(snap2.file_count(), 1);
        assert_eq!(snap2.member("one.ssd"), snap.member("one.ssd"));
    }
}
