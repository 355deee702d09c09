//! Source locator: turns a candidate physical location into a definite
//! existence answer. Missing paths are a normal negative result; stat
//! failures other than absence propagate as I/O errors.

use std::path::Path;

use transfs_cache::stat_pair;
use transfs_core::{TransFsError, TransFsResult};

#[derive(Debug, Clone, Copy)]
pub(crate) struct PathStat {
    pub is_dir: bool,
    pub size: u64,
    pub mtime_ns: u64,
}

/// Stat a backing path, following symlinks.
pub(crate) async fn stat_path(path: &Path) -> TransFsResult<PathStat> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(TransFsError::from_stat)?;
    let (mtime_ns, size) = stat_pair(&meta);
    Ok(PathStat {
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { size },
        mtime_ns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stats_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), b"12345").unwrap();

        let st = stat_path(&dir.path().join("f.bin")).await.unwrap();
        assert!(!st.is_dir);
        assert_eq!(st.size, 5);
        assert!(st.mtime_ns > 0);

        let st = stat_path(dir.path()).await.unwrap();
        assert!(st.is_dir);
        assert_eq!(st.size, 0);
    }

    #[tokio::test]
    async fn missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = stat_path(&dir.path().join("missing")).await.unwrap_err();
        assert!(matches!(err, TransFsError::NotFound));
    }
}
