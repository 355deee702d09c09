use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Identity of a cached listing: the physical path plus the `(mtime, size)`
/// observed when the listing was produced. A cached entry is valid only
/// while the current stat still matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub mtime_ns: u64,
    pub size: u64,
}

impl CacheKey {
    pub fn new(path: &Path, mtime_ns: u64, size: u64) -> Self {
        CacheKey {
            path: path.to_string_lossy().into_owned(),
            mtime_ns,
            size,
        }
    }

    pub fn from_metadata(path: &Path, meta: &Metadata) -> Self {
        let (mtime_ns, size) = stat_pair(meta);
        CacheKey::new(path, mtime_ns, size)
    }

    /// Filesystem-safe token naming this key in the on-disk store.
    pub fn token(&self) -> String {
        let digest = blake3::hash(format!("{}|{}|{}", self.path, self.mtime_ns, self.size).as_bytes());
        digest.to_hex().to_string()
    }
}

/// `(mtime_ns, size)` for cache validity checks.
pub fn stat_pair(meta: &Metadata) -> (u64, u64) {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (mtime_ns, meta.len())
}
