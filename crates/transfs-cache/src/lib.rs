//! Cache plumbing shared by the archive index and the listing engine.
//!
//! `DiskStore` persists serialised listings across restarts; `CacheKey` ties
//! every cached entry to the `(path, mtime_ns, size)` of the physical thing
//! it was derived from, so a stale entry is never served. `NegativeCache`
//! suppresses repeated physical stats for paths known to be absent.

mod disk;
mod key;
mod negative;

pub use disk::DiskStore;
pub use key::{stat_pair, CacheKey};
pub use negative::NegativeCache;
