//! The virtual tree: translates virtual paths into physical locations and
//! materialises virtual directory listings.
//!
//! The pipeline per request: path parser → map resolver → source locator →
//! listing cache → physical I/O (or the archive index). Everything here is
//! read-only against the physical store.

mod listing;
mod locate;
mod path;
mod resolve;
mod scan;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use transfs_archive::ArchiveIndex;
use transfs_cache::{DiskStore, NegativeCache};
use transfs_core::Config;

pub use path::ParsedPath;
pub use scan::{DirScan, FileStat};
pub use types::{Node, Origin, VirtualEntry};

/// Disk budget for serialised listings and snapshots.
const STORE_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// The core's shared state: configuration plus the layered caches. Created
/// once in `main` and passed by shared reference; no ambient statics.
pub struct Vfs {
    config: Arc<Config>,
    archives: ArchiveIndex,
    listings: scan::ListingCache,
    negative: NegativeCache,
}

impl Vfs {
    pub fn new(config: Arc<Config>) -> Vfs {
        let store = config
            .app
            .cache_dir
            .as_ref()
            .map(|dir: &PathBuf| DiskStore::new(dir.clone(), STORE_MAX_BYTES));

        let archives = ArchiveIndex::new(config.cache.archive_capacity, store.clone());
        let listings = scan::ListingCache::new(config.cache.listing_capacity, store);
        let negative = NegativeCache::new(
            Duration::from_secs(config.cache.negative_ttl_secs),
            4096,
        );

        Vfs {
            config,
            archives,
            listings,
            negative,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn archives(&self) -> &ArchiveIndex {
        &self.archives
    }

    /// The physical filestore root this mount serves.
    pub fn filestore(&self) -> &std::path::Path {
        &self.config.app.filestore
    }
}
