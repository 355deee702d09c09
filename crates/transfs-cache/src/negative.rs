//! Negative resolution cache.
//!
//! Front-ends that probe for optional files (cores scanning for alternate
//! ROM sets, `ls` tab-completion) hammer the mount with lookups that miss.
//! Each miss otherwise costs a physical stat, or an archive index probe.
//! Entries expire on a TTL so newly acquired content appears without a
//! remount.

use std::time::Duration;

use moka::sync::Cache;

pub struct NegativeCache {
    entries: Option<Cache<String, ()>>,
}

impl NegativeCache {
    /// A TTL of zero disables the cache entirely.
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        let entries = (!ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build()
        });
        NegativeCache { entries }
    }

    /// Record that the virtual path does not resolve.
    pub fn insert(&self, vpath: &str) {
        if let Some(entries) = &self.entries {
            entries.insert(vpath.to_string(), ());
        }
    }

    /// True if the virtual path is known absent and the TTL has not expired.
    pub fn contains(&self, vpath: &str) -> bool {
        self.entries
            .as_ref()
            .is_some_and(|entries| entries.contains_key(vpath))
    }

    /// Drop a recorded miss (e.g. after a cache invalidation made the path
    /// plausible again).
    pub fn remove(&self, vpath: &str) {
        if let Some(entries) = &self.entries {
            entries.invalidate(vpath);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_check() {
        let cache = NegativeCache::new(Duration::from_secs(30), 1024);
        assert!(!cache.contains("/MiSTer/AcornAtom/HDs/missing.vhd"));
        cache.insert("/MiSTer/AcornAtom/HDs/missing.vhd");
        assert!(cache.contains("/MiSTer/AcornAtom/HDs/missing.vhd"));
    }

    #[test]
    fn remove_clears_entry() {
        let cache = NegativeCache::new(Duration::from_secs(30), 1024);
        cache.insert("/MiSTer/AcornAtom/HDs/late.vhd");
        cache.remove("/MiSTer/AcornAtom/HDs/late.vhd");
        assert!(!cache.contains("/MiSTer/AcornAtom/HDs/late.vhd"));
    }

    #[test]
    fn ttl_expiry() {
        let cache = NegativeCache::new(Duration::from_millis(50), 1024);
        cache.insert("/MiSTer/BBCMicro/boot.vhd");
        assert!(cache.contains("/MiSTer/BBCMicro/boot.vhd"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!cache.contains("/MiSTer/BBCMicro/boot.vhd"));
    }

    #[test]
    fn zero_ttl_disables() {
        let cache = NegativeCache::new(Duration::ZERO, 1024);
        cache.insert("/MiSTer/BBCMicro/boot.vhd");
        assert!(!cache.contains("/MiSTer/BBCMicro/boot.vhd"));
    }
}
