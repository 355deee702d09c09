//! Inode table: the kernel-facing identity map.
//!
//! Ids are derived deterministically by hashing the fully-qualified virtual
//! path, with linear probing on the rare collision; the table owns both
//! directions (ino → path and path → ino). Entries carry the kernel lookup
//! count and are dropped when `forget` brings it to zero. No other
//! component holds inode state, only the id.

use std::collections::HashMap;
use std::sync::Mutex;

use transfs_vfs::Origin;

pub const ROOT_INODE: u64 = 1;

#[derive(Debug, Clone)]
pub struct InodeEntry {
    pub ino: u64,
    pub vpath: String,
    /// Last origin observed at lookup; getattr re-resolves, this records
    /// what kind of thing the kernel was told the inode is.
    pub origin: Origin,
    pub lookup_count: u64,
}

#[derive(Default)]
struct Inner {
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<String, u64>,
}

pub struct InodeTable {
    inner: Mutex<Inner>,
}

/// Deterministic id for a virtual path. Never 0 (invalid) or 1 (root).
fn hash_path(vpath: &str) -> u64 {
    let digest = blake3::hash(vpath.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    let ino = u64::from_le_bytes(bytes);
    if ino <= ROOT_INODE {
        ino.wrapping_add(2)
    } else {
        ino
    }
}

/// Join a child name onto a virtual directory path.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// The parent directory of a virtual path; the root is its own parent.
pub fn parent_path(vpath: &str) -> &str {
    match vpath.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

impl InodeTable {
    pub fn new() -> InodeTable {
        let mut inner = Inner::default();
        inner.by_ino.insert(
            ROOT_INODE,
            InodeEntry {
                ino: ROOT_INODE,
                vpath: "/".to_string(),
                origin: Origin::SynthDir,
                lookup_count: 1,
            },
        );
        inner.by_path.insert("/".to_string(), ROOT_INODE);
        InodeTable {
            inner: Mutex::new(inner),
        }
    }

    /// Register one kernel lookup of a virtual path, allocating an id on
    /// first sight. Concurrent registrations of the same new path converge
    /// on one id.
    pub fn register(&self, vpath: &str, origin: &Origin) -> u64 {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&ino) = inner.by_path.get(vpath) {
            let entry = inner.by_ino.get_mut(&ino).expect("maps in sync");
            entry.lookup_count += 1;
            entry.origin = origin.clone();
            return ino;
        }

        let mut ino = hash_path(vpath);
        while inner.by_ino.contains_key(&ino) {
            ino = ino.wrapping_add(1);
            if ino <= ROOT_INODE {
                ino = ROOT_INODE + 1;
            }
        }

        inner.by_ino.insert(
            ino,
            InodeEntry {
                ino,
                vpath: vpath.to_string(),
                origin: origin.clone(),
                lookup_count: 1,
            },
        );
        inner.by_path.insert(vpath.to_string(), ino);
        ino
    }

    pub fn get(&self, ino: u64) -> Option<InodeEntry> {
        self.inner.lock().unwrap().by_ino.get(&ino).cloned()
    }

    /// The id a path would get, without registering a lookup. Used for
    /// `d_ino` values in plain readdir.
    pub fn peek(&self, vpath: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        if let Some(&ino) = inner.by_path.get(vpath) {
            return ino;
        }
        hash_path(vpath)
    }

    /// Drop `nlookup` references; the entry is released at zero. The root
    /// is never released.
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let remove = match inner.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookup_count = entry.lookup_count.saturating_sub(nlookup);
                entry.lookup_count == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = inner.by_ino.remove(&ino) {
                inner.by_path.remove(&entry.vpath);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().by_ino.len()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        InodeTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_joining() {
        assert_eq!(child_path("/", "MiSTer"), "/MiSTer");
        assert_eq!(child_path("/MiSTer", "AcornElectron"), "/MiSTer/AcornElectron");
        assert_eq!(parent_path("/MiSTer/AcornElectron"), "/MiSTer");
        assert_eq!(parent_path("/MiSTer"), "/");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn register_is_stable_and_counted() {
        let table = InodeTable::new();
        let a = table.register("/MiSTer/AcornAtom/HDs", &Origin::SynthDir);
        let b = table.register("/MiSTer/AcornAtom/HDs", &Origin::SynthDir);
        assert_eq!(a, b);
        assert_eq!(table.get(a).unwrap().lookup_count, 2);

        table.forget(a, 1);
        assert_eq!(table.get(a).unwrap().lookup_count, 1);
        table.forget(a, 1);
        assert!(table.get(a).is_none());
    }

    #[test]
    fn ids_are_deterministic_across_tables() {
        let first = InodeTable::new();
        let second = InodeTable::new();
        let a = first.register("/MiSTer/X/y.rom", &Origin::SynthDir);
        let b = second.register("/MiSTer/X/y.rom", &Origin::SynthDir);
        assert_eq!(a, b);
        assert_eq!(first.peek("/MiSTer/X/y.rom"), a);
    }

    #[test]
    fn distinct_paths_get_distinct_ids() {
        let table = InodeTable::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..512 {
            let ino = table.register(&format!("/c/s/file{i}.rom"), &Origin::SynthDir);
            assert!(ino > ROOT_INODE);
            assert!(seen.insert(ino), "collision on {ino}");
        }
    }

    #[test]
    fn root_is_never_forgotten() {
        let table = InodeTable::new();
        table.forget(ROOT_INODE, u64::MAX);
        assert!(table.get(ROOT_INODE).is_some());
        assert_eq!(table.get(ROOT_INODE).unwrap().vpath, "/");
    }

    #[test]
    fn forget_is_idempotent_for_unknown_inodes() {
        let table = InodeTable::new();
        table.forget(0xdead_beef, 3);
        assert_eq!(table.count(), 1); // just the root
    }
}
