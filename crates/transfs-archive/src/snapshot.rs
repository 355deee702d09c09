//! The cached result of indexing one archive: its directory tree and file
//! table, keyed by the archive's `(path, mtime, size)`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::warn;
use transfs_core::{TransFsError, TransFsResult};

/// One file member of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Central-directory index, for `by_index` access on later reads
    pub index: usize,
    /// Uncompressed size
    pub size: u64,
    /// Member is stored uncompressed; random access through `data_start`
    /// works without inflation
    pub stored: bool,
    /// Byte offset of the member's data within the archive file
    pub data_start: u64,
}

/// Logical tree of a single archive. Directory paths carry no trailing
/// slash; the root is the empty string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveSnapshot {
    pub path: PathBuf,
    pub mtime_ns: u64,
    pub size: u64,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, MemberInfo>,
}

/// One level of an archive's tree. Names are basenames relative to the
/// listed directory.
#[derive(Debug, Clone, Default)]
pub struct ArchiveListing {
    pub dirs: Vec<String>,
    pub files: Vec<(String, MemberInfo)>,
}

/// How a raw member name is treated during indexing.
enum NameClass {
    Visible,
    Hidden,
    Rejected,
}

/// Members that could escape the archive root are rejected outright;
/// dot-named members are indexed nowhere (hidden).
fn classify(name: &str) -> NameClass {
    if name.starts_with('/') || name.contains('\\') || name.contains('\0') {
        return NameClass::Rejected;
    }
    let mut hidden = false;
    for comp in name.trim_end_matches('/').split('/') {
        if comp.is_empty() || comp.starts_with("..") {
            return NameClass::Rejected;
        }
        if comp.starts_with('.') {
            hidden = true;
        }
    }
    if hidden {
        NameClass::Hidden
    } else {
        NameClass::Visible
    }
}

impl ArchiveSnapshot {
    /// Index an archive in one pass. Blocking; call from a worker thread.
    pub fn build(path: &Path, mtime_ns: u64, size: u64) -> TransFsResult<ArchiveSnapshot> {
        let file = std::fs::File::open(path).map_err(TransFsError::from_stat)?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| TransFsError::malformed_archive(path.display().to_string(), e))?;

        let mut snapshot = ArchiveSnapshot {
            path: path.to_path_buf(),
            mtime_ns,
            size,
            dirs: BTreeSet::new(),
            files: BTreeMap::new(),
        };

        for i in 0..zip.len() {
            let entry = zip
                .by_index(i)
                .map_err(|e| TransFsError::malformed_archive(path.display().to_string(), e))?;
            let raw = entry.name().to_string();

            match classify(&raw) {
                NameClass::Visible => {}
                NameClass::Hidden => continue,
                NameClass::Rejected => {
                    warn!(archive = %path.display(), member = %raw, "rejecting unsafe member path");
                    continue;
                }
            }

            if entry.is_dir() {
                snapshot.add_dir(raw.trim_end_matches('/'));
            } else {
                if let Some(parent) = raw.rsplit_once('/').map(|(p, _)| p) {
                    snapshot.add_dir(parent);
                }
                snapshot.files.insert(
                    raw.clone(),
                    MemberInfo {
                        index: i,
                        size: entry.size(),
                        stored: entry.compression() == zip::CompressionMethod::Stored,
                        data_start: entry.data_start(),
                    },
                );
            }
        }

        Ok(snapshot)
    }

    /// Record a directory and every ancestor up to the root.
    fn add_dir(&mut self, dir: &str) {
        let mut current = dir;
        loop {
            if current.is_empty() || !self.dirs.insert(current.to_string()) {
                return;
            }
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent,
                None => return,
            }
        }
    }

    pub fn member(&self, member_path: &str) -> Option<&MemberInfo> {
        self.files.get(member_path)
    }

    /// True for the root (empty string) and any recorded directory.
    pub fn is_dir(&self, subpath: &str) -> bool {
        subpath.is_empty() || self.dirs.contains(subpath)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Iterate every file member as `(member_path, info)`.
    pub fn members(&self) -> impl Iterator<Item = (&str, &MemberInfo)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// List one level of the tree. `None` when `subpath` is not a directory
    /// of this archive.
    pub fn list(&self, subpath: &str) -> Option<ArchiveListing> {
        if !self.is_dir(subpath) {
            return None;
        }
        let prefix = if subpath.is_empty() {
            String::new()
        } else {
            format!("{subpath}/")
        };

        let mut listing = ArchiveListing::default();

        for dir in self.dirs.range(prefix.clone()..) {
            if !dir.starts_with(&prefix) {
                break;
            }
            let rest = &dir[prefix.len()..];
            if !rest.is_empty() && !rest.contains('/') {
                listing.dirs.push(rest.to_string());
            }
        }

        for (name, info) in self.files.range(prefix.clone()..) {
            if !name.starts_with(&prefix) {
                break;
            }
            let rest = &name[prefix.len()..];
            if !rest.contains('/') {
                listing.files.push((rest.to_string(), info.clone()));
            }
        }

        Some(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_zip;

    fn build(path: &Path) -> ArchiveSnapshot {
        ArchiveSnapshot::build(path, 0, 0).unwrap()
    }

    #[test]
    fn synthesises_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("tosec.zip");
        write_zip(
            &zip_path,
            &[
                ("Disk1/game.dsk", b"one"),
                ("Disk2/game.dsk", b"two"),
                ("Disk2/extra/more.dsk", b"three"),
            ],
        );
        let snap = build(&zip_path);

        assert!(snap.is_dir(""));
        assert!(snap.is_dir("Disk1"));
        assert!(snap.is_dir("Disk2/extra"));
        assert!(!snap.is_dir("Disk1/game.dsk"));

        let root = snap.list("").unwrap();
        assert_eq!(root.dirs, ["Disk1", "Disk2"]);
        assert!(root.files.is_empty());

        let disk2 = snap.list("Disk2").unwrap();
        assert_eq!(disk2.dirs, ["extra"]);
        assert_eq!(disk2.files.len(), 1);
        assert_eq!(disk2.files[0].0, "game.dsk");
    }

    #[test]
    fn hides_dot_members_and_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("mixed.zip");
        write_zip(
            &zip_path,
            &[
                ("ok.ssd", b"fine"),
                (".DS_Store", b"junk"),
                ("sub/.hidden", b"junk"),
                ("../escape.ssd", b"evil"),
                ("nested/../escape.ssd", b"evil"),
            ],
        );
        let snap = build(&zip_path);

        assert_eq!(snap.file_count(), 1);
        assert!(snap.member("ok.ssd").is_some());
        // No member path contains ".." or starts with "/"
        for (name, _) in snap.members() {
            assert!(!name.starts_with('/'));
            assert!(name.split('/').all(|c| !c.starts_with("..")));
        }
    }

    #[test]
    fn member_sizes_and_storage_mode() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("sizes.zip");
        write_zip(&zip_path, &[("hoglet.vhd", b"HELLOWORLD")]);
        let snap = build(&zip_path);

        let info = snap.member("hoglet.vhd").unwrap();
        assert_eq!(info.size, 10);
        assert!(info.stored);
    }

    #[test]
    fn empty_archive_is_an_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("empty.zip");
        write_zip(&zip_path, &[]);
        let snap = build(&zip_path);

        assert!(snap.is_dir(""));
        let root = snap.list("").unwrap();
        assert!(root.dirs.is_empty() && root.files.is_empty());
        assert!(snap.list("nope").is_none());
    }

    #[test]
    fn snapshot_serialises_for_the_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("roundtrip.zip");
        write_zip(&zip_path, &[("a/b.rom", b"DEAD")]);
        let snap = build(&zip_path);

        let bytes = serde_json::to_vec(&snap).unwrap();
        let back: ArchiveSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.member("a/b.rom"), snap.member("a/b.rom"));
        assert!(back.is_dir("a"));
    }
}
