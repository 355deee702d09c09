//! Directory listing engine: materialises the full entry set of a virtual
//! directory, independent of kernel pagination.
//!
//! Composition rules:
//! - a system directory is the union of its map targets, excluding any
//!   whose resolution is negative;
//! - a dynamic virtual folder merges the extension directories of its
//!   entry (or the semantic-folder fallback), applying alias display and
//!   archive transparency;
//! - an archive-as-directory exposes one level of the archive's tree.
//!
//! Entries that fail to resolve (an unreadable archive, say) are logged and
//! excluded; they never fail the whole directory. Listings are emitted in a
//! stable order: folders before files, then case-insensitive lexicographic.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;
use transfs_archive::ArchiveSnapshot;
use transfs_core::config::{FileTypeFolder, MapTarget, System};
use transfs_core::types::{file_extension, ExtensionSpec, ZipMode};
use transfs_core::{TransFsError, TransFsResult};

use crate::locate::stat_path;
use crate::types::{Node, Origin, VirtualEntry};
use crate::Vfs;

/// True for file names the archive transparency rules apply to.
pub(crate) fn is_archive_name(name: &str) -> bool {
    file_extension(name).is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

/// First configured spec matching a file name's extension.
fn matching_spec<'s>(specs: &'s [ExtensionSpec], name: &str) -> Option<&'s ExtensionSpec> {
    let ext = file_extension(name)?;
    specs.iter().find(|spec| spec.matches(ext))
}

/// Does a member name pass the (optional) extension filter?
fn member_matches(filter: Option<&[ExtensionSpec]>, name: &str) -> bool {
    match filter {
        None => true,
        Some(specs) => matching_spec(specs, name).is_some(),
    }
}

/// Display name for a member under the (optional) filter: alias-substituted
/// when a matching spec aliases, otherwise unchanged.
fn member_display(filter: Option<&[ExtensionSpec]>, name: &str) -> String {
    match filter.and_then(|specs| matching_spec(specs, name)) {
        Some(spec) => spec.display_name(name),
        None => name.to_string(),
    }
}

fn member_basename(member: &str) -> &str {
    member.rsplit_once('/').map_or(member, |(_, base)| base)
}

pub(crate) fn join_member(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Stable output order: folders first, then case-insensitive lexicographic,
/// exact name as the final tiebreak.
fn sort_entries(entries: &mut [VirtualEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| {
                a.name
                    .to_lowercase()
                    .cmp(&b.name.to_lowercase())
            })
            .then_with(|| a.name.cmp(&b.name))
    });
}

fn insert_first_wins(entries: &mut BTreeMap<String, VirtualEntry>, entry: VirtualEntry) {
    entries.entry(entry.name.clone()).or_insert(entry);
}

impl Vfs {
    /// List the virtual root: one directory per configured client.
    pub(crate) fn list_root(&self) -> Vec<VirtualEntry> {
        let mut out: Vec<VirtualEntry> = self
            .config
            .clients
            .iter()
            .map(|client| VirtualEntry {
                name: client.name.clone(),
                origin: Origin::SynthDir,
                size: 0,
                mtime_ns: 0,
            })
            .collect();
        sort_entries(&mut out);
        out
    }

    /// List a client directory: one directory per system.
    pub(crate) fn list_client(&self, client: &transfs_core::config::Client) -> Vec<VirtualEntry> {
        let mut out: Vec<VirtualEntry> = client
            .systems
            .iter()
            .map(|system| VirtualEntry {
                name: system.name.clone(),
                origin: Origin::SynthDir,
                size: 0,
                mtime_ns: 0,
            })
            .collect();
        sort_entries(&mut out);
        out
    }

    /// List a system directory: the union of its map targets, excluding
    /// entries whose resolution is negative.
    pub(crate) async fn list_system(&self, system: &System) -> TransFsResult<Vec<VirtualEntry>> {
        let mut out = Vec::new();
        for (name, target) in system.map_targets() {
            match self.target_node(system, &target).await {
                Ok(node) => out.push(VirtualEntry {
                    name: name.to_string(),
                    origin: node.origin,
                    size: node.size,
                    mtime_ns: node.mtime_ns,
                }),
                Err(TransFsError::NotFound) => continue,
                Err(e) => {
                    warn!(system = %system.name, entry = name, "excluding entry from listing: {e}");
                    continue;
                }
            }
        }
        sort_entries(&mut out);
        Ok(out)
    }

    /// Resolve one top-level map target to a node, verifying its physical
    /// backing exists.
    pub(crate) async fn target_node(
        &self,
        system: &System,
        target: &MapTarget<'_>,
    ) -> TransFsResult<Node> {
        let base = system.native_root(self.filestore());
        match target {
            MapTarget::Static { source_dir } => {
                let path = base.join(source_dir);
                let st = stat_path(&path).await?;
                if !st.is_dir {
                    return Err(TransFsError::NotFound);
                }
                Ok(Node {
                    origin: Origin::RealDir { path },
                    size: 0,
                    mtime_ns: st.mtime_ns,
                })
            }
            MapTarget::DefaultSource { source, member } => {
                let path = base.join(source);
                match member {
                    Some((name, rule)) if rule.zip.is_some() => {
                        let snapshot = self.archives.open(&path).await?;
                        let info = snapshot.member(name).ok_or(TransFsError::NotFound)?;
                        Ok(Node {
                            origin: Origin::ArchiveMember {
                                archive: path,
                                member: (*name).to_string(),
                            },
                            size: info.size,
                            mtime_ns: snapshot.mtime_ns,
                        })
                    }
                    _ => {
                        let st = stat_path(&path).await?;
                        if st.is_dir {
                            return Err(TransFsError::NotFound);
                        }
                        Ok(Node {
                            origin: Origin::RealFile { path },
                            size: st.size,
                            mtime_ns: st.mtime_ns,
                        })
                    }
                }
            }
            MapTarget::DynamicFolder {
                source_dir, folder, ..
            } => {
                let dirs = self
                    .dynamic_source_dirs(&base.join(source_dir), folder)
                    .await;
                if dirs.is_empty() {
                    return Err(TransFsError::NotFound);
                }
                Ok(Node::synth_dir())
            }
            MapTarget::DirectMount { path, .. } => {
                let full = base.join(path);
                let st = stat_path(&full).await?;
                if !st.is_dir {
                    return Err(TransFsError::NotFound);
                }
                Ok(Node {
                    origin: Origin::RealDir { path: full },
                    size: 0,
                    mtime_ns: st.mtime_ns,
                })
            }
        }
    }

    /// Candidate source directories for a dynamic folder: one per extension
    /// spec whose `source_dir/<EXT>/` exists. When none exists but
    /// `source_dir/<folder>/` does, that semantic folder is the fallback.
    /// Existence comes from one cached scan of the source base rather than
    /// a stat per extension.
    pub(crate) async fn dynamic_source_dirs(
        &self,
        source_base: &Path,
        folder: &FileTypeFolder,
    ) -> Vec<PathBuf> {
        let scan = match self.listings.scan(source_base).await {
            Ok(scan) => scan,
            Err(_) => return Vec::new(),
        };

        let mut dirs = Vec::new();
        for spec in &folder.extensions {
            if scan.has_dir(spec.source()) {
                let dir = source_base.join(spec.source());
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }
        if dirs.is_empty() && scan.has_dir(&folder.folder) {
            dirs.push(source_base.join(&folder.folder));
        }
        dirs
    }

    /// List one dynamic virtual folder: merge matching files from every
    /// candidate directory, then fold in archives per the zip policy. Real
    /// files shadow archive members of the same display name; among files,
    /// the first listed extension wins.
    pub(crate) async fn list_dynamic_folder(
        &self,
        source_base: &Path,
        supports_zip: bool,
        zip_mode: ZipMode,
        folder: &FileTypeFolder,
    ) -> TransFsResult<Vec<VirtualEntry>> {
        let dirs = self.dynamic_source_dirs(source_base, folder).await;
        if dirs.is_empty() {
            return Err(TransFsError::NotFound);
        }

        let mut scans = Vec::new();
        for dir in dirs {
            match self.listings.scan(&dir).await {
                Ok(scan) => scans.push((dir, scan)),
                Err(TransFsError::NotFound) => continue,
                Err(e) => {
                    warn!(dir = %dir.display(), "excluding directory from listing: {e}");
                    continue;
                }
            }
        }

        let mut entries: BTreeMap<String, VirtualEntry> = BTreeMap::new();

        // Real files, in spec priority order.
        for spec in &folder.extensions {
            for (dir, scan) in &scans {
                for file in &scan.files {
                    if supports_zip && is_archive_name(&file.name) {
                        continue;
                    }
                    let Some(ext) = file_extension(&file.name) else {
                        continue;
                    };
                    if !spec.matches(ext) {
                        continue;
                    }
                    insert_first_wins(
                        &mut entries,
                        VirtualEntry {
                            name: spec.display_name(&file.name),
                            origin: Origin::RealFile {
                                path: dir.join(&file.name),
                            },
                            size: file.size,
                            mtime_ns: file.mtime_ns,
                        },
                    );
                }
            }
        }

        // Archives, transparently.
        if supports_zip {
            for (dir, scan) in &scans {
                for file in &scan.files {
                    if !is_archive_name(&file.name) {
                        continue;
                    }
                    let archive = dir.join(&file.name);
                    let snapshot = match self.archives.open(&archive).await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            warn!(archive = %archive.display(), "excluding archive from listing: {e}");
                            continue;
                        }
                    };
                    fold_archive(
                        &mut entries,
                        &archive,
                        &file.name,
                        &snapshot,
                        zip_mode,
                        Some(&folder.extensions),
                    );
                }
            }
        }

        let mut out: Vec<VirtualEntry> = entries.into_values().collect();
        sort_entries(&mut out);
        Ok(out)
    }

    /// List a passthrough directory (static map or direct mount). With
    /// `zip` set, archives are folded in per the mode with no extension
    /// filter; otherwise archives are plain files.
    pub(crate) async fn list_real_dir(
        &self,
        dir: &Path,
        zip: Option<ZipMode>,
    ) -> TransFsResult<Vec<VirtualEntry>> {
        let scan = self.listings.scan(dir).await?;
        let mut entries: BTreeMap<String, VirtualEntry> = BTreeMap::new();

        for sub in &scan.dirs {
            insert_first_wins(
                &mut entries,
                VirtualEntry {
                    name: sub.clone(),
                    origin: Origin::RealDir {
                        path: dir.join(sub),
                    },
                    size: 0,
                    mtime_ns: 0,
                },
            );
        }

        for file in &scan.files {
            if let Some(mode) = zip {
                if is_archive_name(&file.name) {
                    let archive = dir.join(&file.name);
                    match self.archives.open(&archive).await {
                        Ok(snapshot) => {
                            fold_archive(&mut entries, &archive, &file.name, &snapshot, mode, None);
                        }
                        Err(e) => {
                            warn!(archive = %archive.display(), "excluding archive from listing: {e}");
                        }
                    }
                    continue;
                }
            }
            insert_first_wins(
                &mut entries,
                VirtualEntry {
                    name: file.name.clone(),
                    origin: Origin::RealFile {
                        path: dir.join(&file.name),
                    },
                    size: file.size,
                    mtime_ns: file.mtime_ns,
                },
            );
        }

        let mut out: Vec<VirtualEntry> = entries.into_values().collect();
        sort_entries(&mut out);
        Ok(out)
    }

    /// List one level inside an archive presented as a directory. In
    /// flatten mode the contents are restricted to matching members (and
    /// the directories leading to them); hierarchical mode shows the full
    /// level unfiltered.
    pub(crate) async fn list_archive_dir(
        &self,
        archive: &Path,
        member_dir: &str,
        mode: ZipMode,
        specs: Option<&[ExtensionSpec]>,
    ) -> TransFsResult<Vec<VirtualEntry>> {
        let snapshot = self.archives.open(archive).await?;
        let listing = snapshot
            .list(member_dir)
            .ok_or(TransFsError::NotFound)?;

        let filter = match mode {
            ZipMode::Flatten => specs,
            ZipMode::Hierarchical => None,
        };

        let mut entries: BTreeMap<String, VirtualEntry> = BTreeMap::new();

        for sub in listing.dirs {
            let full = join_member(member_dir, &sub);
            if filter.is_some() && !dir_has_matching_member(&snapshot, &full, filter) {
                continue;
            }
            insert_first_wins(
                &mut entries,
                VirtualEntry {
                    name: sub,
                    origin: Origin::ArchiveDir {
                        archive: archive.to_path_buf(),
                        member_dir: full,
                    },
                    size: 0,
                    mtime_ns: snapshot.mtime_ns,
                },
            );
        }

        for (name, info) in listing.files {
            if !member_matches(filter, &name) {
                continue;
            }
            insert_first_wins(
                &mut entries,
                VirtualEntry {
                    name: member_display(filter, &name),
                    origin: Origin::ArchiveMember {
                        archive: archive.to_path_buf(),
                        member: join_member(member_dir, &name),
                    },
                    size: info.size,
                    mtime_ns: snapshot.mtime_ns,
                },
            );
        }

        let mut out: Vec<VirtualEntry> = entries.into_values().collect();
        sort_entries(&mut out);
        Ok(out)
    }
}

/// True when any member below `dir` passes the filter.
fn dir_has_matching_member(
    snapshot: &ArchiveSnapshot,
    dir: &str,
    filter: Option<&[ExtensionSpec]>,
) -> bool {
    let prefix = format!("{dir}/");
    snapshot
        .members()
        .any(|(name, _)| name.starts_with(&prefix) && member_matches(filter, member_basename(name)))
}

/// Fold one archive into a listing under construction, per the zip mode.
fn fold_archive(
    entries: &mut BTreeMap<String, VirtualEntry>,
    archive: &Path,
    archive_name: &str,
    snapshot: &ArchiveSnapshot,
    mode: ZipMode,
    specs: Option<&[ExtensionSpec]>,
) {
    match mode {
        ZipMode::Hierarchical => {
            insert_first_wins(
                entries,
                VirtualEntry {
                    name: archive_name.to_string(),
                    origin: Origin::ArchiveDir {
                        archive: archive.to_path_buf(),
                        member_dir: String::new(),
                    },
                    size: 0,
                    mtime_ns: snapshot.mtime_ns,
                },
            );
        }
        ZipMode::Flatten => {
            let matching: Vec<(&str, u64)> = snapshot
                .members()
                .filter(|(name, _)| member_matches(specs, member_basename(name)))
                .map(|(name, info)| (name, info.size))
                .collect();

            match matching.as_slice() {
                // Zero matches: the archive is hidden entirely.
                [] => {}
                // Exactly one match: the member takes the archive's place.
                [(member, size)] => {
                    let base = member_basename(member);
                    insert_first_wins(
                        entries,
                        VirtualEntry {
                            name: member_display(specs, base),
                            origin: Origin::ArchiveMember {
                                archive: archive.to_path_buf(),
                                member: (*member).to_string(),
                            },
                            size: *size,
                            mtime_ns: snapshot.mtime_ns,
                        },
                    );
                }
                // Multiple matches: browsable directory of the matches.
                _ => {
                    insert_first_wins(
                        entries,
                        VirtualEntry {
                            name: archive_name.to_string(),
                            origin: Origin::ArchiveDir {
                                archive: archive.to_path_buf(),
                                member_dir: String::new(),
                            },
                            size: 0,
                            mtime_ns: snapshot.mtime_ns,
                        },
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, dir: bool) -> VirtualEntry {
        VirtualEntry {
            name: name.to_string(),
            origin: if dir {
                Origin::SynthDir
            } else {
                Origin::RealFile {
                    path: PathBuf::from("/x"),
                }
            },
            size: 0,
            mtime_ns: 0,
        }
    }

    #[test]
    fn order_is_folders_first_then_case_insensitive() {
        let mut entries = vec![
            entry("zeta.uef", false),
            entry("Alpha", true),
            entry("beta", true),
            entry("ALPHA.uef", false),
        ];
        sort_entries(&mut entries);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["Alpha", "beta", "ALPHA.uef", "zeta.uef"]);
    }

    #[test]
    fn archive_names_detected_case_insensitively() {
        assert!(is_archive_name("Elite.zip"));
        assert!(is_archive_name("Elite.ZIP"));
        assert!(!is_archive_name("Elite.ssd"));
        assert!(!is_archive_name("zip"));
    }

    #[test]
    fn member_joining() {
        assert_eq!(join_member("", "a.ssd"), "a.ssd");
        assert_eq!(join_member("Disk1", "a.ssd"), "Disk1/a.ssd");
    }
}
