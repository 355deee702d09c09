//! Map resolver: computes the physical resolution of a virtual path and
//! drives the descent through passthrough trees and archives.
//!
//! Resolution of names produced by the listing engine goes back through the
//! listing engine itself, so lookup and readdir can never disagree about
//! aliasing, shadowing, or flatten decisions.

use std::path::{Path, PathBuf};

use tracing::debug;
use transfs_core::config::MapTarget;
use transfs_core::types::{ExtensionSpec, ZipMode};
use transfs_core::{TransFsError, TransFsResult};

use crate::locate::stat_path;
use crate::path::{parse, ParsedPath};
use crate::types::{Node, Origin, VirtualEntry};
use crate::Vfs;

fn join_components(base: PathBuf, components: &[String]) -> PathBuf {
    components.iter().fold(base, |path, comp| path.join(comp))
}

impl Vfs {
    /// Resolve a virtual path to a node. `NotFound` is the normal negative
    /// answer; misses are remembered in the negative cache for the TTL.
    pub async fn resolve(&self, vpath: &str) -> TransFsResult<Node> {
        if self.negative.contains(vpath) {
            debug!(vpath, "negative cache hit");
            return Err(TransFsError::NotFound);
        }
        let result = self.resolve_uncached(vpath).await;
        if matches!(result, Err(TransFsError::NotFound)) {
            self.negative.insert(vpath);
        }
        result
    }

    async fn resolve_uncached(&self, vpath: &str) -> TransFsResult<Node> {
        match parse(&self.config, vpath)? {
            ParsedPath::Root | ParsedPath::Client { .. } | ParsedPath::System { .. } => {
                Ok(Node::synth_dir())
            }
            ParsedPath::InSystem {
                system,
                target,
                subpath,
                ..
            } => {
                let base = system.native_root(self.filestore());
                match target {
                    MapTarget::Static { source_dir } => {
                        self.resolve_passthrough(base.join(source_dir), &subpath, None)
                            .await
                    }
                    MapTarget::DefaultSource { .. } => {
                        if !subpath.is_empty() {
                            return Err(TransFsError::NotFound);
                        }
                        self.target_node(system, &target).await
                    }
                    MapTarget::DynamicFolder {
                        source_dir,
                        supports_zip,
                        zip_mode,
                        folder,
                    } => {
                        if subpath.is_empty() {
                            return self.target_node(system, &target).await;
                        }
                        let entries = self
                            .list_dynamic_folder(
                                &base.join(source_dir),
                                supports_zip,
                                zip_mode,
                                folder,
                            )
                            .await?;
                        let child = find_entry(&entries, &subpath[0])?;
                        if subpath.len() == 1 {
                            return Ok(child.node());
                        }
                        match &child.origin {
                            Origin::ArchiveDir {
                                archive,
                                member_dir,
                            } => {
                                self.resolve_in_archive(
                                    archive,
                                    member_dir,
                                    &subpath[1..],
                                    zip_mode,
                                    Some(&folder.extensions),
                                )
                                .await
                            }
                            _ => Err(TransFsError::NotFound),
                        }
                    }
                    MapTarget::DirectMount {
                        path,
                        supports_zip,
                        zip_mode,
                    } => {
                        self.resolve_passthrough(
                            base.join(path),
                            &subpath,
                            supports_zip.then_some(zip_mode),
                        )
                        .await
                    }
                }
            }
        }
    }

    /// Resolve inside a passthrough tree. Without zip transparency this is a
    /// plain stat of the joined path; with it, each level goes through the
    /// listing engine so archive entries resolve consistently.
    async fn resolve_passthrough(
        &self,
        root: PathBuf,
        subpath: &[String],
        zip: Option<ZipMode>,
    ) -> TransFsResult<Node> {
        if zip.is_none() || subpath.is_empty() {
            let path = join_components(root, subpath);
            let st = stat_path(&path).await?;
            return Ok(if st.is_dir {
                Node {
                    origin: Origin::RealDir { path },
                    size: 0,
                    mtime_ns: st.mtime_ns,
                }
            } else {
                Node {
                    origin: Origin::RealFile { path },
                    size: st.size,
                    mtime_ns: st.mtime_ns,
                }
            });
        }

        let mode = zip.expect("checked above");
        let mut origin = Origin::RealDir { path: root };
        for (i, comp) in subpath.iter().enumerate() {
            let entries = match &origin {
                Origin::RealDir { path } => self.list_real_dir(path, Some(mode)).await?,
                Origin::ArchiveDir {
                    archive,
                    member_dir,
                } => {
                    let (archive, member_dir) = (archive.clone(), member_dir.clone());
                    return self
                        .resolve_in_archive(&archive, &member_dir, &subpath[i..], mode, None)
                        .await;
                }
                _ => return Err(TransFsError::NotFound),
            };
            let child = find_entry(&entries, comp)?;
            if i == subpath.len() - 1 {
                return Ok(child.node());
            }
            origin = child.origin.clone();
        }
        unreachable!("subpath verified non-empty")
    }

    /// Walk archive levels by listing each one, so filtering and alias
    /// display match readdir exactly.
    pub(crate) async fn resolve_in_archive(
        &self,
        archive: &Path,
        member_dir: &str,
        components: &[String],
        mode: ZipMode,
        specs: Option<&[ExtensionSpec]>,
    ) -> TransFsResult<Node> {
        let mut member_dir = member_dir.to_string();
        for (i, comp) in components.iter().enumerate() {
            let entries = self
                .list_archive_dir(archive, &member_dir, mode, specs)
                .await?;
            let child = find_entry(&entries, comp)?;
            if i == components.len() - 1 {
                return Ok(child.node());
            }
            match &child.origin {
                Origin::ArchiveDir {
                    member_dir: next, ..
                } => member_dir = next.clone(),
                _ => return Err(TransFsError::NotFound),
            }
        }
        // Empty component list: the archive directory itself.
        let snapshot = self.archives.open(archive).await?;
        if !snapshot.is_dir(&member_dir) {
            return Err(TransFsError::NotFound);
        }
        Ok(Node {
            origin: Origin::ArchiveDir {
                archive: archive.to_path_buf(),
                member_dir,
            },
            size: 0,
            mtime_ns: snapshot.mtime_ns,
        })
    }

    /// Materialise the full listing of a virtual directory.
    pub async fn list_dir(&self, vpath: &str) -> TransFsResult<Vec<VirtualEntry>> {
        match parse(&self.config, vpath)? {
            ParsedPath::Root => Ok(self.list_root()),
            ParsedPath::Client { client } => Ok(self.list_client(client)),
            ParsedPath::System { system, .. } => self.list_system(system).await,
            ParsedPath::InSystem {
                system,
                target,
                subpath,
                ..
            } => {
                let base = system.native_root(self.filestore());
                match target {
                    MapTarget::Static { source_dir } => {
                        let dir = join_components(base.join(source_dir), &subpath);
                        self.list_real_dir(&dir, None).await
                    }
                    MapTarget::DefaultSource { .. } => Err(TransFsError::NotFound),
                    MapTarget::DynamicFolder {
                        source_dir,
                        supports_zip,
                        zip_mode,
                        folder,
                    } => {
                        let source_base = base.join(source_dir);
                        if subpath.is_empty() {
                            return self
                                .list_dynamic_folder(&source_base, supports_zip, zip_mode, folder)
                                .await;
                        }
                        let node = self.resolve(vpath).await?;
                        match node.origin {
                            Origin::ArchiveDir {
                                archive,
                                member_dir,
                            } => {
                                self.list_archive_dir(
                                    &archive,
                                    &member_dir,
                                    zip_mode,
                                    Some(&folder.extensions),
                                )
                                .await
                            }
                            _ => Err(TransFsError::NotFound),
                        }
                    }
                    MapTarget::DirectMount {
                        path,
                        supports_zip,
                        zip_mode,
                    } => {
                        let root = base.join(path);
                        if !supports_zip {
                            let dir = join_components(root, &subpath);
                            return self.list_real_dir(&dir, None).await;
                        }
                        if subpath.is_empty() {
                            return self.list_real_dir(&root, Some(zip_mode)).await;
                        }
                        let node = self.resolve(vpath).await?;
                        match node.origin {
                            Origin::RealDir { path } => {
                                self.list_real_dir(&path, Some(zip_mode)).await
                            }
                            Origin::ArchiveDir {
                                archive,
                                member_dir,
                            } => {
                                self.list_archive_dir(&archive, &member_dir, zip_mode, None)
                                    .await
                            }
                            _ => Err(TransFsError::NotFound),
                        }
                    }
                }
            }
        }
    }
}

fn find_entry<'e>(entries: &'e [VirtualEntry], name: &str) -> TransFsResult<&'e VirtualEntry> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .ok_or(TransFsError::NotFound)
}
