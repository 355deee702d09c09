//! FUSE driver: serves the virtual tree over the kernel FUSE protocol.
//!
//! ## Virtual filesystem layout
//!
//! ```text
//! physical filestore:
//!   Native/Acorn/Electron/Software/UEF/game.uef
//!   Native/Acorn/Electron/Software/SSD/Elite.zip   (one .ssd member)
//!
//! FUSE mountpoint /mnt/transfs:
//!   /mnt/transfs/
//!     MiSTer/
//!       AcornElectron/
//!         Tapes/game.uef          (passthrough)
//!         FDs/Elite.ssd           (member surfaced from Elite.zip)
//! ```
//!
//! The mount is read-only: directories are 0555, files 0444, and every
//! mutating operation returns EROFS. Archive members are served either
//! straight out of the archive (stored members) or from an extracted,
//! already-unlinked temp file owned by the open handle.

use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use fuse3::raw::prelude::*;
use fuse3::raw::MountHandle;
use fuse3::{Errno, FileType, MountOptions, SetAttr};
use futures_util::stream;
use tracing::{debug, info, warn};
use transfs_core::TransFsError;
use transfs_vfs::{Node, Origin, Vfs, VirtualEntry};

use crate::handle::{read_real_at, Handle, HandleTable};
use crate::inode::{child_path, parent_path, InodeTable, ROOT_INODE};

// ── Configuration ─────────────────────────────────────────────────────────

/// TTL for positive dentry/attr cache entries (FUSE kernel cache)
const ATTR_TTL: Duration = Duration::from_secs(1);

const PERM_FILE: u16 = 0o444; // r--r--r--
const PERM_DIR: u16 = 0o555; // r-xr-xr-x

// ── TransFs ───────────────────────────────────────────────────────────────

/// The FUSE filesystem driver.
pub struct TransFs {
    vfs: Arc<Vfs>,
    inodes: InodeTable,
    handles: HandleTable,
    uid: u32,
    gid: u32,
    /// Mount timestamp (atime/mtime for synthesised directories)
    mount_time: SystemTime,
}

impl TransFs {
    pub fn new(vfs: Arc<Vfs>) -> Self {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        TransFs {
            vfs,
            inodes: InodeTable::new(),
            handles: HandleTable::new(),
            uid,
            gid,
            mount_time: SystemTime::now(),
        }
    }

    fn time_of(&self, mtime_ns: u64) -> SystemTime {
        if mtime_ns == 0 {
            self.mount_time
        } else {
            UNIX_EPOCH + Duration::from_nanos(mtime_ns)
        }
    }

    fn file_attr(&self, ino: u64, size: u64, mtime_ns: u64) -> FileAttr {
        let time = self.time_of(mtime_ns);
        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: time.into(),
            mtime: time.into(),
            ctime: time.into(),
            #[cfg(target_os = "macos")]
            crtime: time.into(),
            kind: FileType::RegularFile,
            perm: PERM_FILE,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            #[cfg(target_os = "macos")]
            flags: 0,
        }
    }

    fn dir_attr(&self, ino: u64, mtime_ns: u64) -> FileAttr {
        let time = self.time_of(mtime_ns);
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: time.into(),
            mtime: time.into(),
            ctime: time.into(),
            #[cfg(target_os = "macos")]
            crtime: time.into(),
            kind: FileType::Directory,
            perm: PERM_DIR,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            #[cfg(target_os = "macos")]
            flags: 0,
        }
    }

    fn node_attr(&self, ino: u64, node: &Node) -> FileAttr {
        if node.is_dir() {
            self.dir_attr(ino, node.mtime_ns)
        } else {
            self.file_attr(ino, node.size, node.mtime_ns)
        }
    }

    fn entry_attr(&self, ino: u64, entry: &VirtualEntry) -> FileAttr {
        if entry.is_dir() {
            self.dir_attr(ino, entry.mtime_ns)
        } else {
            self.file_attr(ino, entry.size, entry.mtime_ns)
        }
    }

    /// Map a resolution failure onto an errno, logging per the error policy.
    fn op_error(&self, vpath: &str, e: TransFsError) -> Errno {
        match &e {
            TransFsError::NotFound => debug!(vpath, "ENOENT"),
            TransFsError::MalformedArchive { .. } => warn!(vpath, "{e}"),
            _ => debug!(vpath, "{e}"),
        }
        Errno::from(e.errno())
    }

    /// The virtual path behind a kernel inode; a stale id is ENOENT.
    fn vpath_of(&self, ino: u64) -> fuse3::Result<String> {
        self.inodes
            .get(ino)
            .map(|entry| entry.vpath)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    async fn resolve_inode(&self, ino: u64) -> fuse3::Result<(String, Node)> {
        let vpath = self.vpath_of(ino)?;
        match self.vfs.resolve(&vpath).await {
            Ok(node) => Ok((vpath, node)),
            Err(e) => Err(self.op_error(&vpath, e)),
        }
    }
}

// ── Filesystem impl ───────────────────────────────────────────────────────

impl Filesystem for TransFs {
    async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
        debug!("transfs init");
        Ok(ReplyInit {
            max_write: NonZeroU32::new(128 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!("transfs unmounted");
    }

    async fn lookup(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
    ) -> fuse3::Result<ReplyEntry> {
        let parent_vpath = self.vpath_of(parent)?;
        let name = name.to_str().ok_or_else(|| Errno::from(libc::ENOENT))?;
        let vpath = child_path(&parent_vpath, name);

        let node = self
            .vfs
            .resolve(&vpath)
            .await
            .map_err(|e| self.op_error(&vpath, e))?;

        let ino = self.inodes.register(&vpath, &node.origin);
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: self.node_attr(ino, &node),
            generation: 0,
        })
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.forget(inode, nlookup);
    }

    async fn getattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> fuse3::Result<ReplyAttr> {
        if inode == ROOT_INODE {
            return Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr: self.dir_attr(ROOT_INODE, 0),
            });
        }
        let (_, node) = self.resolve_inode(inode).await?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: self.node_attr(inode, &node),
        })
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> fuse3::Result<ReplyOpen> {
        if flags as i32 & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(Errno::from(libc::EROFS));
        }

        let (vpath, node) = self.resolve_inode(inode).await?;

        let handle = match &node.origin {
            Origin::RealFile { path } => {
                let path = path.clone();
                let file = tokio::task::spawn_blocking(move || std::fs::File::open(&path))
                    .await
                    .map_err(|_| Errno::from(libc::EIO))?
                    .map_err(|e| self.op_error(&vpath, TransFsError::from_stat(e)))?;
                Handle::Real {
                    file: Arc::new(file),
                    len: node.size,
                }
            }
            Origin::ArchiveMember { archive, member } => {
                let snapshot = self
                    .vfs
                    .archives()
                    .open(archive)
                    .await
                    .map_err(|e| self.op_error(&vpath, e))?;
                let reader = self
                    .vfs
                    .archives()
                    .open_member(&snapshot, member)
                    .await
                    .map_err(|e| self.op_error(&vpath, e))?;
                Handle::Member {
                    reader: Arc::new(reader),
                }
            }
            _ => return Err(Errno::from(libc::EISDIR)),
        };

        let fh = self.handles.insert(handle);
        debug!(vpath = %vpath, fh, "opened");
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> fuse3::Result<ReplyData> {
        let handle = self.handles.get(fh).ok_or_else(|| Errno::from(libc::EBADF))?;

        let data = match handle {
            Handle::Real { file, len } => {
                tokio::task::spawn_blocking(move || read_real_at(&file, len, offset, size))
                    .await
                    .map_err(|_| Errno::from(libc::EIO))?
                    .map_err(|e| Errno::from(e.raw_os_error().unwrap_or(libc::EIO)))?
            }
            Handle::Member { reader } => {
                tokio::task::spawn_blocking(move || reader.read_at(offset, size))
                    .await
                    .map_err(|_| Errno::from(libc::EIO))?
                    .map_err(|e| Errno::from(e.raw_os_error().unwrap_or(libc::EIO)))?
            }
            Handle::Dir { .. } => return Err(Errno::from(libc::EISDIR)),
        };

        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> fuse3::Result<()> {
        self.handles.remove(fh);
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, _inode: u64, mask: u32) -> fuse3::Result<()> {
        if mask as i32 & libc::W_OK != 0 {
            return Err(Errno::from(libc::EROFS));
        }
        Ok(())
    }

    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> fuse3::Result<ReplyOpen> {
        let (vpath, node) = self.resolve_inode(inode).await?;
        if !node.is_dir() {
            return Err(Errno::from(libc::ENOTDIR));
        }

        // Materialise the listing once; readdir slices it by offset.
        let entries = self
            .vfs
            .list_dir(&vpath)
            .await
            .map_err(|e| self.op_error(&vpath, e))?;
        let fh = self.handles.insert(Handle::Dir {
            entries: Arc::new(entries),
        });
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
    ) -> fuse3::Result<()> {
        self.handles.remove(fh);
        Ok(())
    }

    // Directory entry stream types
    type DirEntryStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir(
        &self,
        _req: Request,
        parent: u64,
        fh: u64,
        offset: i64,
    ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'_>>> {
        let vpath = self.vpath_of(parent)?;
        let listing = match self.handles.get(fh) {
            Some(Handle::Dir { entries }) => entries,
            _ => return Err(Errno::from(libc::EBADF)),
        };

        let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::new();

        if offset == 0 {
            entries.push(Ok(DirectoryEntry {
                inode: parent,
                kind: FileType::Directory,
                name: ".".into(),
                offset: 1,
            }));
        }
        if offset <= 1 {
            entries.push(Ok(DirectoryEntry {
                inode: self.inodes.peek(parent_path(&vpath)),
                kind: FileType::Directory,
                name: "..".into(),
                offset: 2,
            }));
        }

        let mut next_offset = 3i64;
        for entry in listing.iter() {
            if next_offset > offset {
                entries.push(Ok(DirectoryEntry {
                    inode: self.inodes.peek(&child_path(&vpath, &entry.name)),
                    kind: if entry.is_dir() {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    },
                    name: entry.name.clone().into(),
                    offset: next_offset,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectory {
            entries: stream::iter(entries),
        })
    }

    async fn readdirplus(
        &self,
        _req: Request,
        parent: u64,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'_>>> {
        let vpath = self.vpath_of(parent)?;
        let listing = match self.handles.get(fh) {
            Some(Handle::Dir { entries }) => entries,
            _ => return Err(Errno::from(libc::EBADF)),
        };

        let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> = Vec::new();
        let offset = offset as i64;
        let parent_attr = self.dir_attr(parent, 0);

        if offset == 0 {
            entries.push(Ok(DirectoryEntryPlus {
                inode: parent,
                generation: 0,
                kind: FileType::Directory,
                name: ".".into(),
                offset: 1,
                attr: parent_attr,
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }
        if offset <= 1 {
            let ppath = parent_path(&vpath);
            entries.push(Ok(DirectoryEntryPlus {
                inode: self.inodes.peek(ppath),
                generation: 0,
                kind: FileType::Directory,
                name: "..".into(),
                offset: 2,
                attr: self.dir_attr(self.inodes.peek(ppath), 0),
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }

        let mut next_offset = 3i64;
        for entry in listing.iter() {
            if next_offset > offset {
                // Entries returned by readdirplus are kernel lookups.
                let ino = self
                    .inodes
                    .register(&child_path(&vpath, &entry.name), &entry.origin);
                entries.push(Ok(DirectoryEntryPlus {
                    inode: ino,
                    generation: 0,
                    kind: if entry.is_dir() {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    },
                    name: entry.name.clone().into(),
                    offset: next_offset,
                    attr: self.entry_attr(ino, entry),
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            next_offset += 1;
        }

        Ok(ReplyDirectoryPlus {
            entries: stream::iter(entries),
        })
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> fuse3::Result<ReplyStatFs> {
        let root = self.vfs.filestore().to_path_buf();
        let stat = tokio::task::spawn_blocking(move || {
            let path = std::ffi::CString::new(root.as_os_str().as_bytes())
                .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
            let mut out: libc::statvfs = unsafe { std::mem::zeroed() };
            if unsafe { libc::statvfs(path.as_ptr(), &mut out) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(out)
        })
        .await
        .map_err(|_| Errno::from(libc::EIO))?
        .map_err(|e| Errno::from(e.raw_os_error().unwrap_or(libc::EIO)))?;

        Ok(ReplyStatFs {
            blocks: stat.f_blocks,
            bfree: stat.f_bfree,
            bavail: stat.f_bavail,
            files: stat.f_files,
            ffree: stat.f_ffree,
            bsize: stat.f_bsize as u32,
            namelen: stat.f_namemax as u32,
            frsize: stat.f_frsize as u32,
        })
    }

    // ── Write operations: the whole mount is read-only ───────────────────

    async fn setattr(
        &self,
        _req: Request,
        _inode: u64,
        _fh: Option<u64>,
        _set_attr: SetAttr,
    ) -> fuse3::Result<ReplyAttr> {
        Err(Errno::from(libc::EROFS))
    }

    async fn mknod(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> fuse3::Result<ReplyEntry> {
        Err(Errno::from(libc::EROFS))
    }

    async fn mkdir(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> fuse3::Result<ReplyEntry> {
        Err(Errno::from(libc::EROFS))
    }

    async fn unlink(&self, _req: Request, _parent: u64, _name: &OsStr) -> fuse3::Result<()> {
        Err(Errno::from(libc::EROFS))
    }

    async fn rmdir(&self, _req: Request, _parent: u64, _name: &OsStr) -> fuse3::Result<()> {
        Err(Errno::from(libc::EROFS))
    }

    async fn rename(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> fuse3::Result<()> {
        Err(Errno::from(libc::EROFS))
    }

    async fn symlink(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _link: &OsStr,
    ) -> fuse3::Result<ReplyEntry> {
        Err(Errno::from(libc::EROFS))
    }

    async fn link(
        &self,
        _req: Request,
        _inode: u64,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> fuse3::Result<ReplyEntry> {
        Err(Errno::from(libc::EROFS))
    }

    async fn create(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> fuse3::Result<ReplyCreated> {
        Err(Errno::from(libc::EROFS))
    }

    async fn write(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _offset: u64,
        _data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> fuse3::Result<ReplyWrite> {
        Err(Errno::from(libc::EROFS))
    }

    async fn fallocate(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _offset: u64,
        _length: u64,
        _mode: u32,
    ) -> fuse3::Result<()> {
        Err(Errno::from(libc::EROFS))
    }
}

// ── Public mount API ──────────────────────────────────────────────────────

/// Mount the virtual tree and return the handle. Await the handle to block
/// until unmounted, or call `unmount()` for a signal-driven teardown.
pub async fn mount(vfs: Arc<Vfs>) -> std::io::Result<MountHandle> {
    let mountpoint = vfs.config().app.mountpoint.clone();
    let fs = TransFs::new(vfs);

    let mut opts = MountOptions::default();
    opts.fs_name("transfs");
    opts.read_only(true);
    opts.force_readdir_plus(true);

    info!(mountpoint = %mountpoint.display(), "mounting transfs (unprivileged via fusermount3)");

    Session::new(opts)
        .mount_with_unprivileged(fs, &mountpoint)
        .await
}
