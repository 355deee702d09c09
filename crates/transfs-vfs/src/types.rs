use std::path::PathBuf;

/// Where a virtual node's bytes (or children) physically live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Passthrough file on the physical store
    RealFile { path: PathBuf },
    /// Passthrough directory on the physical store
    RealDir { path: PathBuf },
    /// One file member of an archive
    ArchiveMember { archive: PathBuf, member: String },
    /// A directory level inside an archive; the empty member path is the
    /// archive root presented as a directory
    ArchiveDir { archive: PathBuf, member_dir: String },
    /// Synthesised directory whose children come from the listing engine
    /// (root, client, system, and dynamic virtual folders)
    SynthDir,
}

impl Origin {
    pub fn is_dir(&self) -> bool {
        matches!(
            self,
            Origin::RealDir { .. } | Origin::ArchiveDir { .. } | Origin::SynthDir
        )
    }
}

/// A resolved virtual node: identity plus the attribute hints getattr needs.
#[derive(Debug, Clone)]
pub struct Node {
    pub origin: Origin,
    /// Uncompressed size for files; 0 for directories
    pub size: u64,
    /// Backing mtime where one exists; 0 for synthesised directories
    pub mtime_ns: u64,
}

impl Node {
    pub fn synth_dir() -> Node {
        Node {
            origin: Origin::SynthDir,
            size: 0,
            mtime_ns: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.origin.is_dir()
    }
}

/// One entry of a materialised virtual directory listing.
#[derive(Debug, Clone)]
pub struct VirtualEntry {
    pub name: String,
    pub origin: Origin,
    pub size: u64,
    pub mtime_ns: u64,
}

impl VirtualEntry {
    pub fn is_dir(&self) -> bool {
        self.origin.is_dir()
    }

    pub fn node(&self) -> Node {
        Node {
            origin: self.origin.clone(),
            size: self.size,
            mtime_ns: self.mtime_ns,
        }
    }
}
