//! Open handle table.
//!
//! A file handle wraps either a passthrough OS descriptor or an archive
//! member reader (which owns its extracted, already-unlinked temp file).
//! A directory handle owns the listing materialised at opendir, so readdir
//! pagination stays stable however the physical store changes in between.
//! Each handle is owned exclusively by the kernel fh; the table lock only
//! protects allocation and teardown.

use std::collections::HashMap;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use transfs_archive::MemberReader;
use transfs_vfs::VirtualEntry;

#[derive(Clone)]
pub enum Handle {
    /// Passthrough file: reads go straight to the OS descriptor.
    Real { file: Arc<std::fs::File>, len: u64 },
    /// Archive member: reads go through the member reader's window.
    Member { reader: Arc<MemberReader> },
    /// Open directory: the listing snapshot readdir slices by offset.
    Dir { entries: Arc<Vec<VirtualEntry>> },
}

pub struct HandleTable {
    next: AtomicU64,
    handles: Mutex<HashMap<u64, Handle>>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            next: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, handle: Handle) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(fh, handle);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Handle> {
        self.handles.lock().unwrap().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Handle> {
        self.handles.lock().unwrap().remove(&fh)
    }

    pub fn count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        HandleTable::new()
    }
}

/// Positioned read against a passthrough descriptor. Short reads happen
/// only at end of file; reads past the end return an empty buffer.
pub fn read_real_at(file: &std::fs::File, len: u64, offset: u64, size: u32) -> std::io::Result<Vec<u8>> {
    if offset >= len {
        return Ok(Vec::new());
    }
    let end = (offset + u64::from(size)).min(len);
    let mut buf = vec![0u8; (end - offset) as usize];
    let mut done = 0usize;
    while done < buf.len() {
        let n = file.read_at(&mut buf[done..], offset + done as u64)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    buf.truncate(done);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_allocate_and_release() {
        let table = HandleTable::new();
        let file = tempfile::tempfile().unwrap();
        let fh = table.insert(Handle::Real {
            file: Arc::new(file),
            len: 0,
        });
        assert!(table.get(fh).is_some());
        assert!(table.remove(fh).is_some());
        assert!(table.get(fh).is_none());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn fhs_are_unique() {
        let table = HandleTable::new();
        let a = table.insert(Handle::Dir {
            entries: Arc::new(Vec::new()),
        });
        let b = table.insert(Handle::Dir {
            entries: Arc::new(Vec::new()),
        });
        assert_ne!(a, b);
    }

    #[test]
    fn positioned_reads_clamp_to_eof() {
        use std::io::Write;

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"HELLOWORLD").unwrap();

        assert_eq!(read_real_at(&file, 10, 0, 5).unwrap(), b"HELLO");
        assert_eq!(read_real_at(&file, 10, 5, 64).unwrap(), b"WORLD");
        assert!(read_real_at(&file, 10, 10, 4).unwrap().is_empty());
        assert!(read_real_at(&file, 10, 200, 4).unwrap().is_empty());
    }
}
