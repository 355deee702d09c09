//! TransFS FUSE layer: the fuse3 driver plus the inode and open-handle
//! bookkeeping it needs. The mount is read-only; every mutating operation
//! is refused with EROFS.

mod driver;
mod handle;
mod inode;

pub use driver::{mount, TransFs};
pub use inode::ROOT_INODE;
