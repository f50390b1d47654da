//! Filesystem layer
//!
//! [`Overlay`] implements every operation on logical paths on top of the
//! backing tree and the container manager. [`SbxFs`] exposes it to the
//! kernel through FUSE.

mod filesystem;
mod handle;
pub mod inode;
mod overlay;
mod real;

pub use filesystem::SbxFs;
pub use handle::{HandleTable, OpenFile};
pub use overlay::{DirEntry, Overlay};
pub use real::{RealDirEntry, RealLayer, StatFs};
