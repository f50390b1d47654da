//! Open file handle management

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// An open real file
pub struct OpenFile {
    /// Handle ID given to the kernel
    pub fh: u64,
    /// Logical path; follows renames while open
    path: RwLock<PathBuf>,
    /// OS handle on the real file
    pub file: File,
    /// Open flags
    pub flags: i32,
    /// Has the file been written through this handle?
    dirty: AtomicBool,
}

impl OpenFile {
    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Current logical path
    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    fn retarget(&self, path: PathBuf) {
        *self.path.write() = path;
    }
}

/// Manages open file handles
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<OpenFile>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an OS handle and return its ID
    pub fn open(&self, path: &Path, file: File, flags: i32) -> Arc<OpenFile> {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        let handle = Arc::new(OpenFile {
            fh,
            path: RwLock::new(path.to_path_buf()),
            file,
            flags,
            dirty: AtomicBool::new(false),
        });
        self.handles.write().insert(fh, handle.clone());
        handle
    }

    /// Get handle by ID
    pub fn get(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Close handle and return it
    pub fn close(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.write().remove(&fh)
    }

    /// Point handles under `old` at their new location after a rename
    pub fn retarget_under(&self, old: &Path, new: &Path) {
        for handle in self.handles.read().values() {
            let current = handle.path();
            if let Ok(rest) = current.strip_prefix(old) {
                let moved = if rest.as_os_str().is_empty() {
                    new.to_path_buf()
                } else {
                    new.join(rest)
                };
                handle.retarget(moved);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
