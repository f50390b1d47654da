//! Inode number management
//!
//! The kernel speaks in inode numbers while the overlay works on paths.
//! This table hands out virtual inode numbers for logical paths and keeps
//! both directions of the mapping, with lookup counts so entries can be
//! dropped when the kernel forgets them.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inode number of the mount root
pub const ROOT_INO: u64 = 1;

/// File type as reported to the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for FileKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

impl FileKind {
    pub fn to_fuser_type(&self) -> fuser::FileType {
        match self {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::Symlink => fuser::FileType::Symlink,
            FileKind::BlockDevice => fuser::FileType::BlockDevice,
            FileKind::CharDevice => fuser::FileType::CharDevice,
            FileKind::Fifo => fuser::FileType::NamedPipe,
            FileKind::Socket => fuser::FileType::Socket,
        }
    }
}

fn epoch_plus(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
    }
}

/// Build kernel attributes from real metadata under a virtual inode number
pub fn file_attr(ino: u64, meta: &Metadata) -> fuser::FileAttr {
    fuser::FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: epoch_plus(meta.atime(), meta.atime_nsec()),
        mtime: epoch_plus(meta.mtime(), meta.mtime_nsec()),
        ctime: epoch_plus(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: FileKind::from(meta.file_type()).to_fuser_type(),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

#[derive(Debug, Clone)]
struct InodeEntry {
    path: PathBuf,
    lookups: u64,
}

/// Maps virtual inode numbers to logical paths
pub struct InodeTable {
    /// Next virtual inode number
    next_ino: AtomicU64,
    /// ino -> entry
    inodes: RwLock<HashMap<u64, InodeEntry>>,
    /// Path -> ino (for lookups)
    path_to_ino: RwLock<HashMap<PathBuf, u64>>,
    /// Handed out by listings and never looked up; locked after the maps
    listed: Mutex<HashSet<u64>>,
}

impl InodeTable {
    pub fn new() -> Self {
        let table = Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            inodes: RwLock::new(HashMap::new()),
            path_to_ino: RwLock::new(HashMap::new()),
            listed: Mutex::new(HashSet::new()),
        };
        let root = PathBuf::from("/");
        table.inodes.write().insert(
            ROOT_INO,
            InodeEntry {
                path: root.clone(),
                lookups: 1,
            },
        );
        table.path_to_ino.write().insert(root, ROOT_INO);
        table
    }

    /// Logical path of an inode
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.read().get(&ino).map(|e| e.path.clone())
    }

    /// Inode for a path, allocating one if needed; counts one kernel lookup
    pub fn lookup(&self, path: &Path) -> u64 {
        self.get_or_insert(path, 1)
    }

    /// Inode for a directory listing entry; not a counted lookup
    pub fn ino_for(&self, path: &Path) -> u64 {
        self.get_or_insert(path, 0)
    }

    fn get_or_insert(&self, path: &Path, count: u64) -> u64 {
        let mut inodes = self.inodes.write();
        let mut paths = self.path_to_ino.write();

        if let Some(&ino) = paths.get(path) {
            if let Some(entry) = inodes.get_mut(&ino) {
                entry.lookups += count;
                if count > 0 {
                    self.listed.lock().remove(&ino);
                }
                return ino;
            }
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        inodes.insert(
            ino,
            InodeEntry {
                path: path.to_path_buf(),
                lookups: count,
            },
        );
        paths.insert(path.to_path_buf(), ino);
        if count == 0 {
            self.listed.lock().insert(ino);
        }
        ino
    }

    fn remove_entry(
        inodes: &mut HashMap<u64, InodeEntry>,
        paths: &mut HashMap<PathBuf, u64>,
        ino: u64,
    ) {
        if let Some(entry) = inodes.remove(&ino) {
            if paths.get(&entry.path) == Some(&ino) {
                paths.remove(&entry.path);
            }
        }
    }

    /// Kernel dropped `nlookup` references to `ino`
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut inodes = self.inodes.write();
        let mut paths = self.path_to_ino.write();
        let done = match inodes.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };
        if done {
            Self::remove_entry(&mut inodes, &mut paths, ino);
        }

        // listing-only entries go once the kernel starts letting go
        for listed in self.listed.lock().drain() {
            if inodes.get(&listed).map_or(false, |e| e.lookups == 0) {
                Self::remove_entry(&mut inodes, &mut paths, listed);
            }
        }
    }

    /// Path no longer names this inode (unlink/rmdir); an inode the
    /// kernel never looked up goes with it
    pub fn detach(&self, path: &Path) {
        let mut inodes = self.inodes.write();
        let mut paths = self.path_to_ino.write();
        if let Some(ino) = paths.remove(path) {
            if inodes.get(&ino).map_or(false, |e| e.lookups == 0) {
                inodes.remove(&ino);
                self.listed.lock().remove(&ino);
            }
        }
    }

    /// Move a path and everything below it
    pub fn rename(&self, old: &Path, new: &Path) {
        let mut inodes = self.inodes.write();
        let mut paths = self.path_to_ino.write();

        paths.remove(new);
        let moved: Vec<(PathBuf, u64)> = paths
            .iter()
            .filter(|(p, _)| p.starts_with(old))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();

        for (path, ino) in moved {
            paths.remove(&path);
            let rest = path.strip_prefix(old).unwrap_or(Path::new(""));
            let renamed = if rest.as_os_str().is_empty() {
                new.to_path_buf()
            } else {
                new.join(rest)
            };
            if let Some(entry) = inodes.get_mut(&ino) {
                entry.path = renamed.clone();
            }
            paths.insert(renamed, ino);
        }
    }

    /// Number of live inodes, root included
    pub fn len(&self) -> usize {
        self.inodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
