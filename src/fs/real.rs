//! Pass-through access to the backing tree
//!
//! Every call takes a logical path, resolves it under the root and
//! performs the operation on the real file. Container sidecars are never
//! reported as directory entries.

use nix::sys::stat::{Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;
use std::ffi::OsString;
use std::fs::{self, Metadata, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::mapper::{is_container_name, PathMapper};

/// Directory entry from the backing tree
#[derive(Debug, Clone)]
pub struct RealDirEntry {
    pub name: OsString,
    pub file_type: fs::FileType,
}

/// Filesystem statistics for the backing tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

fn os_err(path: &Path, e: nix::errno::Errno) -> Error {
    Error::from_io(path, io::Error::from_raw_os_error(e as i32))
}

fn timespec(t: Option<SystemTime>) -> TimeSpec {
    match t {
        None => TimeSpec::UTIME_OMIT,
        Some(t) => TimeSpec::from(t.duration_since(UNIX_EPOCH).unwrap_or_default()),
    }
}

/// Relative path leading from directory `from` to `to`
fn relative_to(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let to: Vec<Component> = to.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for c in &to[common..] {
        out.push(c.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Pass-through interface to the backing tree
pub struct RealLayer {
    mapper: PathMapper,
}

impl RealLayer {
    pub fn new(mapper: PathMapper) -> Result<Self> {
        let root = mapper.root();
        if !root.is_dir() {
            return Err(Error::NotFound(root.to_path_buf()));
        }
        Ok(Self { mapper })
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Metadata without following a final symlink
    pub fn metadata(&self, logical: &Path) -> Result<Metadata> {
        let real = self.mapper.resolve_real(logical);
        fs::symlink_metadata(&real).map_err(|e| Error::from_io(&real, e))
    }

    pub fn exists(&self, logical: &Path) -> bool {
        fs::symlink_metadata(self.mapper.resolve_real(logical)).is_ok()
    }

    /// Check access for the calling process
    pub fn access(&self, logical: &Path, mask: i32) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        nix::unistd::access(&real, AccessFlags::from_bits_truncate(mask))
            .map_err(|e| os_err(&real, e))
    }

    /// Read directory entries, leaving out container sidecars
    pub fn readdir(&self, logical: &Path) -> Result<Vec<RealDirEntry>> {
        let real = self.mapper.resolve_real(logical);
        let mut entries = Vec::new();

        for entry in fs::read_dir(&real).map_err(|e| Error::from_io(&real, e))? {
            let entry = entry?;
            let name = entry.file_name();
            if is_container_name(&name) {
                continue;
            }
            entries.push(RealDirEntry {
                name,
                file_type: entry.file_type()?,
            });
        }

        Ok(entries)
    }

    /// Read a symlink target; absolute targets inside the root come back
    /// relative to the link so they still resolve through the mount
    pub fn readlink(&self, logical: &Path) -> Result<PathBuf> {
        let real = self.mapper.resolve_real(logical);
        let target = fs::read_link(&real).map_err(|e| Error::from_io(&real, e))?;
        if !target.is_absolute() {
            return Ok(target);
        }
        match self.mapper.to_logical(&target) {
            Some(target_logical) => {
                let link = PathMapper::normalize(logical);
                let dir = link.parent().unwrap_or_else(|| Path::new("/"));
                Ok(relative_to(dir, &target_logical))
            }
            None => Ok(target),
        }
    }

    pub fn mknod(&self, logical: &Path, mode: u32, rdev: u32) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        let mode = mode as libc::mode_t;
        nix::sys::stat::mknod(
            &real,
            SFlag::from_bits_truncate(mode & libc::S_IFMT),
            Mode::from_bits_truncate(mode & !libc::S_IFMT),
            rdev as libc::dev_t,
        )
        .map_err(|e| os_err(&real, e))
    }

    pub fn mkdir(&self, logical: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        let real = self.mapper.resolve_real(logical);
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(&real)
            .map_err(|e| Error::from_io(&real, e))
    }

    pub fn rmdir(&self, logical: &Path) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        fs::remove_dir(&real).map_err(|e| Error::from_io(&real, e))
    }

    pub fn statfs(&self, logical: &Path) -> Result<StatFs> {
        let real = self.mapper.resolve_real(logical);
        let st = nix::sys::statvfs::statvfs(&real).map_err(|e| os_err(&real, e))?;
        Ok(StatFs {
            blocks: st.blocks() as u64,
            blocks_free: st.blocks_free() as u64,
            blocks_available: st.blocks_available() as u64,
            files: st.files() as u64,
            files_free: st.files_free() as u64,
            block_size: st.block_size() as u32,
            name_max: st.name_max() as u32,
            fragment_size: st.fragment_size() as u32,
        })
    }

    /// Set access/modification times; `None` leaves a time unchanged
    pub fn utimens(
        &self,
        logical: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        nix::sys::stat::utimensat(
            None,
            &real,
            &timespec(atime),
            &timespec(mtime),
            UtimensatFlags::NoFollowSymlink,
        )
        .map_err(|e| os_err(&real, e))
    }

    pub fn chmod(&self, logical: &Path, mode: u32) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        fs::set_permissions(&real, Permissions::from_mode(mode & 0o7777))
            .map_err(|e| Error::from_io(&real, e))
    }

    pub fn chown(&self, logical: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        std::os::unix::fs::lchown(&real, uid, gid).map_err(|e| Error::from_io(&real, e))
    }

    /// Truncate or extend the real file to `size` bytes
    pub fn truncate(&self, logical: &Path, size: u64) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        let file = OpenOptions::new()
            .write(true)
            .open(&real)
            .map_err(|e| Error::from_io(&real, e))?;
        file.set_len(size)?;
        Ok(())
    }
}
