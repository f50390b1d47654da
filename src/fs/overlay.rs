//! Overlay operations on logical paths
//!
//! Each filesystem operation is applied to the real file and then to its
//! container, following the lifecycle rules in [`ContainerManager`]. The
//! FUSE adapter resolves inode numbers to paths and calls in here.

use std::ffi::OsString;
use std::fs::{File, Metadata, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use crate::codec::Codec;
use crate::config::ContainerConfig;
use crate::container::{Carry, ContainerManager, SidecarOutcome, Verification};
use crate::error::{Error, Result};
use crate::mapper::PathMapper;

use super::handle::{HandleTable, OpenFile};
use super::inode::FileKind;
use super::real::{RealLayer, StatFs};

/// Directory entry as presented through the mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

/// Build open options from kernel open flags
fn open_options(flags: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    opts.custom_flags(flags & !(libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_NOCTTY));
    opts
}

fn truncates(flags: i32) -> bool {
    flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY
}

/// The protected overlay
pub struct Overlay {
    real: RealLayer,
    containers: ContainerManager,
    handles: HandleTable,
}

impl Overlay {
    pub fn new(
        root: impl Into<PathBuf>,
        codec: Arc<dyn Codec>,
        config: ContainerConfig,
    ) -> Result<Self> {
        let mapper = PathMapper::new(root);
        let real = RealLayer::new(mapper.clone())?;
        Ok(Self {
            real,
            containers: ContainerManager::new(mapper, codec, config),
            handles: HandleTable::new(),
        })
    }

    pub fn real(&self) -> &RealLayer {
        &self.real
    }

    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Sidecars do not exist as far as clients can tell
    fn visible(logical: &Path) -> Result<()> {
        if PathMapper::names_container(logical) {
            return Err(Error::NotFound(logical.to_path_buf()));
        }
        Ok(())
    }

    /// Clients may not create entries with sidecar names
    fn creatable(logical: &Path) -> Result<()> {
        if PathMapper::names_container(logical) {
            return Err(Error::ReservedName(logical.to_path_buf()));
        }
        Ok(())
    }

    fn handle(&self, fh: u64) -> Result<Arc<OpenFile>> {
        self.handles.get(fh).ok_or(Error::InvalidHandle(fh))
    }

    pub fn getattr(&self, logical: &Path) -> Result<Metadata> {
        Self::visible(logical)?;
        self.real.metadata(logical)
    }

    pub fn access(&self, logical: &Path, mask: i32) -> Result<()> {
        Self::visible(logical)?;
        self.real.access(logical, mask)
    }

    /// List a directory with `.` and `..` first and sidecars left out
    pub fn readdir(&self, logical: &Path) -> Result<Vec<DirEntry>> {
        Self::visible(logical)?;
        let mut entries = vec![
            DirEntry {
                name: OsString::from("."),
                kind: FileKind::Directory,
            },
            DirEntry {
                name: OsString::from(".."),
                kind: FileKind::Directory,
            },
        ];
        entries.extend(self.real.readdir(logical)?.into_iter().map(|e| DirEntry {
            name: e.name,
            kind: FileKind::from(e.file_type),
        }));
        Ok(entries)
    }

    pub fn readlink(&self, logical: &Path) -> Result<PathBuf> {
        Self::visible(logical)?;
        self.real.readlink(logical)
    }

    pub fn mknod(&self, logical: &Path, mode: u32, rdev: u32) -> Result<()> {
        Self::creatable(logical)?;
        self.real.mknod(logical, mode, rdev)?;
        if mode & libc::S_IFMT as u32 == libc::S_IFREG as u32 {
            self.containers.clear_orphan(logical);
        }
        Ok(())
    }

    pub fn mkdir(&self, logical: &Path, mode: u32) -> Result<()> {
        Self::creatable(logical)?;
        self.real.mkdir(logical, mode)
    }

    pub fn rmdir(&self, logical: &Path) -> Result<()> {
        Self::visible(logical)?;
        self.real.rmdir(logical)
    }

    pub fn statfs(&self, logical: &Path) -> Result<StatFs> {
        self.real.statfs(logical)
    }

    pub fn unlink(&self, logical: &Path) -> Result<SidecarOutcome> {
        Self::visible(logical)?;
        self.containers.discard(logical)
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> Result<SidecarOutcome> {
        Self::creatable(link)?;
        self.containers.symlink(target, link)
    }

    pub fn rename(&self, old: &Path, new: &Path) -> Result<SidecarOutcome> {
        Self::visible(old)?;
        Self::creatable(new)?;
        let outcome = self.containers.carry_over(old, new, Carry::Rename)?;
        self.handles
            .retarget_under(&PathMapper::normalize(old), &PathMapper::normalize(new));
        Ok(outcome)
    }

    pub fn link(&self, old: &Path, new: &Path) -> Result<SidecarOutcome> {
        Self::visible(old)?;
        Self::creatable(new)?;
        self.containers.carry_over(old, new, Carry::Link)
    }

    pub fn utimens(
        &self,
        logical: &Path,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        Self::visible(logical)?;
        self.real.utimens(logical, atime, mtime)
    }

    pub fn chmod(&self, logical: &Path, mode: u32) -> Result<()> {
        Self::visible(logical)?;
        self.real.chmod(logical, mode)?;
        self.containers.mirror_mode(logical, mode);
        Ok(())
    }

    pub fn chown(&self, logical: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        Self::visible(logical)?;
        self.real.chown(logical, uid, gid)?;
        self.containers.mirror_owner(logical, uid, gid);
        Ok(())
    }

    /// Verify the file against its container, then open it
    pub fn open(&self, logical: &Path, flags: i32) -> Result<u64> {
        Self::visible(logical)?;
        let logical = PathMapper::normalize(logical);

        match self.containers.verify_and_repair(&logical) {
            Ok(Verification::Restored(report)) => {
                info!(
                    "Restored {:?} before open ({} blocks repaired)",
                    logical, report.failed_to_process
                );
            }
            Ok(v) => debug!("open {:?}: {:?}", logical, v),
            Err(e @ Error::UnrecoverableCorruption { .. }) => {
                error!("Refusing to open {:?}: {}", logical, e);
                return Err(e);
            }
            // nothing was restored, so the file is exactly as it was
            Err(e) => warn!("Opening {:?} unverified: {}", logical, e),
        }

        let real = self.real.mapper().resolve_real(&logical);
        let mut opts = open_options(flags);
        let file = if truncates(flags) {
            opts.truncate(true);
            self.containers.locks().shared(&logical, || -> Result<File> {
                let file = opts.open(&real).map_err(|e| Error::from_io(&real, e))?;
                self.containers.mark_written(&logical);
                Ok(file)
            })?
        } else {
            opts.open(&real).map_err(|e| Error::from_io(&real, e))?
        };

        let handle = self.handles.open(&logical, file, flags);
        if truncates(flags) {
            handle.mark_dirty();
        }
        Ok(handle.fh)
    }

    /// Create and open a file
    pub fn create(&self, logical: &Path, mode: u32, flags: i32) -> Result<(u64, Metadata)> {
        Self::creatable(logical)?;
        let logical = PathMapper::normalize(logical);
        let existed = self.real.exists(&logical);

        if existed {
            if flags & libc::O_EXCL != 0 {
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EEXIST)));
            }
            // an existing file is opened like any other
            let fh = self.open(&logical, flags)?;
            return Ok((fh, self.real.metadata(&logical)?));
        }

        let real = self.real.mapper().resolve_real(&logical);
        let mut opts = open_options(flags);
        opts.write(true).create_new(true).mode(mode & 0o7777);
        let file = opts.open(&real).map_err(|e| Error::from_io(&real, e))?;

        // a sidecar left at this name describes some earlier file
        self.containers.clear_orphan(&logical);

        let meta = file.metadata()?;
        let handle = self.handles.open(&logical, file, flags);
        handle.mark_dirty();
        debug!("created {:?} (fh={})", logical, handle.fh);
        Ok((handle.fh, meta))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = self.handle(fh)?;
        let key = handle.path();

        self.containers.locks().shared(&key, || -> Result<Vec<u8>> {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                let n = handle.file.read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize> {
        let handle = self.handle(fh)?;
        let key = handle.path();

        self.containers.locks().shared(&key, || -> Result<()> {
            handle.file.write_all_at(data, offset)?;
            self.containers.mark_written(&key);
            Ok(())
        })?;

        handle.mark_dirty();
        Ok(data.len())
    }

    /// Change the file size and regenerate its container
    pub fn truncate(&self, logical: &Path, size: u64, fh: Option<u64>) -> Result<()> {
        Self::visible(logical)?;
        let logical = PathMapper::normalize(logical);

        match fh.and_then(|fh| self.handles.get(fh)) {
            Some(handle) => {
                self.containers.locks().shared(&logical, || -> Result<()> {
                    handle.file.set_len(size)?;
                    self.containers.mark_written(&logical);
                    Ok(())
                })?;
                handle.mark_dirty();
            }
            None => {
                self.containers.locks().shared(&logical, || -> Result<()> {
                    self.real.truncate(&logical, size)?;
                    self.containers.mark_written(&logical);
                    Ok(())
                })?;
            }
        }

        if let Err(e) = self.containers.ensure_container(&logical) {
            warn!("{:?} truncated but left unprotected: {}", logical, e);
        }
        Ok(())
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        let handle = self.handle(fh)?;
        if handle.is_writable() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let handle = self.handle(fh)?;
        if datasync {
            handle.file.sync_data()?;
        } else {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Close a handle and regenerate the container when the content may
    /// have changed
    pub fn release(&self, fh: u64) -> Result<()> {
        let handle = self.handles.close(fh).ok_or(Error::InvalidHandle(fh))?;
        let logical = handle.path();

        let changed = handle.is_writable() || handle.is_dirty();
        let adopt = self.containers.config().adopt_on_close
            && !self.real.mapper().container_exists(&logical);
        drop(handle);

        if !changed && !adopt {
            return Ok(());
        }

        match self.containers.ensure_container(&logical) {
            Ok(()) => {}
            Err(Error::NotFound(_)) => {
                debug!("{:?} was removed while open, nothing to protect", logical);
            }
            Err(e) => warn!("{:?} left unprotected after close: {}", logical, e),
        }
        Ok(())
    }
}
