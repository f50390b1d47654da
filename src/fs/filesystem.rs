//! FUSE adapter
//!
//! Translates kernel requests (inode numbers, raw flags) into calls on the
//! path-based [`Overlay`] and turns its errors into errno replies.

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::inode::{file_attr, InodeTable};
use super::overlay::Overlay;

fn resolve_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// sbxfs mounted through FUSE
pub struct SbxFs {
    overlay: Arc<Overlay>,
    inodes: InodeTable,
    ttl: Duration,
}

impl SbxFs {
    pub fn new(overlay: Arc<Overlay>, ttl: Duration) -> Self {
        Self {
            overlay,
            inodes: InodeTable::new(),
            ttl,
        }
    }

    fn path(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::NotFound(PathBuf::from(format!("<inode {}>", ino))))
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        Ok(self.path(parent)?.join(name))
    }

    /// Attributes for a path the kernel will hold a reference to
    fn entry(&self, path: &Path) -> Result<FileAttr> {
        let meta = self.overlay.getattr(path)?;
        let ino = self.inodes.lookup(path);
        Ok(file_attr(ino, &meta))
    }

    fn attr(&self, ino: u64) -> Result<FileAttr> {
        let meta = self.overlay.getattr(&self.path(ino)?)?;
        Ok(file_attr(ino, &meta))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<FileAttr> {
        let path = self.path(ino)?;

        if let Some(mode) = mode {
            self.overlay.chmod(&path, mode)?;
        }
        if uid.is_some() || gid.is_some() {
            self.overlay.chown(&path, uid, gid)?;
        }
        if let Some(size) = size {
            self.overlay.truncate(&path, size, fh)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.overlay
                .utimens(&path, atime.map(resolve_time), mtime.map(resolve_time))?;
        }

        self.attr(ino)
    }
}

impl Filesystem for SbxFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        info!(
            "sbxfs serving {:?}",
            self.overlay.real().mapper().root()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("sbxfs unmounted ({} handles still open)", self.overlay.handles().len());
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.child(parent, name).and_then(|p| self.entry(&p)) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.attr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        match self.apply_setattr(ino, mode, uid, gid, size, atime, mtime, fh) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.path(ino).and_then(|p| self.overlay.readlink(&p)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        let result = self.child(parent, name).and_then(|p| {
            self.overlay.mknod(&p, mode & !umask, rdev)?;
            self.entry(&p)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);

        let result = self.child(parent, name).and_then(|p| {
            self.overlay.mkdir(&p, mode & !umask)?;
            self.entry(&p)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        let result = self.child(parent, name).and_then(|p| {
            self.overlay.unlink(&p)?;
            self.inodes.detach(&p);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let result = self.child(parent, name).and_then(|p| {
            self.overlay.rmdir(&p)?;
            self.inodes.detach(&p);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let result = self.child(parent, link_name).and_then(|p| {
            self.overlay.symlink(target, &p)?;
            self.entry(&p)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        // RENAME_NOREPLACE / RENAME_EXCHANGE cannot be carried to the sidecar
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let result = self.child(parent, name).and_then(|old| {
            let new = self.child(newparent, newname)?;
            self.overlay.rename(&old, &new)?;
            self.inodes.rename(&old, &new);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        let result = self.path(ino).and_then(|old| {
            let new = self.child(newparent, newname)?;
            self.overlay.link(&old, &new)?;
            self.entry(&new)
        });
        match result {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#x})", ino, flags);

        match self.path(ino).and_then(|p| self.overlay.open(&p, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.overlay.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.overlay.write(fh, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        match self.overlay.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        match self.overlay.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        match self.overlay.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let result = self.path(ino).and_then(|dir| {
            let entries = self.overlay.readdir(&dir)?;
            Ok((dir, entries))
        });
        let (dir, entries) = match result {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        for (i, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let child_ino = match entry.name.as_bytes() {
                b"." => ino,
                b".." => self
                    .inodes
                    .ino_for(dir.parent().unwrap_or_else(|| Path::new("/"))),
                _ => self.inodes.ino_for(&dir.join(&entry.name)),
            };
            let buffer_full = reply.add(
                child_ino,
                (i + 1) as i64,
                entry.kind.to_fuser_type(),
                &entry.name,
            );
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        match self.path(ino).and_then(|p| self.overlay.statfs(&p)) {
            Ok(st) => reply.statfs(
                st.blocks,
                st.blocks_free,
                st.blocks_available,
                st.files,
                st.files_free,
                st.block_size,
                st.name_max,
                st.fragment_size,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match self.path(ino).and_then(|p| self.overlay.access(&p, mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?}, flags={:#x})", parent, name, flags);

        let result = self.child(parent, name).and_then(|p| {
            let (fh, meta) = self.overlay.create(&p, mode & !umask, flags)?;
            let ino = self.inodes.lookup(&p);
            Ok((fh, file_attr(ino, &meta)))
        });
        match result {
            Ok((fh, attr)) => reply.created(&self.ttl, &attr, 0, fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }
}
