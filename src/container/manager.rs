//! Container lifecycle protocol

use dashmap::{DashMap, DashSet};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{lchown, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::codec::Codec;
use crate::config::ContainerConfig;
use crate::error::{Error, Result};
use crate::integrity::{digest_file, IntegrityVerifier, DIGEST_BUF_SIZE};
use crate::mapper::{with_suffix, PathMapper};

use super::{Carry, ContainerState, PathLocks, SidecarOutcome, Verification};

/// Creates, verifies, repairs, carries and discards containers
pub struct ContainerManager {
    mapper: PathMapper,
    verifier: IntegrityVerifier,
    codec: Arc<dyn Codec>,
    config: ContainerConfig,
    locks: PathLocks,
    /// Last known state per normalized logical path
    states: DashMap<PathBuf, ContainerState>,
    /// Paths written through a handle since their container was last encoded
    pending: DashSet<PathBuf>,
}

/// Remove a sidecar, treating "already gone" as success
fn remove_sidecar(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Present on disk, including sidecar symlinks whose target is gone
fn sidecar_present(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

impl ContainerManager {
    pub fn new(mapper: PathMapper, codec: Arc<dyn Codec>, config: ContainerConfig) -> Self {
        let verifier = IntegrityVerifier::new(mapper.clone(), codec.clone());
        Self {
            mapper,
            verifier,
            codec,
            config,
            locks: PathLocks::new(),
            states: DashMap::new(),
            pending: DashSet::new(),
        }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub fn verifier(&self) -> &IntegrityVerifier {
        &self.verifier
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Lock table shared with the operation layer
    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    /// Current container state of a logical file
    pub fn state(&self, logical: &Path) -> ContainerState {
        if !self.mapper.container_exists(logical) {
            return ContainerState::NoContainer;
        }
        match self.states.get(&PathMapper::normalize(logical)).map(|s| *s) {
            Some(ContainerState::Trusted) => ContainerState::Trusted,
            _ => ContainerState::Unverified,
        }
    }

    /// Content changed through a handle; the container now lags until the
    /// next encode and must not be used to "repair" the new bytes
    pub fn mark_written(&self, logical: &Path) {
        let key = PathMapper::normalize(logical);
        self.states.remove(&key);
        self.pending.insert(key);
    }

    /// Written since the container was last encoded
    pub fn is_pending(&self, logical: &Path) -> bool {
        self.pending.contains(&PathMapper::normalize(logical))
    }

    /// Re-encode the container from the current file content
    pub fn ensure_container(&self, logical: &Path) -> Result<()> {
        let key = PathMapper::normalize(logical);
        self.locks.exclusive(&key, || self.encode_locked(logical, &key))
    }

    fn encode_locked(&self, logical: &Path, key: &Path) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        let container = self.mapper.resolve_container(logical);

        let meta = fs::metadata(&real).map_err(|e| Error::from_io(&real, e))?;
        // writers hold shared scopes, so nothing lands between here and the encode
        self.pending.remove(key);
        if !meta.is_file() {
            debug!("skipping container for non-regular {:?}", logical);
            return Ok(());
        }

        match self.codec.encode(true, &real, &container) {
            Ok(()) => {
                info!("Container regenerated for {:?}", logical);
                self.states.insert(key.to_path_buf(), ContainerState::Trusted);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to encode container for {:?}: {}", logical, e);
                // old parity must not stay paired with new bytes
                if let Err(rm) = remove_sidecar(&container) {
                    warn!("Failed to drop stale container {:?}: {}", container, rm);
                }
                self.states.remove(key);
                Err(e)
            }
        }
    }

    /// Check a file against its container and repair it if they differ
    pub fn verify_and_repair(&self, logical: &Path) -> Result<Verification> {
        let key = PathMapper::normalize(logical);
        self.locks.exclusive(&key, || self.verify_locked(logical, &key))
    }

    fn verify_locked(&self, logical: &Path, key: &Path) -> Result<Verification> {
        let container = self.mapper.resolve_container(logical);
        if !container.exists() {
            self.states.insert(key.to_path_buf(), ContainerState::NoContainer);
            return Ok(Verification::Unprotected);
        }
        if self.pending.contains(key) {
            debug!("{:?} has writes newer than its container", logical);
            return Ok(Verification::Pending);
        }

        let actual = self.verifier.digest(logical)?;
        let stored = self.verifier.extract_stored_digest(&container)?;
        if actual == stored {
            debug!("{:?} matches its container", logical);
            self.states.insert(key.to_path_buf(), ContainerState::Trusted);
            return Ok(Verification::Intact);
        }

        warn!(
            "Digest mismatch for {:?}: file {} container {}",
            logical, actual, stored
        );
        let report = self.codec.repair(&container)?;

        if !report.is_recoverable() {
            error!(
                "Unrecoverable corruption in {:?}: {}/{} blocks could not be repaired",
                logical, report.failed_to_repair, report.failed_to_process
            );
            self.states.remove(key);
            return Err(Error::UnrecoverableCorruption {
                path: logical.to_path_buf(),
                failed_to_process: report.failed_to_process,
                failed_to_repair: report.failed_to_repair,
            });
        }

        if report.failed_to_process == 0 {
            info!("Container for {:?} is intact, restoring file from it", logical);
        } else {
            info!(
                "Repaired {} container blocks for {:?}, restoring file",
                report.failed_to_process, logical
            );
        }

        self.restore_locked(logical, &container)?;
        self.states.insert(key.to_path_buf(), ContainerState::Trusted);
        Ok(Verification::Restored(report))
    }

    /// Decode into a hidden staging file, check it, then copy it over the
    /// real file in place so the inode, mode and links are preserved.
    fn restore_locked(&self, logical: &Path, container: &Path) -> Result<()> {
        let real = self.mapper.resolve_real(logical);
        let staging = self.mapper.resolve_staging(logical);

        let result = (|| -> Result<()> {
            self.codec.decode(container, &staging)?;

            let expected = self.verifier.extract_stored_digest(container)?;
            let decoded = digest_file(&staging, DIGEST_BUF_SIZE)?;
            if decoded != expected {
                return Err(Error::Decode {
                    path: container.to_path_buf(),
                    reason: format!("decoded content {} does not match {}", decoded, expected),
                });
            }

            let mut src = File::open(&staging)?;
            let mut dst = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&real)
                .map_err(|e| Error::from_io(&real, e))?;
            io::copy(&mut src, &mut dst)?;
            dst.sync_all()?;
            Ok(())
        })();

        if let Err(e) = remove_sidecar(&staging) {
            warn!("Failed to remove staging file {:?}: {}", staging, e);
        }
        result
    }

    /// Rename or hard-link a file, carrying its container along
    pub fn carry_over(&self, old: &Path, new: &Path, carry: Carry) -> Result<SidecarOutcome> {
        let old_key = PathMapper::normalize(old);
        let new_key = PathMapper::normalize(new);

        let outcome = self.locks.exclusive_pair(&old_key, &new_key, || match carry {
            Carry::Rename => self.rename_locked(old, new),
            Carry::Link => self.link_locked(old, new),
        })?;

        self.forget_under(&new_key);
        if carry == Carry::Rename {
            self.forget_under(&old_key);
            self.move_pending(&old_key, &new_key);
        }

        if let SidecarOutcome::Failed(ref e) = outcome {
            warn!("Container not carried from {:?} to {:?}: {}", old, new, e);
        }
        Ok(outcome)
    }

    fn rename_locked(&self, old: &Path, new: &Path) -> Result<SidecarOutcome> {
        let old_real = self.mapper.resolve_real(old);
        let new_real = self.mapper.resolve_real(new);
        let old_cont = self.mapper.resolve_container(old);
        let new_cont = self.mapper.resolve_container(new);

        if !sidecar_present(&old_cont) {
            fs::rename(&old_real, &new_real).map_err(|e| Error::from_io(&old_real, e))?;
            // whatever sat beside the destination described other content
            return Ok(match remove_sidecar(&new_cont) {
                Ok(true) => SidecarOutcome::Removed,
                Ok(false) => SidecarOutcome::Absent,
                Err(e) => SidecarOutcome::Failed(Error::from_io(&new_cont, e)),
            });
        }

        match fs::rename(&old_cont, &new_cont) {
            Ok(()) => {
                if let Err(e) = fs::rename(&old_real, &new_real) {
                    if let Err(back) = fs::rename(&new_cont, &old_cont) {
                        warn!("Failed to return container to {:?}: {}", old_cont, back);
                    }
                    return Err(Error::from_io(&old_real, e));
                }
                Ok(SidecarOutcome::Applied)
            }
            Err(e) => {
                fs::rename(&old_real, &new_real).map_err(|e| Error::from_io(&old_real, e))?;
                // a sidecar left at the old name would pair with whatever
                // appears there next
                if let Err(rm) = remove_sidecar(&old_cont) {
                    warn!("Failed to drop orphaned container {:?}: {}", old_cont, rm);
                }
                if let Err(rm) = remove_sidecar(&new_cont) {
                    warn!("Failed to drop stale container {:?}: {}", new_cont, rm);
                }
                Ok(SidecarOutcome::Failed(Error::from_io(&old_cont, e)))
            }
        }
    }

    fn link_locked(&self, old: &Path, new: &Path) -> Result<SidecarOutcome> {
        let old_real = self.mapper.resolve_real(old);
        let new_real = self.mapper.resolve_real(new);
        let old_cont = self.mapper.resolve_container(old);
        let new_cont = self.mapper.resolve_container(new);

        if !sidecar_present(&old_cont) {
            fs::hard_link(&old_real, &new_real).map_err(|e| Error::from_io(&old_real, e))?;
            return Ok(match remove_sidecar(&new_cont) {
                Ok(true) => SidecarOutcome::Removed,
                Ok(false) => SidecarOutcome::Absent,
                Err(e) => SidecarOutcome::Failed(Error::from_io(&new_cont, e)),
            });
        }

        let sidecar = match fs::hard_link(&old_cont, &new_cont) {
            Ok(()) => SidecarOutcome::Applied,
            Err(e) => SidecarOutcome::Failed(Error::from_io(&old_cont, e)),
        };

        if let Err(e) = fs::hard_link(&old_real, &new_real) {
            if matches!(sidecar, SidecarOutcome::Applied) {
                if let Err(rm) = remove_sidecar(&new_cont) {
                    warn!("Failed to undo container link {:?}: {}", new_cont, rm);
                }
            }
            return Err(Error::from_io(&old_real, e));
        }
        Ok(sidecar)
    }

    /// Create a symlink; a relative target with a container gets a
    /// matching sidecar link so opens through the link are verified
    pub fn symlink(&self, target: &Path, link: &Path) -> Result<SidecarOutcome> {
        let key = PathMapper::normalize(link);
        let link_real = self.mapper.resolve_real(link);
        let link_cont = self.mapper.resolve_container(link);

        self.locks.exclusive(&key, || {
            std::os::unix::fs::symlink(target, &link_real)
                .map_err(|e| Error::from_io(&link_real, e))?;

            let cleared = match remove_sidecar(&link_cont) {
                Ok(removed) => removed,
                Err(e) => return Ok(SidecarOutcome::Failed(Error::from_io(&link_cont, e))),
            };

            if target.is_relative() {
                let parent = link.parent().unwrap_or_else(|| Path::new("/"));
                if self.mapper.container_exists(&parent.join(target)) {
                    let sidecar_target = with_suffix(target.to_path_buf());
                    return Ok(
                        match std::os::unix::fs::symlink(&sidecar_target, &link_cont) {
                            Ok(()) => SidecarOutcome::Applied,
                            Err(e) => SidecarOutcome::Failed(Error::from_io(&link_cont, e)),
                        },
                    );
                }
            }

            Ok(if cleared {
                SidecarOutcome::Removed
            } else {
                SidecarOutcome::Absent
            })
        })
    }

    /// Delete a file and its container
    pub fn discard(&self, logical: &Path) -> Result<SidecarOutcome> {
        let key = PathMapper::normalize(logical);
        let real = self.mapper.resolve_real(logical);
        let container = self.mapper.resolve_container(logical);

        let outcome = self.locks.exclusive(&key, || {
            let sidecar = match remove_sidecar(&container) {
                Ok(true) => SidecarOutcome::Removed,
                Ok(false) => SidecarOutcome::Absent,
                Err(e) => SidecarOutcome::Failed(Error::from_io(&container, e)),
            };
            fs::remove_file(&real).map_err(|e| Error::from_io(&real, e))?;
            Ok::<_, Error>(sidecar)
        })?;

        self.states.remove(&key);
        self.pending.remove(&key);
        if let SidecarOutcome::Failed(ref e) = outcome {
            warn!("Removed {:?} but its container remains: {}", logical, e);
        }
        Ok(outcome)
    }

    /// Drop a container left at a path that now holds new content
    pub fn clear_orphan(&self, logical: &Path) -> SidecarOutcome {
        let key = PathMapper::normalize(logical);
        let container = self.mapper.resolve_container(logical);
        let outcome = self.locks.exclusive(&key, || match remove_sidecar(&container) {
            Ok(true) => SidecarOutcome::Removed,
            Ok(false) => SidecarOutcome::Absent,
            Err(e) => SidecarOutcome::Failed(Error::from_io(&container, e)),
        });
        self.states.remove(&key);
        if matches!(outcome, SidecarOutcome::Removed) {
            info!("Dropped orphaned container for {:?}", logical);
        }
        outcome
    }

    /// Apply a mode change to the container; a sidecar symlink is left
    /// alone so the change never reaches the target's container
    pub fn mirror_mode(&self, logical: &Path, mode: u32) -> SidecarOutcome {
        let container = self.mapper.resolve_container(logical);
        match fs::symlink_metadata(&container) {
            Err(_) => return SidecarOutcome::Absent,
            Ok(meta) if meta.file_type().is_symlink() => return SidecarOutcome::Absent,
            Ok(_) => {}
        }
        match fs::set_permissions(&container, Permissions::from_mode(mode & 0o7777)) {
            Ok(()) => SidecarOutcome::Applied,
            Err(e) => {
                warn!("Failed to chmod container {:?}: {}", container, e);
                SidecarOutcome::Failed(Error::from_io(&container, e))
            }
        }
    }

    /// Apply an ownership change to the container
    pub fn mirror_owner(&self, logical: &Path, uid: Option<u32>, gid: Option<u32>) -> SidecarOutcome {
        let container = self.mapper.resolve_container(logical);
        if !sidecar_present(&container) {
            return SidecarOutcome::Absent;
        }
        match lchown(&container, uid, gid) {
            Ok(()) => SidecarOutcome::Applied,
            Err(e) => {
                warn!("Failed to chown container {:?}: {}", container, e);
                SidecarOutcome::Failed(Error::from_io(&container, e))
            }
        }
    }

    fn forget_under(&self, prefix: &Path) {
        self.states.retain(|k, _| !k.starts_with(prefix));
    }

    /// Writes still lag behind the container at the new name
    fn move_pending(&self, old: &Path, new: &Path) {
        self.pending.retain(|k| !k.starts_with(new));
        let moved: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|k| k.starts_with(old))
            .map(|k| k.key().clone())
            .collect();
        for key in moved {
            self.pending.remove(&key);
            match key.strip_prefix(old) {
                Ok(rest) if rest.as_os_str().is_empty() => {
                    self.pending.insert(new.to_path_buf());
                }
                Ok(rest) => {
                    self.pending.insert(new.join(rest));
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{LocalCodec, RepairScript};
    use crate::codec::RepairReport;
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        codec: Arc<LocalCodec>,
        manager: Arc<ContainerManager>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let codec = Arc::new(LocalCodec::new());
            let manager = Arc::new(ContainerManager::new(
                PathMapper::new(dir.path()),
                codec.clone(),
                ContainerConfig::default(),
            ));
            Self {
                _dir: dir,
                codec,
                manager,
            }
        }

        fn write(&self, logical: &str, data: &[u8]) {
            fs::write(self.real(logical), data).unwrap();
        }

        fn real(&self, logical: &str) -> PathBuf {
            self.manager.mapper().resolve_real(Path::new(logical))
        }

        fn read(&self, logical: &str) -> Vec<u8> {
            fs::read(self.real(logical)).unwrap()
        }

        fn protected(&self, logical: &str) -> bool {
            self.manager.mapper().container_exists(Path::new(logical))
        }
    }

    fn corrupt(path: &Path) {
        let mut data = fs::read(path).unwrap();
        data[0] ^= 0xff;
        data[3] ^= 0x0f;
        fs::write(path, data).unwrap();
    }

    #[test]
    fn test_unprotected_file_is_not_an_error() {
        let fx = Fixture::new();
        fx.write("/plain.txt", b"plain");

        let v = fx.manager.verify_and_repair(Path::new("/plain.txt")).unwrap();
        assert_eq!(v, Verification::Unprotected);
        assert_eq!(
            fx.manager.state(Path::new("/plain.txt")),
            ContainerState::NoContainer
        );
        assert_eq!(LocalCodec::count(&fx.codec.repairs), 0);
    }

    #[test]
    fn test_ensure_then_verify_is_intact() {
        let fx = Fixture::new();
        let p = Path::new("/doc.txt");
        fx.write("/doc.txt", b"contents");

        fx.manager.ensure_container(p).unwrap();
        assert_eq!(fx.manager.state(p), ContainerState::Trusted);

        assert_eq!(fx.manager.verify_and_repair(p).unwrap(), Verification::Intact);
        assert_eq!(LocalCodec::count(&fx.codec.repairs), 0);
    }

    #[test]
    fn test_regeneration_is_idempotent() {
        let fx = Fixture::new();
        let p = Path::new("/twice.bin");
        fx.write("/twice.bin", b"same bytes");

        fx.manager.ensure_container(p).unwrap();
        fx.manager.ensure_container(p).unwrap();

        assert_eq!(fx.manager.verify_and_repair(p).unwrap(), Verification::Intact);
        assert_eq!(LocalCodec::count(&fx.codec.encodes), 2);
        assert_eq!(LocalCodec::count(&fx.codec.repairs), 0);
    }

    #[test]
    fn test_recoverable_corruption_is_restored() {
        let fx = Fixture::new();
        let p = Path::new("/data.bin");
        fx.write("/data.bin", b"original payload");
        fx.manager.ensure_container(p).unwrap();

        corrupt(&fx.real("/data.bin"));
        fx.codec.script_repair(RepairScript::Report(RepairReport {
            failed_to_process: 2,
            failed_to_repair: 0,
        }));

        let v = fx.manager.verify_and_repair(p).unwrap();
        assert!(matches!(v, Verification::Restored(_)));
        assert_eq!(fx.read("/data.bin"), b"original payload");
        assert_eq!(fx.manager.state(p), ContainerState::Trusted);
        assert_eq!(LocalCodec::count(&fx.codec.decodes), 1);
        // staging file is cleaned up
        assert!(!fx.manager.mapper().resolve_staging(p).exists());
    }

    #[test]
    fn test_intact_container_restores_drifted_file() {
        let fx = Fixture::new();
        let p = Path::new("/drift.txt");
        fx.write("/drift.txt", b"before");
        fx.manager.ensure_container(p).unwrap();
        fx.write("/drift.txt", b"bitrot");

        let v = fx.manager.verify_and_repair(p).unwrap();
        assert_eq!(v, Verification::Restored(RepairReport::default()));
        assert_eq!(fx.read("/drift.txt"), b"before");
    }

    #[test]
    fn test_unrecoverable_corruption_fails_closed() {
        let fx = Fixture::new();
        let p = Path::new("/lost.bin");
        fx.write("/lost.bin", b"important");
        fx.manager.ensure_container(p).unwrap();

        corrupt(&fx.real("/lost.bin"));
        let corrupted = fx.read("/lost.bin");
        fx.codec.script_repair(RepairScript::Report(RepairReport {
            failed_to_process: 5,
            failed_to_repair: 2,
        }));

        let err = fx.manager.verify_and_repair(p).unwrap_err();
        assert!(matches!(err, Error::UnrecoverableCorruption { .. }));
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(fx.read("/lost.bin"), corrupted);
        assert_eq!(LocalCodec::count(&fx.codec.decodes), 0);
    }

    #[test]
    fn test_repair_invocation_failure_surfaces() {
        let fx = Fixture::new();
        let p = Path::new("/r.txt");
        fx.write("/r.txt", b"abc");
        fx.manager.ensure_container(p).unwrap();
        fx.write("/r.txt", b"xyz");
        fx.codec.script_repair(RepairScript::Fail);

        assert!(matches!(
            fx.manager.verify_and_repair(p),
            Err(Error::Repair { .. })
        ));
        assert_eq!(fx.read("/r.txt"), b"xyz");
    }

    #[test]
    fn test_corrupt_container_surfaces() {
        let fx = Fixture::new();
        let p = Path::new("/c.txt");
        fx.write("/c.txt", b"abc");
        fs::write(fx.manager.mapper().resolve_container(p), b"garbage").unwrap();

        assert!(matches!(
            fx.manager.verify_and_repair(p),
            Err(Error::CorruptContainer { .. })
        ));
    }

    #[test]
    fn test_failed_encode_drops_stale_container() {
        let fx = Fixture::new();
        let p = Path::new("/e.txt");
        fx.write("/e.txt", b"v1");
        fx.manager.ensure_container(p).unwrap();

        fx.write("/e.txt", b"v2");
        fx.codec.set_fail_encode(true);
        assert!(matches!(
            fx.manager.ensure_container(p),
            Err(Error::Encode { .. })
        ));
        // the new content is kept, just unprotected
        assert_eq!(fx.read("/e.txt"), b"v2");
        assert!(!fx.protected("/e.txt"));
        assert_eq!(fx.manager.state(p), ContainerState::NoContainer);
    }

    #[test]
    fn test_written_file_becomes_unverified() {
        let fx = Fixture::new();
        let p = Path::new("/w.txt");
        fx.write("/w.txt", b"v1");
        fx.manager.ensure_container(p).unwrap();
        fx.manager.mark_written(p);
        assert_eq!(fx.manager.state(p), ContainerState::Unverified);
    }

    #[test]
    fn test_discard_removes_both() {
        let fx = Fixture::new();
        let p = Path::new("/gone.txt");
        fx.write("/gone.txt", b"bye");
        fx.manager.ensure_container(p).unwrap();

        let outcome = fx.manager.discard(p).unwrap();
        assert!(matches!(outcome, SidecarOutcome::Removed));
        assert!(!fx.real("/gone.txt").exists());
        assert!(!fx.protected("/gone.txt"));
    }

    #[test]
    fn test_discard_missing_file_reports_not_found() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.manager.discard(Path::new("/nothing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rename_carries_container() {
        let fx = Fixture::new();
        fx.write("/a.txt", b"carry me");
        fx.manager.ensure_container(Path::new("/a.txt")).unwrap();

        let outcome = fx
            .manager
            .carry_over(Path::new("/a.txt"), Path::new("/b.txt"), Carry::Rename)
            .unwrap();
        assert!(matches!(outcome, SidecarOutcome::Applied));
        assert!(!fx.protected("/a.txt"));
        assert!(fx.protected("/b.txt"));
        assert_eq!(
            fx.manager.verify_and_repair(Path::new("/b.txt")).unwrap(),
            Verification::Intact
        );
    }

    #[test]
    fn test_rename_unprotected_over_protected_clears_stale() {
        let fx = Fixture::new();
        fx.write("/old.txt", b"protected");
        fx.manager.ensure_container(Path::new("/old.txt")).unwrap();
        fx.write("/new.txt", b"unprotected");

        let outcome = fx
            .manager
            .carry_over(Path::new("/new.txt"), Path::new("/old.txt"), Carry::Rename)
            .unwrap();
        assert!(matches!(outcome, SidecarOutcome::Removed));
        assert!(!fx.protected("/old.txt"));
        assert_eq!(fx.read("/old.txt"), b"unprotected");
        // nothing to "repair" the new content back to the old
        assert_eq!(
            fx.manager.verify_and_repair(Path::new("/old.txt")).unwrap(),
            Verification::Unprotected
        );
    }

    #[test]
    fn test_failed_rename_keeps_pair_together() {
        let fx = Fixture::new();
        fx.write("/src.txt", b"x");
        fx.manager.ensure_container(Path::new("/src.txt")).unwrap();

        let err = fx
            .manager
            .carry_over(
                Path::new("/src.txt"),
                Path::new("/missing-dir/dst.txt"),
                Carry::Rename,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(fx.protected("/src.txt"));
    }

    #[test]
    fn test_link_carries_container() {
        let fx = Fixture::new();
        fx.write("/orig.txt", b"linked");
        fx.manager.ensure_container(Path::new("/orig.txt")).unwrap();

        let outcome = fx
            .manager
            .carry_over(Path::new("/orig.txt"), Path::new("/alias.txt"), Carry::Link)
            .unwrap();
        assert!(matches!(outcome, SidecarOutcome::Applied));
        assert!(fx.protected("/orig.txt"));
        assert!(fx.protected("/alias.txt"));
        assert_eq!(fx.read("/alias.txt"), b"linked");
    }

    #[test]
    fn test_symlink_gets_sidecar_link() {
        let fx = Fixture::new();
        fx.write("/target.txt", b"pointed at");
        fx.manager.ensure_container(Path::new("/target.txt")).unwrap();

        let outcome = fx
            .manager
            .symlink(Path::new("target.txt"), Path::new("/link.txt"))
            .unwrap();
        assert!(matches!(outcome, SidecarOutcome::Applied));
        assert_eq!(
            fx.manager.verify_and_repair(Path::new("/link.txt")).unwrap(),
            Verification::Intact
        );

        let plain = fx
            .manager
            .symlink(Path::new("nowhere"), Path::new("/dangling"))
            .unwrap();
        assert!(matches!(plain, SidecarOutcome::Absent));
    }

    #[test]
    fn test_mirror_mode() {
        let fx = Fixture::new();
        let p = Path::new("/m.txt");
        fx.write("/m.txt", b"m");
        assert!(matches!(fx.manager.mirror_mode(p, 0o600), SidecarOutcome::Absent));

        fx.manager.ensure_container(p).unwrap();
        assert!(matches!(fx.manager.mirror_mode(p, 0o640), SidecarOutcome::Applied));
        let mode = fs::metadata(fx.manager.mapper().resolve_container(p))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_mirroring_stops_at_sidecar_symlinks() {
        let fx = Fixture::new();
        fx.write("/target.txt", b"pointed at");
        fx.manager.ensure_container(Path::new("/target.txt")).unwrap();
        let target_cont = fx.manager.mapper().resolve_container(Path::new("/target.txt"));
        fs::set_permissions(&target_cont, Permissions::from_mode(0o644)).unwrap();
        fx.manager
            .symlink(Path::new("target.txt"), Path::new("/link.txt"))
            .unwrap();

        assert!(matches!(
            fx.manager.mirror_mode(Path::new("/link.txt"), 0o600),
            SidecarOutcome::Absent
        ));
        let mode = fs::metadata(&target_cont).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        // a dangling sidecar link is still chowned itself, not followed
        std::os::unix::fs::symlink(
            "gone.sbxfs.sbx",
            fx.manager.mapper().resolve_container(Path::new("/dangling")),
        )
        .unwrap();
        assert!(matches!(
            fx.manager.mirror_owner(Path::new("/dangling"), None, None),
            SidecarOutcome::Applied
        ));
    }

    /// A non-empty directory where a sidecar belongs makes every sidecar
    /// step fail
    fn block_sidecar(fx: &Fixture, logical: &str) -> PathBuf {
        let blocker = fx.manager.mapper().resolve_container(Path::new(logical));
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"k").unwrap();
        blocker
    }

    #[test]
    fn test_rename_goes_ahead_when_container_cannot_follow() {
        let fx = Fixture::new();
        fx.write("/src.txt", b"moving");
        fx.manager.ensure_container(Path::new("/src.txt")).unwrap();
        let blocker = block_sidecar(&fx, "/dst.txt");

        let outcome = fx
            .manager
            .carry_over(Path::new("/src.txt"), Path::new("/dst.txt"), Carry::Rename)
            .unwrap();
        assert!(outcome.is_failed());
        assert!(!fx.real("/src.txt").exists());
        assert_eq!(fx.read("/dst.txt"), b"moving");
        // the old container must not pair with a future /src.txt
        assert!(!sidecar_present(
            &fx.manager.mapper().resolve_container(Path::new("/src.txt"))
        ));
        assert!(blocker.is_dir());
    }

    #[test]
    fn test_link_goes_ahead_when_container_cannot_follow() {
        let fx = Fixture::new();
        fx.write("/orig.txt", b"linked");
        fx.manager.ensure_container(Path::new("/orig.txt")).unwrap();
        block_sidecar(&fx, "/alias.txt");

        let outcome = fx
            .manager
            .carry_over(Path::new("/orig.txt"), Path::new("/alias.txt"), Carry::Link)
            .unwrap();
        assert!(outcome.is_failed());
        assert_eq!(fx.read("/alias.txt"), b"linked");
        assert!(fx.protected("/orig.txt"));
    }

    #[test]
    fn test_discard_removes_file_when_container_is_stuck() {
        let fx = Fixture::new();
        fx.write("/stuck.txt", b"bye");
        let blocker = block_sidecar(&fx, "/stuck.txt");

        let outcome = fx.manager.discard(Path::new("/stuck.txt")).unwrap();
        assert!(outcome.is_failed());
        assert!(!fx.real("/stuck.txt").exists());
        assert!(blocker.is_dir());
    }

    #[test]
    fn test_pending_writes_are_not_repaired() {
        let fx = Fixture::new();
        let p = Path::new("/busy.txt");
        fx.write("/busy.txt", b"old");
        fx.manager.ensure_container(p).unwrap();
        fx.write("/busy.txt", b"new");
        fx.manager.mark_written(p);

        assert_eq!(fx.manager.verify_and_repair(p).unwrap(), Verification::Pending);
        assert_eq!(fx.read("/busy.txt"), b"new");
        assert_eq!(LocalCodec::count(&fx.codec.repairs), 0);

        fx.manager
            .carry_over(p, Path::new("/moved.txt"), Carry::Rename)
            .unwrap();
        assert!(!fx.manager.is_pending(p));
        assert!(fx.manager.is_pending(Path::new("/moved.txt")));

        fx.manager.ensure_container(Path::new("/moved.txt")).unwrap();
        assert!(!fx.manager.is_pending(Path::new("/moved.txt")));
        assert_eq!(
            fx.manager.verify_and_repair(Path::new("/moved.txt")).unwrap(),
            Verification::Intact
        );
    }

    #[test]
    fn test_clear_orphan() {
        let fx = Fixture::new();
        let p = Path::new("/o.txt");
        fs::write(fx.manager.mapper().resolve_container(p), b"orphan").unwrap();
        assert!(matches!(fx.manager.clear_orphan(p), SidecarOutcome::Removed));
        assert!(matches!(fx.manager.clear_orphan(p), SidecarOutcome::Absent));
    }

    #[test]
    fn test_concurrent_opens_repair_once() {
        let fx = Fixture::new();
        let p = Path::new("/hot.bin");
        fx.write("/hot.bin", b"shared content");
        fx.manager.ensure_container(p).unwrap();
        corrupt(&fx.real("/hot.bin"));
        fx.codec.set_repair_delay(Duration::from_millis(50));

        let workers: Vec<_> = (0..6)
            .map(|_| {
                let manager = fx.manager.clone();
                thread::spawn(move || manager.verify_and_repair(Path::new("/hot.bin")).unwrap())
            })
            .collect();
        let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(LocalCodec::count(&fx.codec.repairs), 1);
        assert_eq!(
            results
                .iter()
                .filter(|v| matches!(v, Verification::Restored(_)))
                .count(),
            1
        );
        assert_eq!(fx.read("/hot.bin"), b"shared content");
        assert!(fx.manager.locks().is_empty());
    }
}
