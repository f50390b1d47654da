//! Whole-tree verification
//!
//! Walks the backing root and runs verify-and-repair on every regular
//! file, so corruption is found before a client trips over it.

use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::container::{ContainerManager, Verification};
use crate::error::Error;
use crate::mapper::is_container_name;

/// A file the scrub could not vouch for
#[derive(Debug)]
pub struct ScrubFailure {
    pub path: PathBuf,
    pub error: Error,
}

/// Scrub report
#[derive(Debug, Default)]
pub struct ScrubReport {
    /// Regular files visited
    pub checked: usize,
    /// Files that matched their container
    pub intact: usize,
    /// Files restored from their container
    pub restored: usize,
    /// Files without a container
    pub unprotected: usize,
    /// Files with writes still in flight, skipped
    pub pending: usize,
    /// Unprotected files given a container during this scrub
    pub adopted: usize,
    pub failures: Vec<ScrubFailure>,
}

impl ScrubReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Files whose corruption exceeded what their container could repair
    pub fn unrecoverable(&self) -> usize {
        self.failures
            .iter()
            .filter(|f| matches!(f.error, Error::UnrecoverableCorruption { .. }))
            .count()
    }
}

/// Verify every file under the manager's root; with `adopt`, unprotected
/// files get a container
pub fn scrub(manager: &ContainerManager, adopt: bool) -> ScrubReport {
    let root = manager.mapper().root().to_path_buf();
    let mut report = ScrubReport::default();
    info!("Starting scrub of {:?}", root);

    let walker = WalkDir::new(&root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_container_name(e.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(|p| p.to_path_buf()).unwrap_or_else(|| root.clone());
                warn!("Cannot walk {:?}: {}", path, e);
                let io = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error"));
                report.failures.push(ScrubFailure {
                    path,
                    error: Error::Io(io),
                });
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        let logical = match manager.mapper().to_logical(entry.path()) {
            Some(logical) => logical,
            None => continue,
        };

        report.checked += 1;
        debug!("scrubbing {:?}", logical);

        match manager.verify_and_repair(&logical) {
            Ok(Verification::Intact) => report.intact += 1,
            Ok(Verification::Restored(_)) => report.restored += 1,
            Ok(Verification::Pending) => report.pending += 1,
            Ok(Verification::Unprotected) => {
                report.unprotected += 1;
                if adopt {
                    match manager.ensure_container(&logical) {
                        Ok(()) => report.adopted += 1,
                        Err(e) => report.failures.push(ScrubFailure { path: logical, error: e }),
                    }
                }
            }
            Err(e) => {
                error!("Scrub failed for {:?}: {}", logical, e);
                report.failures.push(ScrubFailure { path: logical, error: e });
            }
        }
    }

    info!(
        "Scrub completed: {} checked, {} intact, {} restored, {} unprotected, {} failed",
        report.checked,
        report.intact,
        report.restored,
        report.unprotected,
        report.failures.len()
    );
    report
}
