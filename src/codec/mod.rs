//! External codec collaborator
//!
//! The erasure coding itself lives in a separate executable (rsbx). This
//! module narrows it to a typed, synchronous interface: callers see
//! digests, repair counts and typed errors, never the tool's raw text.

mod report;
mod rsbx;
#[cfg(test)]
pub(crate) mod testing;

pub use report::{parse_repair, parse_show};
pub use rsbx::RsbxCodec;

use std::path::Path;

use crate::error::Result;
use crate::integrity::Digest;

/// Block counts reported by a repair run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepairReport {
    /// Blocks that failed to process (damaged or unreadable)
    pub failed_to_process: u64,
    /// Of those, blocks the code could not reconstruct
    pub failed_to_repair: u64,
}

impl RepairReport {
    /// Every damaged block was reconstructed
    pub fn is_recoverable(&self) -> bool {
        self.failed_to_repair == 0
    }
}

/// Operations the overlay needs from the codec
pub trait Codec: Send + Sync {
    /// Write a container for `source` at `dest`, overwriting when `force` is set
    fn encode(&self, force: bool, source: &Path, dest: &Path) -> Result<()>;

    /// Digest embedded in a container at encode time
    fn show(&self, container: &Path) -> Result<Digest>;

    /// Repair a container's recoverable blocks in place
    fn repair(&self, container: &Path) -> Result<RepairReport>;

    /// Rebuild the original content from a container into `dest`
    fn decode(&self, container: &Path, dest: &Path) -> Result<()>;
}
