//! Container lifecycle management
//!
//! Every regular file may have a SeqBox container beside it. This module
//! decides when containers are created, trusted, repaired, carried along
//! with their files, or discarded.

mod lock;
mod manager;

pub use lock::PathLocks;
pub use manager::ContainerManager;

use crate::codec::RepairReport;
use crate::error::Error;

/// What is known about a file's container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// No container: the file is unprotected
    NoContainer,
    /// Container exists but has not been checked since it was last touched
    Unverified,
    /// Container digest matches the file
    Trusted,
}

/// Result of a verify-and-repair pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Nothing to verify against
    Unprotected,
    /// File matched its container
    Intact,
    /// File has writes the container does not cover yet; left as is
    Pending,
    /// File was restored from its container
    Restored(RepairReport),
}

/// Primitive applied to a file and carried over to its container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Carry {
    Rename,
    Link,
}

/// What happened to the sidecar during a file operation
#[derive(Debug)]
pub enum SidecarOutcome {
    /// There was no sidecar to act on
    Absent,
    /// The operation was applied to the sidecar as well
    Applied,
    /// A sidecar was deleted
    Removed,
    /// The sidecar step failed; the file operation still went ahead
    Failed(Error),
}

impl SidecarOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, SidecarOutcome::Failed(_))
    }
}
