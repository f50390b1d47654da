//! sbxfs - self-healing overlay filesystem
//!
//! Mirrors a backing directory through FUSE and keeps an erasure-coded
//! SeqBox container beside every regular file. Files are checked against
//! their container when opened and restored from it when they have
//! drifted; containers are regenerated whenever a file changes.

pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod fs;
pub mod integrity;
pub mod mapper;
pub mod scrub;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::codec::{Codec, RsbxCodec};
    pub use crate::config::Config;
    pub use crate::container::{ContainerManager, ContainerState, Verification};
    pub use crate::error::{Error, Result};
    pub use crate::fs::{Overlay, SbxFs};
    pub use crate::mapper::PathMapper;
}
