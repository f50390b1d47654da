//! Content digests and container comparison
//!
//! A real file is streamed through SHA-256 in fixed-size chunks so that
//! large files are never held in memory. The result is compared against
//! the digest the codec embedded in the container at encode time.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ring::digest::{Context, SHA256};

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::mapper::PathMapper;

/// Read buffer used when hashing real files
pub const DIGEST_BUF_SIZE: usize = 64 * 1024;

/// Length of a SHA-256 digest in bytes
pub const DIGEST_LEN: usize = 32;

/// SHA-256 of a file's content
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Digest(bytes)
    }

    /// Parse a hex digest, rejecting anything that is not exactly 32 bytes
    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s.trim()).ok()?;
        let bytes: [u8; DIGEST_LEN] = raw.try_into().ok()?;
        Some(Digest(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Digest of an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        let mut ctx = Context::new(&SHA256);
        ctx.update(data);
        finish(ctx)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

fn finish(ctx: Context) -> Digest {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(ctx.finish().as_ref());
    Digest(out)
}

/// Stream a file through SHA-256 using a buffer of `buf_size` bytes
pub fn digest_file(path: &Path, buf_size: usize) -> Result<Digest> {
    let mut file = File::open(path).map_err(|e| Error::from_io(path, e))?;
    let mut ctx = Context::new(&SHA256);
    let mut buf = vec![0u8; buf_size.max(1)];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        };
        ctx.update(&buf[..n]);
    }

    Ok(finish(ctx))
}

/// Outcome of comparing a file with its container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No container beside the file
    NoContainer,
    /// Container digest matches the file
    Match(Digest),
    /// Container digest differs from the file
    Mismatch { actual: Digest, stored: Digest },
}

/// Computes and compares digests of real files
pub struct IntegrityVerifier {
    mapper: PathMapper,
    codec: Arc<dyn Codec>,
}

impl IntegrityVerifier {
    pub fn new(mapper: PathMapper, codec: Arc<dyn Codec>) -> Self {
        Self { mapper, codec }
    }

    /// Digest of the real file behind a logical path
    pub fn digest(&self, logical: &Path) -> Result<Digest> {
        digest_file(&self.mapper.resolve_real(logical), DIGEST_BUF_SIZE)
    }

    /// Digest the codec recorded inside a container
    pub fn extract_stored_digest(&self, container: &Path) -> Result<Digest> {
        self.codec.show(container)
    }

    /// Compare a logical file against its container without repairing
    pub fn check(&self, logical: &Path) -> Result<Verdict> {
        if !self.mapper.container_exists(logical) {
            return Ok(Verdict::NoContainer);
        }
        let container: PathBuf = self.mapper.resolve_container(logical);
        let actual = self.digest(logical)?;
        let stored = self.extract_stored_digest(&container)?;
        if actual == stored {
            Ok(Verdict::Match(actual))
        } else {
            Ok(Verdict::Mismatch { actual, stored })
        }
    }
}
