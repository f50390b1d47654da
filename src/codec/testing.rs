//! In-process codec used by unit tests in place of rsbx
//!
//! Containers are a header line holding the source digest followed by a
//! verbatim copy of the source bytes. Repair outcomes are scripted.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::integrity::Digest;

use super::{Codec, RepairReport};

const MAGIC: &str = "SBXFS-TEST";

/// What the next repair call reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairScript {
    /// Report the given counts
    Report(RepairReport),
    /// The repair invocation itself fails
    Fail,
}

pub struct LocalCodec {
    pub encodes: AtomicUsize,
    pub shows: AtomicUsize,
    pub repairs: AtomicUsize,
    pub decodes: AtomicUsize,
    fail_encode: AtomicBool,
    repair_script: Mutex<RepairScript>,
    repair_delay: Mutex<Duration>,
}

impl LocalCodec {
    pub fn new() -> Self {
        Self {
            encodes: AtomicUsize::new(0),
            shows: AtomicUsize::new(0),
            repairs: AtomicUsize::new(0),
            decodes: AtomicUsize::new(0),
            fail_encode: AtomicBool::new(false),
            // the container itself is intact, only the real file drifted
            repair_script: Mutex::new(RepairScript::Report(RepairReport::default())),
            repair_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_fail_encode(&self, fail: bool) {
        self.fail_encode.store(fail, Ordering::SeqCst);
    }

    pub fn script_repair(&self, script: RepairScript) {
        *self.repair_script.lock() = script;
    }

    pub fn set_repair_delay(&self, delay: Duration) {
        *self.repair_delay.lock() = delay;
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn split(container: &Path) -> Result<(Digest, Vec<u8>)> {
        let raw = std::fs::read(container).map_err(|e| Error::CorruptContainer {
            path: container.to_path_buf(),
            reason: e.to_string(),
        })?;
        let corrupt = |reason: &str| Error::CorruptContainer {
            path: container.to_path_buf(),
            reason: reason.to_string(),
        };
        let newline = raw
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| corrupt("missing header"))?;
        let header = std::str::from_utf8(&raw[..newline]).map_err(|_| corrupt("bad header"))?;
        let hex = header
            .strip_prefix(MAGIC)
            .map(str::trim)
            .ok_or_else(|| corrupt("bad magic"))?;
        let digest = Digest::from_hex(hex).ok_or_else(|| corrupt("bad digest"))?;
        Ok((digest, raw[newline + 1..].to_vec()))
    }
}

impl Default for LocalCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for LocalCodec {
    fn encode(&self, _force: bool, source: &Path, dest: &Path) -> Result<()> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        if self.fail_encode.load(Ordering::SeqCst) {
            return Err(Error::Encode {
                path: source.to_path_buf(),
                reason: "scripted failure".to_string(),
            });
        }
        let data = std::fs::read(source)?;
        let mut out = format!("{} {}\n", MAGIC, Digest::of(&data)).into_bytes();
        out.extend_from_slice(&data);
        std::fs::write(dest, out)?;
        Ok(())
    }

    fn show(&self, container: &Path) -> Result<Digest> {
        self.shows.fetch_add(1, Ordering::SeqCst);
        Self::split(container).map(|(digest, _)| digest)
    }

    fn repair(&self, container: &Path) -> Result<RepairReport> {
        self.repairs.fetch_add(1, Ordering::SeqCst);
        let delay = *self.repair_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        match *self.repair_script.lock() {
            RepairScript::Report(report) => Ok(report),
            RepairScript::Fail => Err(Error::Repair {
                path: container.to_path_buf(),
                reason: "scripted failure".to_string(),
            }),
        }
    }

    fn decode(&self, container: &Path, dest: &Path) -> Result<()> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        let (_, data) = Self::split(container)?;
        std::fs::write(dest, data)?;
        Ok(())
    }
}
