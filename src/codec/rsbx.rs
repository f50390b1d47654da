//! rsbx subprocess codec

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, Output};

use tracing::debug;

use crate::config::{CodecConfig, CompiledLayout};
use crate::error::{Error, Result};
use crate::integrity::Digest;

use super::{report, Codec, RepairReport};

/// Codec backed by the rsbx executable
pub struct RsbxCodec {
    config: CodecConfig,
    layout: CompiledLayout,
}

impl RsbxCodec {
    pub fn new(config: CodecConfig) -> Result<Self> {
        let layout = config.report.compile()?;
        Ok(Self { config, layout })
    }

    /// Arguments for `rsbx encode`
    fn encode_args(&self, force: bool, source: &Path, dest: &Path) -> Vec<OsString> {
        let mut args = vec![OsString::from("encode")];
        if force {
            args.push(OsString::from("--force"));
        }
        for (flag, value) in [
            ("--sbx-version", self.config.sbx_version.to_string()),
            ("--rs-data", self.config.rs_data.to_string()),
            ("--rs-parity", self.config.rs_parity.to_string()),
            ("--burst", self.config.burst.to_string()),
            ("--pv", "0".to_string()),
        ] {
            args.push(OsString::from(flag));
            args.push(OsString::from(value));
        }
        args.push(source.as_os_str().to_owned());
        args.push(dest.as_os_str().to_owned());
        args
    }

    fn run<I, S>(&self, args: I) -> std::result::Result<Output, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(args);
        debug!("running {:?}", cmd);
        cmd.output()
            .map_err(|e| format!("failed to run {}: {}", self.config.program, e))
    }
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {}", output.status, stderr)
    }
}

impl Codec for RsbxCodec {
    fn encode(&self, force: bool, source: &Path, dest: &Path) -> Result<()> {
        let fail = |reason: String| Error::Encode {
            path: source.to_path_buf(),
            reason,
        };
        let output = self.run(self.encode_args(force, source, dest)).map_err(fail)?;
        if !output.status.success() {
            return Err(fail(failure(&output)));
        }
        Ok(())
    }

    fn show(&self, container: &Path) -> Result<Digest> {
        let fail = |reason: String| Error::CorruptContainer {
            path: container.to_path_buf(),
            reason,
        };
        let output = self
            .run([OsStr::new("show"), OsStr::new("--pv"), OsStr::new("0"), container.as_os_str()])
            .map_err(fail)?;
        if !output.status.success() {
            return Err(fail(failure(&output)));
        }
        report::parse_show(&self.layout, &stdout_of(&output)).map_err(fail)
    }

    fn repair(&self, container: &Path) -> Result<RepairReport> {
        let fail = |reason: String| Error::Repair {
            path: container.to_path_buf(),
            reason,
        };
        let output = self
            .run([
                OsStr::new("repair"),
                OsStr::new("--skip-warning"),
                OsStr::new("--pv"),
                OsStr::new("0"),
                container.as_os_str(),
            ])
            .map_err(fail)?;

        // rsbx exits non-zero when blocks stay broken but still prints the
        // counts; a readable report wins over the exit status.
        match report::parse_repair(&self.layout, &stdout_of(&output)) {
            Ok(report) => Ok(report),
            Err(_) if !output.status.success() => Err(fail(failure(&output))),
            Err(reason) => Err(fail(reason)),
        }
    }

    fn decode(&self, container: &Path, dest: &Path) -> Result<()> {
        let fail = |reason: String| Error::Decode {
            path: container.to_path_buf(),
            reason,
        };
        let output = self
            .run([
                OsStr::new("decode"),
                OsStr::new("--force"),
                OsStr::new("--pv"),
                OsStr::new("0"),
                container.as_os_str(),
                dest.as_os_str(),
            ])
            .map_err(fail)?;
        if !output.status.success() {
            return Err(fail(failure(&output)));
        }
        Ok(())
    }
}
