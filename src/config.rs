//! Configuration management for sbxfs

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Suffix appended to a real path to name its container
pub const CONTAINER_SUFFIX: &str = ".sbxfs.sbx";

/// Default SeqBox container version (Reed-Solomon enabled, 4 KiB blocks)
pub const DEFAULT_SBX_VERSION: u8 = 17;

/// Default Reed-Solomon data shards
pub const DEFAULT_RS_DATA: u32 = 10;

/// Default Reed-Solomon parity shards
pub const DEFAULT_RS_PARITY: u32 = 2;

/// Default burst error resistance level
pub const DEFAULT_BURST: u32 = 10;

/// SBX versions understood by rsbx
const SBX_VERSIONS: [u8; 6] = [1, 2, 3, 17, 18, 19];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// External codec configuration
    pub codec: CodecConfig,

    /// Container lifecycle configuration
    pub container: ContainerConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Filesystem name shown in the mount table
    pub fs_name: String,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    pub auto_unmount: bool,

    /// Attribute cache TTL handed to the kernel (ms)
    pub attr_ttl_ms: u64,
}

/// External codec (rsbx) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Program to invoke, looked up in PATH when not absolute
    pub program: String,

    /// SBX container version
    pub sbx_version: u8,

    /// Reed-Solomon data shards
    pub rs_data: u32,

    /// Reed-Solomon parity shards
    pub rs_parity: u32,

    /// Burst error resistance level
    pub burst: u32,

    /// How to pick fields out of the program's reports
    pub report: ReportLayout,
}

/// Patterns used to read rsbx's human-readable reports.
///
/// The layout of those reports is tied to the rsbx version, so it is
/// configuration rather than a fixed contract. Each pattern must contain
/// exactly one capture group holding the value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportLayout {
    /// Captures the hex digest from `rsbx show`
    pub hash: String,

    /// Captures the failed-to-process count from `rsbx repair`
    pub failed_to_process: String,

    /// Captures the failed-to-repair count from `rsbx repair`
    pub failed_to_repair: String,
}

/// Container lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Encode files without a container when a read-only handle is released
    pub adopt_on_close: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            fs_name: "sbxfs".to_string(),
            allow_other: false,
            auto_unmount: true,
            attr_ttl_ms: 1000,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            program: "rsbx".to_string(),
            sbx_version: DEFAULT_SBX_VERSION,
            rs_data: DEFAULT_RS_DATA,
            rs_parity: DEFAULT_RS_PARITY,
            burst: DEFAULT_BURST,
            report: ReportLayout::default(),
        }
    }
}

impl Default for ReportLayout {
    fn default() -> Self {
        ReportLayout {
            hash: r"(?m)^\s*Hash\s*:\s*\S+\s*-\s*([0-9A-Fa-f]+)\s*$".to_string(),
            failed_to_process: r"(?m)^\s*Number of blocks failed to process\s*:\s*(\d+)".to_string(),
            failed_to_repair: r"(?m)^\s*Number of blocks failed to repair\s*:\s*(\d+)".to_string(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            adopt_on_close: true,
        }
    }
}

impl ReportLayout {
    /// Compile all patterns, checking each has exactly one capture group
    pub fn compile(&self) -> Result<CompiledLayout> {
        Ok(CompiledLayout {
            hash: compile_field("hash", &self.hash)?,
            failed_to_process: compile_field("failed_to_process", &self.failed_to_process)?,
            failed_to_repair: compile_field("failed_to_repair", &self.failed_to_repair)?,
        })
    }
}

/// Report patterns ready for matching
#[derive(Debug, Clone)]
pub struct CompiledLayout {
    pub hash: Regex,
    pub failed_to_process: Regex,
    pub failed_to_repair: Regex,
}

fn compile_field(name: &str, pattern: &str) -> Result<Regex> {
    let re = Regex::new(pattern)
        .map_err(|e| Error::InvalidConfig(format!("report pattern '{}': {}", name, e)))?;
    // captures_len counts the implicit whole-match group
    if re.captures_len() != 2 {
        return Err(Error::InvalidConfig(format!(
            "report pattern '{}' must have exactly one capture group",
            name
        )));
    }
    Ok(re)
}

impl Config {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sbxfs")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file when it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(program) = std::env::var("SBXFS_RSBX") {
            let program = program.trim().to_string();
            if !program.is_empty() {
                self.codec.program = program;
            }
        }

        if let Ok(version) = std::env::var("SBXFS_SBX_VERSION") {
            if let Ok(v) = version.trim().parse::<u8>() {
                self.codec.sbx_version = v;
            }
        }

        if let Ok(data) = std::env::var("SBXFS_RS_DATA") {
            if let Ok(n) = data.trim().parse::<u32>() {
                self.codec.rs_data = n;
            }
        }

        if let Ok(parity) = std::env::var("SBXFS_RS_PARITY") {
            if let Ok(n) = parity.trim().parse::<u32>() {
                self.codec.rs_parity = n;
            }
        }

        if let Ok(burst) = std::env::var("SBXFS_BURST") {
            if let Ok(n) = burst.trim().parse::<u32>() {
                self.codec.burst = n;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.codec.program.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "Codec program must not be empty".to_string(),
            ));
        }

        if !SBX_VERSIONS.contains(&self.codec.sbx_version) {
            return Err(Error::InvalidConfig(format!(
                "Unsupported SBX version {}",
                self.codec.sbx_version
            )));
        }

        if self.codec.rs_data == 0 {
            return Err(Error::InvalidConfig(
                "RS data shards must be greater than 0".to_string(),
            ));
        }

        if self.codec.rs_parity == 0 {
            return Err(Error::InvalidConfig(
                "RS parity shards must be greater than 0".to_string(),
            ));
        }

        if self.codec.burst == 0 {
            return Err(Error::InvalidConfig(
                "Burst level must be greater than 0".to_string(),
            ));
        }

        self.codec.report.compile()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.codec.program, "rsbx");
        assert_eq!(config.codec.sbx_version, 17);
        assert_eq!(config.codec.rs_data, 10);
        assert_eq!(config.codec.rs_parity, 2);
        assert_eq!(config.codec.burst, 10);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.codec.sbx_version = 4;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.codec.rs_data = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.codec.program = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_report_pattern_needs_one_group() {
        let mut config = Config::default();
        config.codec.report.hash = r"Hash\s*:\s*\S+".to_string();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.codec.report.hash = r"Hash (".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.mount.allow_other = true;
        config.codec.burst = 4;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.mount.allow_other);
        assert_eq!(loaded.codec.burst, 4);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "codec": { "rs_parity": 3 } }"#).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.codec.rs_parity, 3);
        assert_eq!(loaded.codec.rs_data, DEFAULT_RS_DATA);
        assert_eq!(loaded.mount.fs_name, "sbxfs");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.json")).unwrap();
        assert!(config.container.adopt_on_close);
    }
}
