//! Logical path to real/container path translation

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use crate::config::CONTAINER_SUFFIX;

/// Maps client-visible paths onto the backing root
#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
}

impl PathMapper {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a logical path to the backing file
    pub fn resolve_real(&self, logical: &Path) -> PathBuf {
        let relative = logical.strip_prefix("/").unwrap_or(logical);
        if relative.as_os_str().is_empty() {
            return self.root.clone();
        }
        self.root.join(relative)
    }

    /// Resolve a logical path to its container sidecar
    pub fn resolve_container(&self, logical: &Path) -> PathBuf {
        with_suffix(self.resolve_real(logical))
    }

    /// Check whether a container sits beside the logical file
    pub fn container_exists(&self, logical: &Path) -> bool {
        self.resolve_container(logical).exists()
    }

    /// Convert an absolute real path back to its logical form
    pub fn to_logical(&self, real: &Path) -> Option<PathBuf> {
        real.strip_prefix(&self.root)
            .ok()
            .map(|p| PathBuf::from("/").join(p))
    }

    /// Scratch file beside the real file, hidden from listings by the suffix
    pub fn resolve_staging(&self, logical: &Path) -> PathBuf {
        let real = self.resolve_real(logical);
        let mut name = OsString::from(".");
        name.push(real.file_name().unwrap_or_else(|| OsStr::new("root")));
        name.push(".restore");
        with_suffix(real.with_file_name(name))
    }

    /// Canonical key for a logical path: always rooted at `/`
    pub fn normalize(logical: &Path) -> PathBuf {
        Path::new("/").join(logical.strip_prefix("/").unwrap_or(logical))
    }

    /// Whether any component of a client path names a sidecar
    pub fn names_container(logical: &Path) -> bool {
        logical.components().any(|c| match c {
            Component::Normal(name) => is_container_name(name),
            _ => false,
        })
    }
}

/// Directory entry names ending in the suffix are sidecars
pub fn is_container_name(name: &OsStr) -> bool {
    name.as_bytes().ends_with(CONTAINER_SUFFIX.as_bytes())
}

/// Append the container suffix to a path
pub fn with_suffix(path: PathBuf) -> PathBuf {
    let mut raw: OsString = path.into_os_string();
    raw.push(CONTAINER_SUFFIX);
    PathBuf::from(raw)
}
