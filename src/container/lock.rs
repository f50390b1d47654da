//! Per-path lock table
//!
//! Locks are created on first use and dropped from the table once the
//! last holder lets go, so the table only ever holds paths with work in
//! flight.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type PathLock = Arc<RwLock<()>>;

/// Reader/writer scopes keyed by logical path
#[derive(Default)]
pub struct PathLocks {
    table: DashMap<PathBuf, PathLock>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    fn acquire(&self, key: &Path) -> PathLock {
        self.table
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .value()
            .clone()
    }

    fn release(&self, key: &Path, lock: PathLock) {
        drop(lock);
        self.table.remove_if(key, |_, l| Arc::strong_count(l) == 1);
    }

    /// Run `f` while no other scope on `key` is active
    pub fn exclusive<R>(&self, key: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.acquire(key);
        let result = {
            let _guard = lock.write();
            f()
        };
        self.release(key, lock);
        result
    }

    /// Run `f` alongside other shared scopes on `key`
    pub fn shared<R>(&self, key: &Path, f: impl FnOnce() -> R) -> R {
        let lock = self.acquire(key);
        let result = {
            let _guard = lock.read();
            f()
        };
        self.release(key, lock);
        result
    }

    /// Hold exclusive scopes on two paths, taken in sorted order
    pub fn exclusive_pair<R>(&self, a: &Path, b: &Path, f: impl FnOnce() -> R) -> R {
        if a == b {
            return self.exclusive(a, f);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        self.exclusive(first, || self.exclusive(second, f))
    }

    /// Number of paths with a live scope
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
