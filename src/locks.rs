use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// Named locks serializing operations on shared backend state.
///
/// Keys are free-form; the release actions use `export:{name}` for the local
/// recipe cache, `upload:{name}@{remote}` for remotes and the folder path for
/// wipes and clones. Operations under different keys never wait on each
/// other.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock named `key`.
    pub fn with<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(key.to_string()).or_default().clone()
        };

        // The lock guards no data, poisoning is ignored.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(lock = key, "acquired");
        f()
    }

    pub fn export_key(name: &str) -> String {
        format!("export:{name}")
    }

    pub fn upload_key(name: &str, remote: &str) -> String {
        format!("upload:{name}@{remote}")
    }

    pub fn folder_key(folder: &camino::Utf8Path) -> String {
        format!("folder:{folder}")
    }
}
