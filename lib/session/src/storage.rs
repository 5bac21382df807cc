//! Persistence port for session state.
//!
//! Only [`SessionStore`](crate::SessionStore) writes through this port. Keys
//! match the ones the dashboard has always used so existing browser or
//! desktop state keeps working.

use crate::error::StorageError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Key holding the access token.
pub const ACCESS_TOKEN_KEY: &str = "authToken";
/// Key holding the refresh token.
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
/// Key holding the serialized principal.
pub const PRINCIPAL_KEY: &str = "userData";
/// Key holding the access token expiry estimate (RFC 3339).
pub const EXPIRES_AT_KEY: &str = "authTokenExpiresAt";
/// Former name of [`PRINCIPAL_KEY`], migrated once at startup.
pub const LEGACY_PRINCIPAL_KEY: &str = "user_data";
/// Keys written by older releases that are no longer read.
pub const OBSOLETE_KEYS: [&str; 3] = ["authRefreshToken", "authUser", "user"];

/// Narrow key-value persistence used by the session store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Migrates legacy keys and purges obsolete ones.
///
/// If the legacy principal key exists and the current one does not, the
/// value is copied over. The legacy key is then removed either way. Running
/// this again is a no-op. Returns true if anything changed.
pub fn migrate_legacy_keys(storage: &dyn KeyValueStore) -> Result<bool, StorageError> {
    let mut changed = false;

    if let Some(legacy) = storage.get(LEGACY_PRINCIPAL_KEY)? {
        if storage.get(PRINCIPAL_KEY)?.is_none() {
            storage.set(PRINCIPAL_KEY, &legacy)?;
            info!(from = LEGACY_PRINCIPAL_KEY, to = PRINCIPAL_KEY, "Migrated legacy session key");
        }
        storage.remove(LEGACY_PRINCIPAL_KEY)?;
        changed = true;
    }

    for key in OBSOLETE_KEYS {
        if storage.get(key)?.is_some() {
            storage.remove(key)?;
            debug!(key, "Removed obsolete session key");
            changed = true;
        }
    }

    Ok(changed)
}

/// In-process store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with entries.
    #[must_use]
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Returns the stored keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object on disk.
///
/// Every write rewrites the file through a temporary sibling and a rename,
/// so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, StorageError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(HashMap::new()),
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| StorageError::Serialization {
                    reason: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(StorageError::Io {
                reason: format!("{}: {e}", self.path.display()),
            }),
        }
    }

    fn save(&self, entries: &HashMap<String, String>) -> Result<(), StorageError> {
        let io_error = |e: std::io::Error| StorageError::Io {
            reason: format!("{}: {e}", self.path.display()),
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let contents =
            serde_json::to_string_pretty(entries).map_err(|e| StorageError::Serialization {
                reason: e.to_string(),
            })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(io_error)?;
        std::fs::rename(&tmp, &self.path).map_err(io_error)
    }

    fn update(
        &self,
        apply: impl FnOnce(&mut HashMap<String, String>) -> bool,
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut entries, recovered) = match self.load() {
            Ok(entries) => (entries, false),
            Err(StorageError::Serialization { reason }) => {
                warn!(
                    path = %self.path.display(),
                    reason = %reason,
                    "Replacing unreadable session file"
                );
                (HashMap::new(), true)
            }
            Err(e) => return Err(e),
        };
        if apply(&mut entries) || recovered {
            self.save(&entries)?;
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.update(|entries| entries.remove(key).is_some())
    }
}
