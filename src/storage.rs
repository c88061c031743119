//! Local durable key-value storage.
//!
//! The presence transport keeps the caller's last location and status here so
//! a restarted client comes back where it left off. Values are JSON.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use uuid::Uuid;

pub const LAST_LOCATION_KEY: &str = "livemap.last_location";
pub const LAST_STATUS_KEY: &str = "livemap.last_status_message";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage value is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

impl crate::frame::ErrorCode for StorageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "E_STORAGE_IO",
            Self::Json(_) => "E_STORAGE_JSON",
            Self::Poisoned => "E_STORAGE_LOCK",
        }
    }
}

/// Minimal string-keyed store of JSON values.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError>;
    fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// Typed read. A value that no longer matches `T` reads as absent.
pub fn get_typed<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>, StorageError> {
    Ok(store.get(key)?.and_then(|v| serde_json::from_value(v).ok()))
}

/// Typed write.
pub fn set_typed<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), StorageError> {
    store.set(key, serde_json::to_value(value)?)
}

/// Last location the caller was placed at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoredLocation {
    #[serde(default)]
    pub floor_id: Option<Uuid>,
    pub x: f64,
    pub y: f64,
}

// =============================================================================
// MEMORY
// =============================================================================

#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

// =============================================================================
// JSON FILE
// =============================================================================

/// One JSON object on disk, rewritten on every change.
pub struct JsonFileKv {
    path: PathBuf,
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl JsonFileKv {
    /// Open `path`, starting empty when the file is missing or corrupt.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "discarding corrupt local storage file");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries: Mutex::new(entries) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_through(&self, entries: &HashMap<String, serde_json::Value>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileKv {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
        let entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_owned(), value);
        self.write_through(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().map_err(|_| StorageError::Poisoned)?;
        if entries.remove(key).is_some() {
            self.write_through(&entries)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod tests;
