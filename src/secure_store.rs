use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Validated storage key. Keys address opaque string blobs inside an
/// OS-protected store, so path-like and control characters are rejected up
/// front rather than trusted to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(key: impl Into<String>) -> Result<Self, StoreError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(key: &str) -> Result<(), StoreError> {
        if key.trim().is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }
        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }
        for c in key.chars() {
            if c.is_control() || c == '/' || c == '\\' {
                return Err(StoreError::InvalidKey {
                    key: key.to_string(),
                    reason: "key contains invalid characters".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// The only storage primitive the engine depends on. Hosts inject a concrete
/// implementation backed by the platform keystore; the engine never touches
/// the platform APIs itself.
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &StoreKey, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemorySecureStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key.as_str()).cloned())
    }

    async fn set(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.entries
            .lock()
            .await
            .insert(key.as_str().to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key.as_str());
        Ok(())
    }
}

/// File-backed store for hosts without a keystore bridge. One file per key
/// under a private directory; writes go through a temp file, fsync and rename
/// so a crash mid-write never leaves a torn value.
#[derive(Debug)]
pub struct FileSecureStore {
    dir: PathBuf,
    io_lock: Mutex<()>,
}

impl FileSecureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            dir,
            io_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &StoreKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    fn write_atomic(path: &Path, value: &str) -> std::io::Result<()> {
        let tmp_path = path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)?;
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SecureStore for FileSecureStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        let _guard = self.io_lock.lock().await;
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn set(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        let _guard = self.io_lock.lock().await;
        Self::write_atomic(&self.path_for(key), value)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &StoreKey) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }
}
