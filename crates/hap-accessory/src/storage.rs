//! Persistence trait for identifier-cache and pairing state (enables
//! mocking in tests).

use async_trait::async_trait;
use hap_core::StorageError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Key/value persistence consumed by the engine.
///
/// Implementations are supplied by the embedding application; the engine
/// stores identifier-cache entries, pairing records, and per-controller
/// state keyed by the accessory-root identity.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait Storage: Send + Sync {
    /// Fetch the blob for a key, None if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a blob under a key, replacing any previous value.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Remove a key; absent keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Backend("storage lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Backend("storage lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StorageError::Backend("storage lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}
