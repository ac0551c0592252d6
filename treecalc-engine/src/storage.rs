//! Storage managers
//!
//! A node that names a storage is loadable: its source payload is read
//! through the manager registered under that name instead of being
//! supplied directly.

use crate::data::Column;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;

/// Failures of storage managers
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// A node names a storage the session has no manager for
    #[error("No storage manager registered as '{0}'")]
    UnknownStorage(String),

    /// The manager holds nothing at the path
    #[error("Nothing stored at '{0}'")]
    NotFound(String),

    /// The manager itself failed
    #[error("Storage '{storage}' failed: {message}")]
    Backend {
        /// Registered name of the manager
        storage: String,
        /// What went wrong
        message: String,
    },
}

/// Materializes and persists payloads by storage path
pub trait StorageManager: Send + Sync + fmt::Debug {
    /// Payload stored at `path`
    fn read(&self, path: &str) -> Result<Column, StorageError>;

    /// Store `column` at `path`, replacing what was there
    fn write(&self, path: &str, column: &Column) -> Result<(), StorageError>;

    /// Is anything stored at `path`?
    fn exists(&self, path: &str) -> bool;
}

/// In-process storage, mostly for models built in code and tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    columns: RwLock<HashMap<String, Column>>,
}

impl MemoryStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`StorageManager::write`]
    pub fn with(self, path: &str, column: Column) -> Self {
        self.columns.write().insert(path.to_string(), column);
        self
    }

    /// Number of stored payloads
    pub fn len(&self) -> usize {
        self.columns.read().len()
    }

    /// Nothing stored?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageManager for MemoryStorage {
    fn read(&self, path: &str) -> Result<Column, StorageError> {
        self.columns
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn write(&self, path: &str, column: &Column) -> Result<(), StorageError> {
        self.columns.write().insert(path.to_string(), column.clone());
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.columns.read().contains_key(path)
    }
}
