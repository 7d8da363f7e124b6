//! Storage layer.
//!
//! Every table, the manifest and the quarantine sink live as named objects in a
//! [`Storage`] backend. Objects are versioned: each successful `put` returns a
//! new version and a `put` can be made conditional on the version the caller
//! read, which is how the engine gets check-then-act atomicity without locks.
//!
//! - [`MemoryStorage`] - in-process backend, used by tests and ad-hoc runs
//! - [`FileStorage`] - directory-backed backend
//! - [`Warehouse`] - typed access to bronze/silver/gold/quarantine objects
//! - [`RetryPolicy`] - bounded retry for transient failures

pub mod file;
pub mod retry;
pub mod tables;

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{StorageError, StorageResult};

pub use file::FileStorage;
pub use retry::{with_retry, RetryPolicy};
pub use tables::{GoldTable, SilverTable, TableName, Versioned, Warehouse};

/// An object read from storage, with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub version: u64,
}

/// Precondition for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional write.
    Any,
    /// Current version must equal the given one. `IfVersion(0)` means "must not exist".
    IfVersion(u64),
}

/// Named, versioned object storage.
///
/// Versions start at 1 for the first write; an absent object has version 0.
pub trait Storage: Send + Sync {
    /// Read the latest version of an object.
    fn get(&self, key: &str) -> StorageResult<Option<StoredObject>>;

    /// Write a new version. Returns the version written.
    fn put(&self, key: &str, bytes: &[u8], condition: WriteCondition) -> StorageResult<u64>;

    /// Keys that start with `prefix`, sorted.
    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// In-memory storage. Cheap to create, shared across threads.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<StoredObject>> {
        let objects = self
            .objects
            .lock()
            .map_err(|e| StorageError::unavailable(key, e))?;
        Ok(objects.get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8], condition: WriteCondition) -> StorageResult<u64> {
        let mut objects = self
            .objects
            .lock()
            .map_err(|e| StorageError::unavailable(key, e))?;
        let current = objects.get(key).map(|o| o.version).unwrap_or(0);

        if let WriteCondition::IfVersion(expected) = condition {
            if expected != current {
                return Err(StorageError::Conflict {
                    key: key.to_string(),
                    expected,
                    found: current,
                });
            }
        }

        let version = current + 1;
        objects.insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                version,
            },
        );
        Ok(version)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let objects = self
            .objects
            .lock()
            .map_err(|e| StorageError::unavailable(prefix, e))?;
        Ok(objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
