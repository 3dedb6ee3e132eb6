//! Shared key-value store
//!
//! Every piece of broker state that must be visible across processes lives in
//! a strongly consistent hierarchical key-value store. Keys are `/`-separated
//! paths; a "directory" exists whenever at least one key lives beneath it.
//!
//! The store guarantees read-after-write consistency per key and an atomic
//! set-if-absent (`create`). It offers no multi-key transactions.

pub mod etcd;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KvError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Store request failed: {0}")]
    Http(String),

    #[error("Store returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode store response: {0}")]
    Decode(String),
}

impl KvError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, KvError::NotFound(_))
    }
}

/// One immediate child of a listed directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Full key relative to the store root, without a leading `/`
    pub key: String,
    /// Value of a leaf key, `None` for a directory
    pub value: Option<String>,
}

impl KvEntry {
    /// Last path segment of the key
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    pub fn is_dir(&self) -> bool {
        self.value.is_none()
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows swapping etcd for memory in tests)
// ============================================================================

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a leaf key
    async fn get(&self, key: &str) -> Result<String, KvError>;

    /// Write a leaf key, overwriting any previous value
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Write a leaf key only if it does not exist yet
    async fn create(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Remove a leaf key
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Remove a directory and everything beneath it
    async fn delete_dir(&self, dir: &str) -> Result<(), KvError>;

    /// List the immediate children of a directory, ordered by key
    async fn list(&self, dir: &str) -> Result<Vec<KvEntry>, KvError>;

    /// Whether a leaf key or a non-empty directory exists at `key`
    async fn exists(&self, key: &str) -> Result<bool, KvError>;
}

pub type SharedKvStore = Arc<dyn KvStore>;

/// Strip leading/trailing separators so `"/a/b/"` and `"a/b"` address the same key
pub fn normalize_key(key: &str) -> String {
    key.trim_matches('/').to_string()
}
