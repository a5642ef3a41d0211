//! Store Module
//!
//! Ordered key/value contract the rest of the system is written against,
//! plus the two implementations: an embedded sled store for durable nodes
//! and a BTreeMap store for ephemeral runs and tests.

pub mod keys;
mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::error::Result;

/// A key/value pair returned by a prefix scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Ordered key/value store with prefix scan.
///
/// Implementations must be safe for concurrent use on independent keys;
/// writes to a single key are strongly ordered.
pub trait Store: Send + Sync {
    /// Set a key to a value
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Get a value, `None` when the key is absent
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Delete a key; deleting an absent key is a no-op
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All pairs whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KeyValue>>;
}
