//! Durable store backed by sled.
//!
//! sled keeps keys in order, which makes the `config/` and `slave/`
//! prefix scans cheap. Writes are flushed before returning so a restart
//! after an acknowledged put never loses the entry.

use std::path::Path;

use super::{KeyValue, Store};
use crate::error::Result;

/// Embedded ordered store
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl Store for SledStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KeyValue>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, value) = item?;
            out.push(KeyValue {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(out)
    }
}
