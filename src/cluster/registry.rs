//! Slave Registry
//!
//! Authoritative, master-side list of registered slaves. The in-memory
//! list is rebuilt from the store at boot so a master restart does not
//! lose its membership.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{keys, Store};

/// A registered slave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveEntry {
    /// Slave node id
    pub id: Uuid,
    /// Address the master reaches the slave at
    pub address: String,
    /// When the registration was accepted
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

/// Master-side membership registry.
///
/// Every read and mutation of the in-memory list goes through one mutex;
/// callers only ever see snapshot copies.
pub struct SlaveRegistry {
    store: Arc<dyn Store>,
    slaves: Mutex<Vec<SlaveEntry>>,
}

impl SlaveRegistry {
    /// Create an empty registry over `store`
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            slaves: Mutex::new(Vec::new()),
        }
    }

    /// Register a slave: persist `slave/{id}` first, then append to the
    /// in-memory list. On a store failure nothing is added to memory, so
    /// the two views cannot diverge on the write path. Re-registering a
    /// known id refreshes its address in place.
    pub async fn register(&self, id: Uuid, address: String) -> Result<()> {
        self.store
            .put(keys::slave_key(&id).as_bytes(), address.as_bytes())
            .map_err(|e| Error::Persistence(format!("persist slave {}: {}", id, e)))?;

        let mut slaves = self.slaves.lock().await;
        if let Some(existing) = slaves.iter_mut().find(|s| s.id == id) {
            existing.address = address.clone();
        } else {
            slaves.push(SlaveEntry {
                id,
                address: address.clone(),
                registered_at: chrono::Utc::now(),
            });
        }
        tracing::info!("Slave id:[{}] addr:[{}] online", id, address);
        Ok(())
    }

    /// Unregister a slave. Unknown ids are a no-op, not an error. Removal
    /// is order-preserving so fan-out iteration stays stable.
    pub async fn unregister(&self, id: Uuid) -> Result<()> {
        let mut slaves = self.slaves.lock().await;
        let Some(index) = slaves.iter().position(|s| s.id == id) else {
            return Ok(());
        };

        self.store
            .delete(keys::slave_key(&id).as_bytes())
            .map_err(|e| Error::Persistence(format!("delete slave {}: {}", id, e)))?;
        let entry = slaves.remove(index);
        tracing::info!("Slave id:[{}] addr:[{}] offline", entry.id, entry.address);
        Ok(())
    }

    /// Snapshot of the current list
    pub async fn list(&self) -> Vec<SlaveEntry> {
        self.slaves.lock().await.clone()
    }

    /// Number of registered slaves
    pub async fn len(&self) -> usize {
        self.slaves.lock().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.slaves.lock().await.is_empty()
    }

    /// Rebuild the in-memory list from the `slave/` prefix at boot.
    /// Malformed keys or values are logged and skipped; a failing scan is
    /// fatal to the caller.
    pub async fn load_from_store(&self) -> Result<()> {
        let items = self
            .store
            .scan_prefix(keys::SLAVE_PREFIX.as_bytes())
            .map_err(|e| Error::Persistence(format!("load slaves: {}", e)))?;

        let mut slaves = self.slaves.lock().await;
        for item in items {
            let key = String::from_utf8_lossy(&item.key).to_string();
            let Some(id) = keys::parse_slave_key(&key) else {
                tracing::warn!("Skipping malformed slave key: {}", key);
                continue;
            };
            let Ok(address) = String::from_utf8(item.value) else {
                tracing::warn!("Skipping slave {} with non-utf8 address", id);
                continue;
            };
            slaves.push(SlaveEntry {
                id,
                address,
                registered_at: chrono::Utc::now(),
            });
        }
        tracing::info!("Loaded {} slave(s) from store", slaves.len());
        Ok(())
    }

    /// Evict a batch of slaves detected as dead. Persisted deletes happen
    /// first (failures logged, not fatal), then the in-memory list is
    /// updated in one locked pass.
    pub async fn evict(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }

        for id in ids {
            if let Err(e) = self.store.delete(keys::slave_key(id).as_bytes()) {
                tracing::warn!("Failed to delete persisted slave {}: {}", id, e);
            }
        }

        let mut slaves = self.slaves.lock().await;
        slaves.retain(|s| {
            let dead = ids.contains(&s.id);
            if dead {
                tracing::info!("Slave id:[{}] addr:[{}] evicted", s.id, s.address);
            }
            !dead
        });
    }
}
