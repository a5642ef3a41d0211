//! Cluster Module
//!
//! Master-side membership: the slave registry and the health monitor
//! that evicts unresponsive slaves.

mod health;
mod registry;

pub use health::{HealthMonitor, HealthResponse};
pub use registry::{SlaveEntry, SlaveRegistry};

use uuid::Uuid;

use crate::config::{ConfSyncConfig, Role};

/// Identity of this process. Created once at startup, never mutated.
#[derive(Debug, Clone)]
pub struct NodeMeta {
    /// Globally unique id, generated at process start
    pub id: Uuid,
    /// Master or slave
    pub role: Role,
    /// Address the HTTP endpoint binds to
    pub local_addr: String,
    /// Address other nodes reach this one at
    pub advertise_addr: String,
    /// Master address (slaves only)
    pub master_addr: Option<String>,
}

impl NodeMeta {
    /// Build the process identity from validated configuration
    pub fn from_config(config: &ConfSyncConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: config.node.role,
            local_addr: config.node.bind_address.clone(),
            advertise_addr: config.advertise_address().to_string(),
            master_addr: config.cluster.master_address.clone(),
        }
    }
}
