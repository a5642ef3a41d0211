//! Replication Module
//!
//! The single-consumer pipeline that turns pushed configs into slave
//! syncs and subscriber notifications, plus the sync payload types shared
//! with the HTTP layer.

mod pipeline;

pub use pipeline::{EventPipeline, PipelineConfig};

use serde::{Deserialize, Serialize};

/// One config entry as carried on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    pub tags: Vec<String>,
    pub body: String,
}

/// Full-snapshot sync payload POSTed to every slave's `/sync`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub datum: Vec<ConfigEntry>,
}
