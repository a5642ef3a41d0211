//! # ConfSync
//!
//! A distributed configuration store. A single master accepts pushed
//! config entries addressed by name and tags, persists them in an ordered
//! key/value store, replicates full snapshots to registered slaves over
//! HTTP, and pushes live updates to watching clients over persistent
//! authenticated TCP connections.
//!
//! ## Architecture
//!
//! - **store**: ordered key/value contract with sled-backed and in-memory
//!   implementations
//! - **cluster**: slave registry and the health monitor that evicts
//!   unresponsive members
//! - **events** / **replication**: bounded event queue and the single
//!   consumer that fans syncs out to slaves and publishes to subscribers
//! - **notify**: persistent-connection pub/sub endpoint with a framed
//!   wire protocol
//! - **watch**: client that echoes the current value, subscribes, and
//!   fails over between endpoints
//! - **api**: HTTP endpoints for push/pull, registration, sync, health
//! - **node**: assembles all of the above from one configuration file

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod notify;
pub mod replication;
pub mod retry;
pub mod store;
pub mod watch;

pub use config::{ConfSyncConfig, Role};
pub use error::{Error, Result};
pub use node::Node;
pub use watch::{WatchClient, WatchConfig};

/// Current version of ConfSync
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
