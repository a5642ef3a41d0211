//! Node Assembly
//!
//! Wires a validated configuration into a running process: store,
//! registry, event pipeline, health monitor, notification endpoint, and
//! the HTTP API. Masters additionally run the replication side; slaves
//! register themselves with the master on boot and unregister on
//! shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{self, AppState, RegisterRequest};
use crate::cluster::{HealthMonitor, NodeMeta, SlaveRegistry};
use crate::config::{ConfSyncConfig, Role};
use crate::error::{Error, Result};
use crate::events;
use crate::notify::{NotifyHub, NotifyServer};
use crate::replication::{EventPipeline, PipelineConfig};
use crate::retry::retry;
use crate::store::{MemoryStore, SledStore, Store};

/// A running node. Dropping it does not stop the process; call
/// [`Node::shutdown`] for an orderly stop.
pub struct Node {
    meta: NodeMeta,
    config: ConfSyncConfig,
    http_addr: SocketAddr,
    notify_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    notify_shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Build and start every component. Returns once all listeners are
    /// bound and background loops are running.
    pub async fn start(config: ConfSyncConfig) -> Result<Self> {
        config.validate()?;

        let store = open_store(&config)?;

        // Bind eagerly so a `:0` port in config (tests) resolves before
        // the address is advertised anywhere.
        let http_listener = tokio::net::TcpListener::bind(&config.node.bind_address).await?;
        let http_addr = http_listener.local_addr()?;

        let mut meta = NodeMeta::from_config(&config);
        if config.node.advertise_address.is_none() {
            meta.advertise_addr = http_addr.to_string();
        }
        tracing::info!(
            "Starting {} node id:[{}] on {}",
            meta.role,
            meta.id,
            http_addr
        );

        let hub = Arc::new(NotifyHub::new(
            Arc::clone(&store),
            config.notify.secret.clone(),
            config.heartbeat_deadline(),
            config.node.canonical_tags,
        ));
        let notify_server = NotifyServer::bind(&config.notify_bind_address()?, hub.clone()).await?;
        let notify_addr = notify_server.local_addr()?;
        let notify_shutdown = notify_server.shutdown_handle();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = notify_server.serve().await {
                tracing::error!("Notification server error: {}", e);
            }
        }));

        let (registry, bus) = match meta.role {
            Role::Master => {
                let registry = Arc::new(SlaveRegistry::new(Arc::clone(&store)));
                registry.load_from_store().await?;

                let (bus, rx) = events::channel(config.cluster.event_queue_depth);
                let pipeline = EventPipeline::new(
                    Arc::clone(&store),
                    Arc::clone(&registry),
                    Arc::clone(&hub),
                    PipelineConfig {
                        sync_retries: config.cluster.sync_retries,
                        sync_backoff: config.sync_backoff(),
                        request_timeout: config.request_timeout(),
                    },
                );
                tasks.push(tokio::spawn(pipeline.run(rx)));

                let monitor = Arc::new(HealthMonitor::new(
                    Arc::clone(&registry),
                    config.health_interval(),
                    config.cluster.probe_retries,
                    config.probe_backoff(),
                    config.request_timeout(),
                ));
                tasks.push(tokio::spawn(monitor.run()));

                (Some(registry), Some(bus))
            }
            Role::Slave => (None, None),
        };

        let state = Arc::new(AppState {
            meta: meta.clone(),
            store,
            registry,
            bus,
            hub: Some(hub),
            canonical_tags: config.node.canonical_tags,
        });

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        tasks.push(tokio::spawn(async move {
            let wait = async move {
                // Channel closure counts as shutdown too.
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            };
            if let Err(e) = api::serve(http_listener, state, wait).await {
                tracing::error!("HTTP server error: {}", e);
            }
        }));

        if meta.role == Role::Slave {
            register_with_master(&config, &meta).await?;
        }

        Ok(Self {
            meta,
            config,
            http_addr,
            notify_addr,
            shutdown,
            notify_shutdown,
            tasks,
        })
    }

    pub fn id(&self) -> Uuid {
        self.meta.id
    }

    pub fn role(&self) -> Role {
        self.meta.role
    }

    /// Actual HTTP endpoint address
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Actual notification endpoint address
    pub fn notify_addr(&self) -> SocketAddr {
        self.notify_addr
    }

    /// Stop every component. Slaves tell the master first so it does not
    /// have to wait for the health monitor to notice.
    pub async fn shutdown(self) {
        if self.meta.role == Role::Slave {
            if let Err(e) = unregister_from_master(&self.config, &self.meta).await {
                tracing::warn!("Unregister on shutdown failed: {}", e);
            }
        }

        let _ = self.shutdown.send(true);
        let _ = self.notify_shutdown.send(true);
        for task in self.tasks {
            task.abort();
        }
        tracing::info!("Node id:[{}] stopped", self.meta.id);
    }
}

fn open_store(config: &ConfSyncConfig) -> Result<Arc<dyn Store>> {
    if config.node.ephemeral {
        tracing::info!("Using ephemeral in-memory store");
        Ok(Arc::new(MemoryStore::new()))
    } else {
        tracing::info!("Opening store at {}", config.node.data_dir.display());
        Ok(Arc::new(SledStore::open(&config.node.data_dir)?))
    }
}

fn registration_body(meta: &NodeMeta) -> RegisterRequest {
    RegisterRequest {
        id: meta.id,
        addr: meta.advertise_addr.clone(),
        role: meta.role.to_string(),
    }
}

/// Announce this slave to the master. Boot fails if the master stays
/// unreachable past the retry budget.
async fn register_with_master(config: &ConfSyncConfig, meta: &NodeMeta) -> Result<()> {
    let master = meta
        .master_addr
        .as_deref()
        .ok_or_else(|| Error::Config("cluster.master_address is required for slave nodes".into()))?;
    let url = format!("http://{}/register", master);
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .unwrap_or_default();
    let body = registration_body(meta);

    retry(config.cluster.sync_retries, config.sync_backoff(), || {
        let client = client.clone();
        let url = url.clone();
        let body = serde_json::json!({
            "id": body.id,
            "addr": body.addr,
            "role": body.role,
        });
        async move {
            let resp = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
            if !resp.status().is_success() {
                return Err(Error::Transport(format!("status {}", resp.status())));
            }
            Ok(())
        }
    })
    .await?;

    tracing::info!("Registered with master at {}", master);
    Ok(())
}

/// Best-effort single attempt; the health monitor cleans up if it fails.
async fn unregister_from_master(config: &ConfSyncConfig, meta: &NodeMeta) -> Result<()> {
    let master = meta
        .master_addr
        .as_deref()
        .ok_or_else(|| Error::Config("no master address".into()))?;
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()
        .unwrap_or_default();
    let body = registration_body(meta);

    let resp = client
        .post(format!("http://{}/unregister", master))
        .json(&serde_json::json!({
            "id": body.id,
            "addr": body.addr,
            "role": body.role,
        }))
        .send()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(Error::Transport(format!("status {}", resp.status())));
    }
    tracing::info!("Unregistered from master at {}", master);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, LoggingConfig, NodeConfig, NotifyConfig};

    fn node_config(role: Role, master: Option<String>) -> ConfSyncConfig {
        ConfSyncConfig {
            node: NodeConfig {
                role,
                bind_address: "127.0.0.1:0".into(),
                advertise_address: None,
                data_dir: std::path::PathBuf::from("/unused"),
                ephemeral: true,
                canonical_tags: false,
            },
            cluster: ClusterConfig {
                master_address: master,
                sync_backoff_secs: 0,
                probe_backoff_secs: 0,
                ..ClusterConfig::default()
            },
            notify: NotifyConfig {
                bind_address: Some("127.0.0.1:0".into()),
                secret: "s3cr3t".into(),
                heartbeat_secs: 30,
            },
            logging: LoggingConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_master_starts_and_serves_pull() {
        let master = Node::start(node_config(Role::Master, None)).await.unwrap();
        let addr = master.http_addr();

        let client = reqwest::Client::new();
        client
            .post(format!("http://{}/push", addr))
            .json(&serde_json::json!({"name": "n", "tags": ["t"], "body": "v"}))
            .send()
            .await
            .unwrap();

        let resp = client
            .post(format!("http://{}/pull", addr))
            .json(&serde_json::json!({"name": "n", "tags": ["t"]}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());

        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_slave_registers_and_unregisters() {
        let master = Node::start(node_config(Role::Master, None)).await.unwrap();
        let master_addr = master.http_addr().to_string();

        let slave = Node::start(node_config(Role::Slave, Some(master_addr.clone())))
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{}/slaves", master_addr))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["slaves"].as_array().unwrap().len(), 1);

        slave.shutdown().await;

        let resp = client
            .get(format!("http://{}/slaves", master_addr))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["slaves"].as_array().unwrap().is_empty());

        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_slave_boot_fails_without_master() {
        // Nothing listens here; registration exhausts its retries.
        let mut config = node_config(Role::Slave, Some("127.0.0.1:1".into()));
        config.cluster.sync_retries = 1;
        config.cluster.request_timeout_secs = 1;
        assert!(Node::start(config).await.is_err());
    }
}
