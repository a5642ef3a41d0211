//! Event Pipeline
//!
//! Dedicated consumer of the replication event queue. `SyncConfig`
//! snapshots the whole config keyspace and fans it out to every
//! registered slave; `PubConfig` pushes the new value to live
//! subscribers. Per-slave failures are logged and never block the rest
//! of the fan-out or the loop itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{ConfigEntry, SyncRequest};
use crate::cluster::{SlaveEntry, SlaveRegistry};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::notify::NotifyHub;
use crate::retry::retry;
use crate::store::{keys, Store};

/// Retry and timeout knobs for the sync fan-out
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sync_retries: u32,
    pub sync_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sync_retries: 3,
            sync_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Single consumer of the event queue (master only)
pub struct EventPipeline {
    store: Arc<dyn Store>,
    registry: Arc<SlaveRegistry>,
    hub: Arc<NotifyHub>,
    client: reqwest::Client,
    config: PipelineConfig,
}

impl EventPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<SlaveRegistry>,
        hub: Arc<NotifyHub>,
        config: PipelineConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            store,
            registry,
            hub,
            client,
            config,
        }
    }

    /// Consume events until the queue closes
    pub async fn run(self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            tracing::debug!("Dispatching {}", event.type_name());
            self.dispatch(event).await;
        }
        tracing::info!("Event pipeline stopped");
    }

    /// Handle one event. Public so tests can drive the pipeline without
    /// the queue.
    pub async fn dispatch(&self, event: Event) {
        match event {
            Event::SyncConfig => self.dispatch_sync().await,
            Event::PubConfig { topic, payload } => {
                if let Err(e) = self.hub.publish(&topic, &payload).await {
                    tracing::info!("Publish [{}] failure: {}", topic, e);
                }
            }
        }
    }

    /// Snapshot the config keyspace and POST it to every slave
    /// concurrently, waiting for all of them before returning.
    async fn dispatch_sync(&self) {
        let request = match self.snapshot() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Sync snapshot failed: {}", e);
                return;
            }
        };

        let slaves = self.registry.list().await;
        let dispatches = slaves
            .iter()
            .map(|slave| self.sync_one(slave, &request));
        futures::future::join_all(dispatches).await;
    }

    /// Everything under `config/`, parsed back into wire entries.
    /// Unparsable keys are skipped and logged.
    fn snapshot(&self) -> Result<SyncRequest> {
        let items = self.store.scan_prefix(keys::CONFIG_PREFIX.as_bytes())?;
        let mut datum = Vec::with_capacity(items.len());
        for item in items {
            let key = String::from_utf8_lossy(&item.key).to_string();
            let Some((name, tags)) = keys::parse_config_key(&key) else {
                tracing::warn!("Skipping malformed config key: {}", key);
                continue;
            };
            datum.push(ConfigEntry {
                name,
                tags,
                body: String::from_utf8_lossy(&item.value).to_string(),
            });
        }
        Ok(SyncRequest { datum })
    }

    async fn sync_one(&self, slave: &SlaveEntry, request: &SyncRequest) {
        let url = format!("http://{}/sync", slave.address);
        let result = retry(self.config.sync_retries, self.config.sync_backoff, || {
            let client = self.client.clone();
            let url = url.clone();
            let request = request.clone();
            async move {
                let resp = client
                    .post(&url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(Error::Transport(format!("status {}", resp.status())));
                }
                Ok(())
            }
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!("Slave id:[{}] addr:[{}] sync success", slave.id, slave.address);
            }
            Err(e) => {
                tracing::info!(
                    "Slave id:[{}] addr:[{}] sync error: {}",
                    slave.id,
                    slave.address,
                    e
                );
            }
        }
    }
}
