//! Health Monitor
//!
//! Periodically probes every registered slave and evicts the ones that
//! stay unresponsive. A probe only counts as alive when the slave answers
//! success *and* echoes back the probed id, so an unrelated process that
//! took over the address does not pass.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::registry::{SlaveEntry, SlaveRegistry};
use crate::error::{Error, Result};
use crate::retry::retry;

/// Body returned by a slave's `/health` endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub id: Uuid,
}

/// Master-side liveness prober
pub struct HealthMonitor {
    registry: Arc<SlaveRegistry>,
    client: reqwest::Client,
    interval: Duration,
    retries: u32,
    backoff: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<SlaveRegistry>,
        interval: Duration,
        retries: u32,
        backoff: Duration,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            registry,
            client,
            interval,
            retries,
            backoff,
        }
    }

    /// Run the monitor loop. Never returns; individual probe failures only
    /// ever evict the slave in question.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One monitor pass: probe every slave concurrently, wait for all,
    /// then evict the failures as a single batch.
    pub async fn tick(&self) {
        let slaves = self.registry.list().await;
        if slaves.is_empty() {
            return;
        }

        let probes = slaves.iter().map(|slave| async move {
            match self.probe(slave).await {
                Ok(()) => None,
                Err(e) => {
                    tracing::info!(
                        "Slave id:[{}] addr:[{}] health check failure: {}",
                        slave.id,
                        slave.address,
                        e
                    );
                    Some(slave.id)
                }
            }
        });

        let failed: Vec<Uuid> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();

        self.registry.evict(&failed).await;
    }

    /// Probe one slave with the configured retry budget
    async fn probe(&self, slave: &SlaveEntry) -> Result<()> {
        let url = format!("http://{}/health", slave.address);
        retry(self.retries, self.backoff, || {
            let client = self.client.clone();
            let url = url.clone();
            let expected = slave.id;
            async move {
                let resp = client
                    .get(&url)
                    .query(&[("id", expected.to_string())])
                    .send()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;

                if !resp.status().is_success() {
                    return Err(Error::Transport(format!("status {}", resp.status())));
                }

                let body: HealthResponse = resp
                    .json()
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
                if !body.healthy || body.id != expected {
                    return Err(Error::Transport("identity mismatch".into()));
                }
                Ok(())
            }
        })
        .await
    }
}
