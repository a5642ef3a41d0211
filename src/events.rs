//! Replication Event Bus
//!
//! A bounded queue between the push path (producer) and the replication
//! pipeline (single consumer). Producers emit from a detached task so a
//! full queue back-pressures the emitter task, never the HTTP response
//! path, and no event is dropped.

use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Events consumed by the replication pipeline
#[derive(Debug, Clone)]
pub enum Event {
    /// Replicate the full config keyspace to every registered slave
    SyncConfig,
    /// Publish a freshly pushed value to live subscribers
    PubConfig { topic: String, payload: Vec<u8> },
}

impl Event {
    /// Event type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::SyncConfig => "SyncConfig",
            Event::PubConfig { .. } => "PubConfig",
        }
    }
}

/// Producer handle for the event queue
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
}

/// Create the bounded event queue. The receiver goes to the single
/// pipeline consumer.
pub fn channel(depth: usize) -> (EventBus, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(depth);
    (EventBus { tx }, rx)
}

impl EventBus {
    /// Emit an event, waiting for queue space if needed
    pub async fn emit(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Emit a batch from a detached task. Returns immediately; the batch
    /// lands in the queue in order, but ordering across separate calls is
    /// not guaranteed, so callers that need SyncConfig and PubConfig
    /// together emit them in one call. Each call holds its events in one
    /// spawned task until the consumer drains the queue, so a stalled
    /// consumer accumulates emitter tasks at the inbound push rate.
    pub fn emit_all_detached(&self, events: Vec<Event>) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            for event in events {
                let name = event.type_name();
                if tx.send(event).await.is_err() {
                    tracing::warn!("Event queue closed, dropping {}", name);
                    return;
                }
            }
        });
    }
}
