//! Watching Client
//!
//! Connects to one of a configured set of notification endpoints, fetches
//! the current value for its config key, subscribes to subsequent
//! changes, and fails over to another endpoint when the connection drops.
//! Callers read one contiguous stream and never see reconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::notify::{read_frame, write_frame, Frame};
use crate::store::keys;

/// Delivery channel depth; a full channel back-pressures the client's
/// reader task, not the socket.
const DELIVERY_DEPTH: usize = 5;

/// Connection state of a watching client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
}

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_DISCONNECTED: u8 = 2;

/// Watching client configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Notification endpoints; failover requires at least two
    pub endpoints: Vec<String>,
    /// Shared secret for the connection handshake
    pub secret: String,
    /// Config entry name
    pub name: String,
    /// Config entry tags, in the order used when pushing
    pub tags: Vec<String>,
    /// Sort tags when deriving the key/topic (must match the server)
    pub canonical_tags: bool,
    /// Timeout for connect and the handshake round trips
    pub connect_timeout: Duration,
    /// Fixed backoff between reconnect attempts
    pub reconnect_backoff: Duration,
    /// Interval between client heartbeats
    pub heartbeat_interval: Duration,
}

impl WatchConfig {
    pub fn new(endpoints: Vec<String>, secret: String, name: String, tags: Vec<String>) -> Self {
        Self {
            endpoints,
            secret,
            name,
            tags,
            canonical_tags: false,
            connect_timeout: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.endpoints.len() < 2 {
            return Err(Error::Config(
                "watch requires at least two endpoints for failover".into(),
            ));
        }
        if self.name.is_empty() {
            return Err(Error::Config("watch config name cannot be empty".into()));
        }
        if self.secret.is_empty() {
            return Err(Error::Config("watch secret cannot be empty".into()));
        }
        Ok(())
    }
}

struct ClientShared {
    config: WatchConfig,
    topic: String,
    delivery_tx: mpsc::Sender<Vec<u8>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    current: AtomicUsize,
    /// Close signal. The reader and heartbeat tasks select on it so
    /// `close()` stops them promptly instead of waiting for the peer.
    closed: watch::Sender<bool>,
    subscribed: AtomicBool,
    state: AtomicU8,
    /// Bumped on every successful (re)connect; stale reader and heartbeat
    /// tasks from a previous connection check it and exit quietly.
    generation: AtomicU64,
}

/// Client that watches a single `(name, tags)` config entry
pub struct WatchClient {
    shared: Arc<ClientShared>,
    delivery_rx: mpsc::Receiver<Vec<u8>>,
}

impl WatchClient {
    /// Connect to the first endpoint, authenticate, and fetch the current
    /// value. The value arrives on the delivery channel returned by
    /// [`watch`](Self::watch); if the initial fetch finds no entry,
    /// nothing is delivered until the first publish.
    pub async fn connect(config: WatchConfig) -> Result<Self> {
        config.validate()?;

        let topic = keys::topic(&config.name, &config.tags, config.canonical_tags);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_DEPTH);
        let shared = Arc::new(ClientShared {
            config,
            topic,
            delivery_tx,
            writer: Mutex::new(None),
            current: AtomicUsize::new(0),
            closed: watch::channel(false).0,
            subscribed: AtomicBool::new(false),
            state: AtomicU8::new(STATE_CONNECTING),
            generation: AtomicU64::new(0),
        });

        shared.establish(0).await?;
        shared.send_echo().await?;

        Ok(Self {
            shared,
            delivery_rx,
        })
    }

    /// Issue a fresh echo and (re)subscribe, then hand back the long-lived
    /// delivery channel. Safe to call repeatedly.
    pub async fn watch(&mut self) -> Result<&mut mpsc::Receiver<Vec<u8>>> {
        self.shared.subscribed.store(true, Ordering::SeqCst);
        // Best effort while disconnected: the failover path re-issues both
        // once a connection is back.
        if let Err(e) = self.shared.send_echo().await {
            tracing::debug!("Watch echo deferred: {}", e);
        }
        if let Err(e) = self.shared.send_subscribe().await {
            tracing::debug!("Watch subscribe deferred: {}", e);
        }
        Ok(&mut self.delivery_rx)
    }

    /// Current connection state
    pub fn state(&self) -> ConnState {
        self.shared.conn_state()
    }

    /// Suppress failover and tear down the connection. No further values
    /// are delivered.
    pub async fn close(&self) {
        let _ = self.shared.closed.send(true);
        self.shared.set_state(ConnState::Disconnected);
        let mut writer = self.shared.writer.lock().await;
        *writer = None;
    }
}

impl ClientShared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn conn_state(&self) -> ConnState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTED => ConnState::Connected,
            STATE_DISCONNECTED => ConnState::Disconnected,
            _ => ConnState::Connecting,
        }
    }

    fn set_state(&self, state: ConnState) {
        let value = match state {
            ConnState::Connecting => STATE_CONNECTING,
            ConnState::Connected => STATE_CONNECTED,
            ConnState::Disconnected => STATE_DISCONNECTED,
        };
        self.state.store(value, Ordering::SeqCst);
    }

    /// Connect to `endpoints[index]`, authenticate, and install the new
    /// connection: writer handle, reader task, heartbeat task.
    async fn establish(self: &Arc<Self>, index: usize) -> Result<()> {
        self.set_state(ConnState::Connecting);
        let endpoint = &self.config.endpoints[index];

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::ConnectionTimeout(endpoint.clone()))?
            .map_err(|e| Error::ConnectionFailed {
                address: endpoint.clone(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &Frame::Auth {
                secret: self.config.secret.clone(),
            },
        )
        .await?;
        let reply = timeout(self.config.connect_timeout, read_frame(&mut reader))
            .await
            .map_err(|_| Error::ConnectionTimeout(endpoint.clone()))??;
        match reply {
            Frame::AuthOk => {}
            Frame::AuthErr => return Err(Error::Authentication),
            other => {
                return Err(Error::Transport(format!(
                    "unexpected {} during handshake",
                    other.type_name()
                )))
            }
        }

        self.current.store(index, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(writer);
        self.set_state(ConnState::Connected);
        tracing::info!("Connected to notification endpoint {}", endpoint);

        self.spawn_reader(reader, generation);
        self.spawn_heartbeat(generation);
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, mut reader: OwnedReadHalf, generation: u64) {
        let shared = Arc::clone(self);
        let mut closed_rx = self.closed.subscribe();
        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    result = read_frame(&mut reader) => result,
                    _ = closed_rx.wait_for(|closed| *closed) => return,
                };
                // A frame that raced close() must not be delivered.
                if shared.is_closed() {
                    return;
                }
                match result {
                    Ok(Frame::Publish { payload, .. }) => {
                        if shared.delivery_tx.send(payload).await.is_err() {
                            return;
                        }
                    }
                    Ok(Frame::EchoReply { payload }) => {
                        if let Some(payload) = payload {
                            if shared.delivery_tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Frame::SubAck) | Ok(Frame::HeartbeatAck) | Ok(Frame::AuthOk) => {}
                    Ok(other) => {
                        tracing::debug!("Ignoring {} frame", other.type_name());
                    }
                    Err(_) => {
                        shared.on_disconnect(generation).await;
                        return;
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>, generation: u64) {
        let shared = Arc::clone(self);
        let mut closed_rx = self.closed.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = closed_rx.wait_for(|closed| *closed) => return,
                }
                if shared.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                // A write failure here is detected by the reader task.
                let _ = shared.send_frame(Frame::Heartbeat).await;
            }
        });
    }

    /// Reader-task disconnect notification. Stale generations are ignored
    /// so one dropped connection triggers exactly one failover.
    async fn on_disconnect(self: &Arc<Self>, generation: u64) {
        if self.is_closed() || self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.set_state(ConnState::Disconnected);
        *self.writer.lock().await = None;

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.failover().await;
        });
    }

    /// Pick a different endpoint uniformly at random and retry the full
    /// connect sequence with fixed backoff, effectively forever. A
    /// rejected authentication stops the loop; the server will not accept
    /// this secret on retry either.
    async fn failover(self: Arc<Self>) {
        let next = self.pick_other_endpoint();
        tracing::info!(
            "Connection lost, failing over to {}",
            self.config.endpoints[next]
        );

        loop {
            if self.is_closed() || self.delivery_tx.is_closed() {
                return;
            }
            match self.establish(next).await {
                Ok(()) => break,
                Err(Error::Authentication) => {
                    tracing::error!("Reconnect authentication rejected, giving up");
                    return;
                }
                Err(e) => {
                    tracing::debug!(
                        "Reconnect to {} failed: {}",
                        self.config.endpoints[next],
                        e
                    );
                    tokio::time::sleep(self.config.reconnect_backoff).await;
                }
            }
        }

        // Same sequence a fresh connection runs: echo for the current
        // value, then resume the subscription.
        if let Err(e) = self.send_echo().await {
            tracing::warn!("Post-reconnect echo failed: {}", e);
        }
        if self.subscribed.load(Ordering::SeqCst) {
            if let Err(e) = self.send_subscribe().await {
                tracing::warn!("Post-reconnect subscribe failed: {}", e);
            }
        }
    }

    /// Uniform choice from `endpoints \ {current}`
    fn pick_other_endpoint(&self) -> usize {
        let len = self.config.endpoints.len();
        let current = self.current.load(Ordering::SeqCst);
        let mut index = rand::thread_rng().gen_range(0..len - 1);
        if index >= current {
            index += 1;
        }
        index
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => write_frame(w, &frame).await,
            None => Err(Error::Transport("not connected".into())),
        }
    }

    async fn send_echo(&self) -> Result<()> {
        self.send_frame(Frame::Echo {
            name: self.config.name.clone(),
            tags: self.config.tags.clone(),
        })
        .await
    }

    async fn send_subscribe(&self) -> Result<()> {
        self.send_frame(Frame::Subscribe {
            topic: self.topic.clone(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NotifyHub, NotifyServer};
    use crate::store::{MemoryStore, Store};

    const SECRET: &str = "test-secret";

    async fn start_hub(initial: Option<(&str, &[u8])>) -> (Arc<NotifyHub>, String) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        if let Some((key, value)) = initial {
            store.put(key.as_bytes(), value).unwrap();
        }
        let hub = Arc::new(NotifyHub::new(
            store,
            SECRET.to_string(),
            Duration::from_secs(30),
            false,
        ));
        let server = NotifyServer::bind("127.0.0.1:0", Arc::clone(&hub))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(server.serve());
        (hub, addr)
    }

    fn config(endpoints: Vec<String>) -> WatchConfig {
        let mut cfg = WatchConfig::new(
            endpoints,
            SECRET.to_string(),
            "app".to_string(),
            vec!["env:prod".to_string()],
        );
        cfg.reconnect_backoff = Duration::from_millis(20);
        cfg.heartbeat_interval = Duration::from_millis(200);
        cfg.connect_timeout = Duration::from_secs(2);
        cfg
    }

    async fn wait_for_subscriber(hub: &NotifyHub, topic: &str) {
        timeout(Duration::from_secs(2), async {
            while hub.subscriber_count(topic).await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription never registered");
    }

    #[tokio::test]
    async fn test_single_endpoint_is_config_error() {
        let cfg = WatchConfig::new(
            vec!["127.0.0.1:1".into()],
            SECRET.into(),
            "app".into(),
            vec![],
        );
        match WatchClient::connect(cfg).await {
            Err(Error::Config(_)) => {}
            other => panic!("expected config error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_bad_secret_not_retried() {
        let (_hub, addr) = start_hub(None).await;
        let (_hub2, addr2) = start_hub(None).await;
        let mut cfg = config(vec![addr, addr2]);
        cfg.secret = "wrong".to_string();

        match WatchClient::connect(cfg).await {
            Err(Error::Authentication) => {}
            other => panic!("expected auth error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_initial_value_then_updates() {
        let topic = "config/app/env:prod";
        let (hub, addr) = start_hub(Some((topic, b"v1"))).await;
        let (_other, addr2) = start_hub(None).await;

        let mut client = WatchClient::connect(config(vec![addr, addr2])).await.unwrap();
        let rx = client.watch().await.unwrap();

        // Initial value from the connect-time echo.
        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, b"v1");
        // watch() issued another echo; same value again.
        let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(second, b"v1");

        wait_for_subscriber(&hub, topic).await;
        hub.publish(topic, b"v2").await.unwrap();

        let update = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(update, b"v2");
        assert_eq!(client.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn test_failover_to_other_endpoint() {
        let topic = "config/app/env:prod";

        // First endpoint: a hand-rolled server that completes the
        // handshake, answers frames, then drops the connection.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let flaky_addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                let frame = match read_frame(&mut socket).await {
                    Ok(f) => f,
                    Err(_) => return,
                };
                match frame {
                    Frame::Auth { .. } => {
                        write_frame(&mut socket, &Frame::AuthOk).await.unwrap();
                    }
                    Frame::Echo { .. } => {
                        write_frame(&mut socket, &Frame::EchoReply { payload: None })
                            .await
                            .unwrap();
                    }
                    Frame::Subscribe { .. } => {
                        // Ack, then kill the connection.
                        let _ = write_frame(&mut socket, &Frame::SubAck).await;
                        return;
                    }
                    _ => {}
                }
            }
        });

        let (hub2, addr2) = start_hub(Some((topic, b"v2"))).await;

        let mut client = WatchClient::connect(config(vec![flaky_addr, addr2.clone()]))
            .await
            .unwrap();
        let rx = client.watch().await.unwrap();

        // After the flaky endpoint drops, the client must reach the other
        // endpoint, re-echo (delivering "v2") and re-subscribe, with no
        // action from us.
        let value = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(value, b"v2");

        wait_for_subscriber(&hub2, topic).await;
        hub2.publish(topic, b"v3").await.unwrap();
        let update = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(update, b"v3");
        assert_eq!(client.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn test_close_stops_delivery_and_failover() {
        let topic = "config/app/env:prod";
        let (hub, addr) = start_hub(Some((topic, b"v1"))).await;
        let (_other, addr2) = start_hub(None).await;

        let mut client = WatchClient::connect(config(vec![addr, addr2])).await.unwrap();
        {
            let rx = client.watch().await.unwrap();
            // Drain the echo deliveries.
            timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        }
        wait_for_subscriber(&hub, topic).await;

        client.close().await;
        // Publish with no grace period: the server has not yet seen the
        // connection go away, so the frame can still reach the client's
        // reader. It must not surface on the delivery channel.
        hub.publish(topic, b"after-close").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(client.state(), ConnState::Disconnected);
        assert!(client.delivery_rx.try_recv().is_err());
    }
}
