//! Notification Server
//!
//! Accepts persistent connections, enforces the shared-secret handshake,
//! answers `Echo` from the store, and fans published payloads out to all
//! live subscribers of a topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

use super::protocol::{read_frame, write_frame, Frame};
use crate::error::{Error, Result};
use crate::store::{keys, Store};

/// Outbound queue depth per connection
const CONN_QUEUE_DEPTH: usize = 64;

type ConnId = u64;
type TopicMap = HashMap<String, HashMap<ConnId, mpsc::Sender<Frame>>>;

/// Shared pub/sub state: topic routing plus the store used to answer
/// `Echo` requests.
pub struct NotifyHub {
    store: Arc<dyn Store>,
    secret: String,
    heartbeat_deadline: Duration,
    canonical_tags: bool,
    topics: RwLock<TopicMap>,
    next_conn_id: AtomicU64,
}

impl NotifyHub {
    pub fn new(
        store: Arc<dyn Store>,
        secret: String,
        heartbeat_deadline: Duration,
        canonical_tags: bool,
    ) -> Self {
        Self {
            store,
            secret,
            heartbeat_deadline,
            canonical_tags,
            topics: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Fan a payload out to every live subscriber of `topic`.
    ///
    /// Per-subscriber failures are logged and the dead subscriber pruned;
    /// they never fail the publish itself.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let senders: Vec<(ConnId, mpsc::Sender<Frame>)> = {
            let topics = self.topics.read().await;
            match topics.get(topic) {
                Some(subs) => subs.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => return Ok(()),
            }
        };

        let mut dead = Vec::new();
        for (conn_id, tx) in senders {
            let frame = Frame::Publish {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if let Err(e) = tx.try_send(frame) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!("Subscriber {} on [{}] is slow, dropping publish", conn_id, topic);
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        dead.push(conn_id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut topics = self.topics.write().await;
            if let Some(subs) = topics.get_mut(topic) {
                for conn_id in dead {
                    subs.remove(&conn_id);
                    tracing::info!("Pruned dead subscriber {} from [{}]", conn_id, topic);
                }
            }
        }

        Ok(())
    }

    /// Number of live subscribers for a topic
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    fn alloc_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn subscribe(&self, topic: String, conn_id: ConnId, tx: mpsc::Sender<Frame>) {
        let mut topics = self.topics.write().await;
        topics.entry(topic).or_default().insert(conn_id, tx);
    }

    /// Remove a closed connection from every topic
    async fn drop_connection(&self, conn_id: ConnId) {
        let mut topics = self.topics.write().await;
        for subs in topics.values_mut() {
            subs.remove(&conn_id);
        }
        topics.retain(|_, subs| !subs.is_empty());
    }

    fn echo_value(&self, name: &str, tags: &[String]) -> Option<Vec<u8>> {
        let key = keys::config_key(name, tags, self.canonical_tags);
        match self.store.get(key.as_bytes()) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Echo read for [{}] failed: {}", key, e);
                None
            }
        }
    }
}

/// TCP acceptor for the notification endpoint
pub struct NotifyServer {
    hub: Arc<NotifyHub>,
    listener: TcpListener,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NotifyServer {
    /// Bind the endpoint. Binding eagerly lets callers learn the actual
    /// port when configured with `:0`.
    pub async fn bind(address: &str, hub: Arc<NotifyHub>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Ok(Self {
            hub,
            listener,
            shutdown,
        })
    }

    /// Actual bound address
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for stopping the accept loop
    pub fn shutdown_handle(&self) -> tokio::sync::watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Run the accept loop until shutdown is signalled
    pub async fn serve(self) -> Result<()> {
        tracing::info!("Notification server listening on {}", self.listener.local_addr()?);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let hub = Arc::clone(&self.hub);
                            let peer = addr.to_string();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(hub, socket, &peer).await {
                                    tracing::debug!("Connection from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Notification server stopped");
        Ok(())
    }
}

/// Drive one authenticated connection until it disconnects or misses its
/// heartbeat deadline.
async fn handle_connection(
    hub: Arc<NotifyHub>,
    socket: TcpStream,
    peer: &str,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();
    let deadline = hub.heartbeat_deadline;

    // Auth must be the first frame, within the same deadline.
    let first = timeout(deadline, read_frame(&mut reader))
        .await
        .map_err(|_| Error::ConnectionTimeout(peer.to_string()))??;
    match first {
        Frame::Auth { secret } if secret == hub.secret => {
            write_frame(&mut writer, &Frame::AuthOk).await?;
        }
        Frame::Auth { .. } => {
            tracing::warn!("Rejected connection from {}: bad secret", peer);
            let _ = write_frame(&mut writer, &Frame::AuthErr).await;
            return Err(Error::Authentication);
        }
        other => {
            tracing::warn!(
                "Rejected connection from {}: {} before Auth",
                peer,
                other.type_name()
            );
            return Err(Error::Authentication);
        }
    }

    let conn_id = hub.alloc_conn_id();
    let (tx, mut rx) = mpsc::channel::<Frame>(CONN_QUEUE_DEPTH);

    // Writer task: everything outbound goes through one queue so pub/sub
    // pushes and request replies never interleave mid-frame.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    let result = connection_loop(&hub, &mut reader, conn_id, &tx, deadline).await;

    hub.drop_connection(conn_id).await;
    drop(tx);
    let _ = writer_task.await;
    result
}

async fn connection_loop(
    hub: &Arc<NotifyHub>,
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    conn_id: ConnId,
    tx: &mpsc::Sender<Frame>,
    deadline: Duration,
) -> Result<()> {
    loop {
        let frame = match timeout(deadline, read_frame(reader)).await {
            // Missed heartbeat deadline: dead subscriber
            Err(_) => {
                tracing::info!("Connection {} missed heartbeat deadline", conn_id);
                return Ok(());
            }
            Ok(Err(Error::Io(ref e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(frame)) => frame,
        };

        match frame {
            Frame::Echo { name, tags } => {
                let payload = hub.echo_value(&name, &tags);
                if tx.send(Frame::EchoReply { payload }).await.is_err() {
                    return Ok(());
                }
            }
            Frame::Subscribe { topic } => {
                hub.subscribe(topic.clone(), conn_id, tx.clone()).await;
                tracing::debug!("Connection {} subscribed to [{}]", conn_id, topic);
                if tx.send(Frame::SubAck).await.is_err() {
                    return Ok(());
                }
            }
            Frame::Heartbeat => {
                if tx.send(Frame::HeartbeatAck).await.is_err() {
                    return Ok(());
                }
            }
            // Already authenticated; a repeat handshake is harmless
            Frame::Auth { .. } => {
                if tx.send(Frame::AuthOk).await.is_err() {
                    return Ok(());
                }
            }
            other => {
                tracing::warn!(
                    "Unexpected {} from connection {}",
                    other.type_name(),
                    conn_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn start_server(store: Arc<dyn Store>, secret: &str) -> (Arc<NotifyHub>, String) {
        let hub = Arc::new(NotifyHub::new(
            store,
            secret.to_string(),
            Duration::from_secs(5),
            false,
        ));
        let server = NotifyServer::bind("127.0.0.1:0", Arc::clone(&hub)).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(server.serve());
        (hub, addr)
    }

    async fn connect_and_auth(addr: &str, secret: &str) -> TcpStream {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut socket,
            &Frame::Auth {
                secret: secret.to_string(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(read_frame(&mut socket).await.unwrap(), Frame::AuthOk));
        socket
    }

    #[tokio::test]
    async fn test_bad_secret_rejected() {
        let (_hub, addr) = start_server(Arc::new(MemoryStore::new()), "right").await;

        let mut socket = TcpStream::connect(&addr).await.unwrap();
        write_frame(
            &mut socket,
            &Frame::Auth {
                secret: "wrong".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(read_frame(&mut socket).await.unwrap(), Frame::AuthErr));
    }

    #[tokio::test]
    async fn test_echo_returns_current_value() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.put(b"config/app/env:prod", b"v1").unwrap();
        let (_hub, addr) = start_server(Arc::clone(&store), "s").await;

        let mut socket = connect_and_auth(&addr, "s").await;
        write_frame(
            &mut socket,
            &Frame::Echo {
                name: "app".into(),
                tags: vec!["env:prod".into()],
            },
        )
        .await
        .unwrap();

        match read_frame(&mut socket).await.unwrap() {
            Frame::EchoReply { payload } => assert_eq!(payload, Some(b"v1".to_vec())),
            other => panic!("wrong frame: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_echo_absent_key_is_none() {
        let (_hub, addr) = start_server(Arc::new(MemoryStore::new()), "s").await;

        let mut socket = connect_and_auth(&addr, "s").await;
        write_frame(
            &mut socket,
            &Frame::Echo {
                name: "missing".into(),
                tags: vec![],
            },
        )
        .await
        .unwrap();

        match read_frame(&mut socket).await.unwrap() {
            Frame::EchoReply { payload } => assert!(payload.is_none()),
            other => panic!("wrong frame: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_only_after_subscribe() {
        let (hub, addr) = start_server(Arc::new(MemoryStore::new()), "s").await;

        // Published before anyone subscribes: delivered to nobody.
        hub.publish("config/app/a", b"early").await.unwrap();

        let mut socket = connect_and_auth(&addr, "s").await;
        write_frame(
            &mut socket,
            &Frame::Subscribe {
                topic: "config/app/a".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(read_frame(&mut socket).await.unwrap(), Frame::SubAck));

        hub.publish("config/app/a", b"late").await.unwrap();

        match read_frame(&mut socket).await.unwrap() {
            Frame::Publish { topic, payload } => {
                assert_eq!(topic, "config/app/a");
                assert_eq!(payload, b"late");
            }
            other => panic!("wrong frame: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_is_pruned() {
        let (hub, addr) = start_server(Arc::new(MemoryStore::new()), "s").await;

        let mut socket = connect_and_auth(&addr, "s").await;
        write_frame(
            &mut socket,
            &Frame::Subscribe {
                topic: "config/t/x".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(read_frame(&mut socket).await.unwrap(), Frame::SubAck));
        assert_eq!(hub.subscriber_count("config/t/x").await, 1);

        drop(socket);
        // The server notices the closed socket and drops the subscription.
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.subscriber_count("config/t/x").await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber was not pruned");
    }
}
