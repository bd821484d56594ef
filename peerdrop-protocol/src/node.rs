//! Peer Node
//!
//! [`PeerNode`] owns everything one process knows about its peers: the
//! connection registry, running transfers, received files and the liveness
//! probes. It is created once and handed to whoever needs it; there is no
//! global state.
//!
//! ## Message Flow
//!
//! ```text
//! channel stream ──reader task──┐
//! channel stream ──reader task──┼──▶ inbound queue ──▶ dispatcher task ──▶ handlers
//! channel stream ──reader task──┘
//! ```
//!
//! Every connection has a reader task that forwards decoded messages and the
//! close event into one queue. A single dispatcher drains the queue, so all
//! handler mutations happen one message at a time.

use crate::connection::{Connection, ConnectionRegistry};
use crate::events::{ConnectionEvent, EventSender, NodeEvents, Notification};
use crate::liveness::{LivenessConfig, LivenessTracker};
use crate::message::Message;
use crate::transfer::{
    OutgoingFile, ReceivedFile, ReceivedFiles, TransferHandle, TransferReceiver, TransferSender,
    TransferState, TransferTracker,
};
use crate::transport::{Channel, MessageStream, TransportFactory};
use crate::username::generate_username;
use crate::{ProtocolError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Identity and tuning of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub peer_id: String,
    pub username: String,
    pub liveness: LivenessConfig,
}

impl NodeConfig {
    /// A config for `peer_id` with a generated username
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            username: generate_username(),
            liveness: LivenessConfig::default(),
        }
    }

    /// Builder pattern: set the display name
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Builder pattern: set liveness timings
    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    /// Check identity and liveness timings
    ///
    /// # Errors
    ///
    /// `Configuration` for an empty peer id or unusable liveness timings.
    pub fn validate(&self) -> Result<()> {
        if self.peer_id.trim().is_empty() {
            return Err(ProtocolError::Configuration(
                "peer id must not be empty".to_string(),
            ));
        }
        self.liveness.validate()
    }
}

/// Snapshot of node-wide counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub connected_peers: usize,
    pub total_bytes_transferred: u64,
    pub active_transfers: usize,
    pub username: String,
    pub peer_id: String,
}

#[derive(Debug)]
enum Inbound {
    Message {
        connection_id: String,
        message: Message,
    },
    Closed {
        connection_id: String,
        generation: u64,
        reason: Option<String>,
    },
}

#[derive(Debug)]
struct Reader {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct NodeInner {
    config: NodeConfig,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<TransferTracker>,
    received: Arc<ReceivedFiles>,
    liveness: Arc<LivenessTracker>,
    sender: TransferSender,
    receiver: TransferReceiver,
    events: EventSender,
    inbound: mpsc::UnboundedSender<Inbound>,
    readers: Mutex<HashMap<String, Reader>>,
    generation: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// A peer-to-peer file sharing node
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone)]
pub struct PeerNode {
    inner: Arc<NodeInner>,
}

impl PeerNode {
    /// Create a node and start its dispatcher
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: NodeConfig, factory: Arc<dyn TransportFactory>) -> (Self, NodeEvents) {
        let (events, node_events) = EventSender::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(ConnectionRegistry::new());
        let tracker = Arc::new(TransferTracker::new());
        let received = Arc::new(ReceivedFiles::new());
        let liveness = Arc::new(LivenessTracker::new(
            config.peer_id.clone(),
            config.liveness,
            Arc::clone(&registry),
            events.clone(),
        ));
        let sender = TransferSender::new(
            config.peer_id.clone(),
            config.username.clone(),
            Arc::clone(&tracker),
            events.clone(),
        );
        let receiver = TransferReceiver::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::clone(&received),
            events.clone(),
        );

        info!(
            "Starting node {} as {} over {}",
            config.peer_id,
            config.username,
            factory.transport_type()
        );

        let inner = Arc::new(NodeInner {
            config,
            factory,
            registry,
            tracker,
            received,
            liveness,
            sender,
            receiver,
            events,
            inbound: inbound_tx,
            readers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            dispatcher: Mutex::new(None),
        });

        let dispatcher = tokio::spawn(Arc::clone(&inner).dispatch(inbound_rx));
        if let Ok(mut slot) = inner.dispatcher.try_lock() {
            *slot = Some(dispatcher);
        }

        (Self { inner }, node_events)
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.config.peer_id
    }

    pub fn username(&self) -> &str {
        &self.inner.config.username
    }

    /// Open a channel to `remote_id`
    ///
    /// # Errors
    ///
    /// `AlreadyConnected` when `remote_id` is already connected; no transport
    /// call is made in that case. Transport failures leave the record
    /// `Disconnected` and raise a "Connection Error" notification.
    pub async fn connect(&self, remote_id: &str) -> Result<()> {
        let inner = &self.inner;
        if inner.registry.is_connected(remote_id).await {
            let err = ProtocolError::AlreadyConnected(remote_id.to_string());
            inner
                .events
                .notify(Notification::error("Already Connected", err.user_message()));
            return Err(err);
        }

        info!("Connecting to {}", remote_id);
        inner.registry.upsert(Connection::connecting(remote_id)).await;

        match inner.factory.connect(remote_id).await {
            Ok(channel) => {
                inner.open(channel).await;
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", remote_id, e);
                inner.registry.mark_disconnected(remote_id).await;
                inner
                    .events
                    .notify(Notification::error("Connection Error", e.user_message()));
                Err(e)
            }
        }
    }

    /// Take over a channel opened by a remote peer
    pub async fn accept(&self, channel: Channel) {
        info!("Accepted channel from {}", channel.remote_id);
        self.inner.open(channel).await;
    }

    /// Close the channel to `remote_id`
    ///
    /// The record is `Disconnected` and its probe cancelled when this returns,
    /// whether or not the remote side ever closes its end.
    pub async fn disconnect(&self, remote_id: &str) -> Result<()> {
        let connection = self
            .inner
            .registry
            .get(remote_id)
            .await
            .filter(|c| c.is_connected())
            .ok_or_else(|| ProtocolError::NotConnected(remote_id.to_string()))?;

        info!("Disconnecting from {}", remote_id);
        let closed = match connection.sink {
            Some(sink) => sink.close().await,
            None => Ok(()),
        };
        self.inner.close_local(remote_id).await;
        closed
    }

    /// Send `file` to every connected peer among `targets`
    ///
    /// # Errors
    ///
    /// `NoEligibleTargets` when none of `targets` is connected.
    pub async fn send_file(&self, file: OutgoingFile, targets: &[String]) -> Result<TransferHandle> {
        let eligible = self.inner.registry.eligible_targets(targets).await;
        if eligible.len() < targets.len() {
            debug!(
                "Skipping {} target(s) that are not connected",
                targets.len() - eligible.len()
            );
        }

        let max = self.inner.factory.capabilities().max_message_size as u64;
        if encoded_payload_len(file.size) > max {
            warn!(
                "{} ({} bytes) will likely exceed the {} byte message limit of {}",
                file.name,
                file.size,
                max,
                self.inner.factory.transport_type()
            );
        }
        self.inner.sender.send(file, eligible).await
    }

    pub async fn connections(&self) -> Vec<Connection> {
        self.inner.registry.list().await
    }

    pub async fn connection(&self, id: &str) -> Option<Connection> {
        self.inner.registry.get(id).await
    }

    pub async fn received_files(&self) -> Vec<ReceivedFile> {
        self.inner.received.list().await
    }

    /// Write a received file into `dir`
    pub async fn save_received(&self, id: &str, dir: impl AsRef<Path>) -> Result<PathBuf> {
        self.inner.received.save(id, dir).await
    }

    pub async fn remove_received(&self, id: &str) -> Option<ReceivedFile> {
        self.inner.received.remove(id).await
    }

    pub async fn transfer_progress(&self, id: &str) -> Option<TransferState> {
        self.inner.tracker.get(id).await
    }

    pub async fn transfers(&self) -> Vec<TransferState> {
        self.inner.tracker.list().await
    }

    pub async fn stats(&self) -> NetworkStats {
        NetworkStats {
            connected_peers: self.inner.registry.connected_count().await,
            total_bytes_transferred: self.inner.registry.total_bytes(),
            active_transfers: self.inner.tracker.active_count().await,
            username: self.inner.config.username.clone(),
            peer_id: self.inner.config.peer_id.clone(),
        }
    }

    /// Close every channel and stop all background tasks
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!("Shutting down node {}", inner.config.peer_id);

        inner.liveness.stop_all().await;
        for (_, reader) in inner.readers.lock().await.drain() {
            reader.task.abort();
        }
        for connection in inner.registry.list().await {
            if let Some(sink) = &connection.sink {
                if let Err(e) = sink.close().await {
                    debug!("Closing {} failed: {}", connection.id, e);
                }
            }
            inner.registry.mark_disconnected(&connection.id).await;
        }
        if let Some(dispatcher) = inner.dispatcher.lock().await.take() {
            dispatcher.abort();
        }
    }
}

impl NodeInner {
    /// Handle an open channel: mark connected, announce, probe and read
    async fn open(self: &Arc<Self>, channel: Channel) {
        let Channel {
            remote_id,
            sink,
            stream,
        } = channel;

        self.registry.mark_connected(&remote_id, Arc::clone(&sink)).await;

        let announce = Message::Username {
            username: self.config.username.clone(),
            peer_id: self.config.peer_id.clone(),
        };
        if let Err(e) = sink.send(&announce).await {
            warn!("Could not announce username to {}: {}", remote_id, e);
        }

        self.liveness.start(&remote_id, Arc::clone(&sink)).await;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(read_loop(
            remote_id.clone(),
            generation,
            stream,
            self.inbound.clone(),
        ));
        if let Some(previous) = self
            .readers
            .lock()
            .await
            .insert(remote_id.clone(), Reader { generation, task })
        {
            previous.task.abort();
        }

        info!("Connected to {}", remote_id);
        self.events
            .notify(Notification::info("Peer Connected", format!("Connected to {}", remote_id)));
        self.events.connection(ConnectionEvent::Connected {
            connection_id: remote_id,
        });
    }

    async fn dispatch(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(event) = inbound.recv().await {
            match event {
                Inbound::Message {
                    connection_id,
                    message,
                } => self.handle_message(&connection_id, message).await,
                Inbound::Closed {
                    connection_id,
                    generation,
                    reason,
                } => self.handle_close(&connection_id, generation, reason).await,
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn handle_message(&self, connection_id: &str, message: Message) {
        debug!("{} from {}", message.kind(), connection_id);
        match message {
            Message::Username { username, .. } => {
                self.registry.set_username(connection_id, &username).await;
            }
            Message::Ping { timestamp, .. } => {
                let Some(sink) = self
                    .registry
                    .get(connection_id)
                    .await
                    .and_then(|c| c.sink)
                else {
                    return;
                };
                if let Err(e) = sink.send(&Message::Pong { timestamp }).await {
                    warn!("Could not answer ping from {}: {}", connection_id, e);
                }
            }
            Message::Pong { timestamp } => {
                self.liveness.on_pong(connection_id, timestamp).await;
            }
            Message::FileStart(start) => self.receiver.on_start(connection_id, start).await,
            Message::FileChunk(chunk) => self.receiver.on_chunk(connection_id, chunk).await,
            Message::FileComplete(complete) => {
                self.receiver.on_complete(connection_id, complete).await;
            }
            Message::Unknown => debug!("Ignoring unknown message from {}", connection_id),
        }
    }

    async fn handle_close(&self, connection_id: &str, generation: u64, reason: Option<String>) {
        {
            let mut readers = self.readers.lock().await;
            match readers.get(connection_id) {
                Some(reader) if reader.generation == generation => {
                    readers.remove(connection_id);
                }
                // A newer channel, or a local disconnect, already took over
                _ => return,
            }
        }
        self.mark_closed(connection_id, reason).await;
    }

    /// Tear down a channel this node closed itself
    ///
    /// The reader is aborted first, so its close event (if the remote ever
    /// sends one) finds no matching reader and is ignored.
    async fn close_local(&self, connection_id: &str) {
        if let Some(reader) = self.readers.lock().await.remove(connection_id) {
            reader.task.abort();
        }
        self.mark_closed(connection_id, None).await;
    }

    async fn mark_closed(&self, connection_id: &str, reason: Option<String>) {
        self.liveness.stop(connection_id).await;
        if !self.registry.mark_disconnected(connection_id).await {
            return;
        }

        match &reason {
            Some(reason) => {
                error!("Connection to {} failed: {}", connection_id, reason);
                self.events
                    .notify(Notification::error("Connection Error", reason.clone()));
            }
            None => info!("Disconnected from {}", connection_id),
        }
        self.events.notify(Notification::info(
            "Peer Disconnected",
            format!("Disconnected from {}", connection_id),
        ));
        self.events.connection(ConnectionEvent::Disconnected {
            connection_id: connection_id.to_string(),
        });
    }
}

/// Base64 length of a `file-complete` payload of `size` bytes
fn encoded_payload_len(size: u64) -> u64 {
    size.div_ceil(3).saturating_mul(4)
}

/// Forward every message of one channel into the inbound queue
async fn read_loop(
    connection_id: String,
    generation: u64,
    mut stream: Box<dyn MessageStream>,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let reason = loop {
        match stream.next_message().await {
            Some(Ok(message)) => {
                let forwarded = inbound.send(Inbound::Message {
                    connection_id: connection_id.clone(),
                    message,
                });
                if forwarded.is_err() {
                    return;
                }
            }
            Some(Err(ProtocolError::InvalidMessage(e))) => {
                warn!("Dropping malformed message from {}: {}", connection_id, e);
            }
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        }
    };

    let _ = inbound.send(Inbound::Closed {
        connection_id,
        generation,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStatus;
    use crate::transport::memory::{self, MemoryNetwork};

    fn node(network: &MemoryNetwork, id: &str) -> (PeerNode, NodeEvents) {
        PeerNode::new(
            NodeConfig::new(id).with_username(format!("{}-name", id)),
            Arc::new(network.factory(id)),
        )
    }

    async fn next_title(events: &mut NodeEvents) -> String {
        events.notifications.recv().await.unwrap().title
    }

    #[test]
    fn test_node_config_defaults() {
        let config = NodeConfig::new("me");
        assert_eq!(config.peer_id, "me");
        assert!(!config.username.is_empty());
        assert_eq!(config.liveness, LivenessConfig::default());
        assert!(config.validate().is_ok());

        assert!(matches!(
            NodeConfig::new("  ").validate(),
            Err(ProtocolError::Configuration(_))
        ));
        let zero = NodeConfig::new("me").with_liveness(LivenessConfig {
            probe_interval: std::time::Duration::ZERO,
            ..LivenessConfig::default()
        });
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_encoded_payload_len() {
        assert_eq!(encoded_payload_len(0), 0);
        assert_eq!(encoded_payload_len(3), 4);
        assert_eq!(encoded_payload_len(4), 8);
        let tcp_max = crate::transport::tcp::TCP_MAX_MESSAGE_SIZE as u64;
        assert!(encoded_payload_len(13 * 1024 * 1024) > tcp_max);
        assert_eq!(encoded_payload_len(u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_accept_announces_username() {
        let network = MemoryNetwork::new();
        let (node, mut events) = node(&network, "alice");
        let (mut raw, channel) = memory::raw_pair("bob");

        node.accept(channel).await;
        assert_eq!(next_title(&mut events).await, "Peer Connected");
        assert_eq!(
            raw.recv().await,
            Some(Message::Username {
                username: "alice-name".to_string(),
                peer_id: "alice".to_string(),
            })
        );

        raw.send(&Message::Username {
            username: "Bobby".to_string(),
            peer_id: "bob".to_string(),
        })
        .await
        .unwrap();
        raw.send(&Message::Ping {
            timestamp: 77,
            peer_id: "bob".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(raw.recv().await, Some(Message::Pong { timestamp: 77 }));
        assert_eq!(node.connection("bob").await.unwrap().username, "Bobby");
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let network = MemoryNetwork::new();
        let (node, _events) = node(&network, "alice");
        let (mut raw, channel) = memory::raw_pair("mallory");
        node.accept(channel).await;
        raw.recv().await;

        raw.send_bytes(b"{\"type\":\"file-chunk\"}\n".to_vec())
            .await
            .unwrap();
        raw.send_bytes(b"garbage\n".to_vec()).await.unwrap();
        raw.send(&Message::Ping {
            timestamp: 5,
            peer_id: "mallory".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(raw.recv().await, Some(Message::Pong { timestamp: 5 }));
        assert_eq!(
            node.connection("mallory").await.unwrap().status,
            ConnectionStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_remote_close_marks_disconnected() {
        let network = MemoryNetwork::new();
        let (node, mut events) = node(&network, "alice");
        let (raw, channel) = memory::raw_pair("bob");
        node.accept(channel).await;
        assert_eq!(next_title(&mut events).await, "Peer Connected");

        raw.close().await;
        assert_eq!(next_title(&mut events).await, "Peer Disconnected");

        let bob = node.connection("bob").await.unwrap();
        assert_eq!(bob.status, ConnectionStatus::Disconnected);
        assert!(!node.inner.liveness.is_probing("bob").await);
        assert_eq!(node.stats().await.connected_peers, 0);
    }

    #[tokio::test]
    async fn test_chunk_with_extreme_counts_keeps_dispatcher() {
        let _log = tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_test_writer()
                .finish(),
        );
        let network = MemoryNetwork::new();
        let (node, _events) = node(&network, "alice");
        let (mut raw, channel) = memory::raw_pair("mallory");
        node.accept(channel).await;
        raw.recv().await;

        raw.send(&Message::Ping {
            timestamp: 1,
            peer_id: "mallory".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(raw.recv().await, Some(Message::Pong { timestamp: 1 }));

        raw.send(&Message::FileChunk(crate::message::FileChunk {
            file_id: "file-x".to_string(),
            chunk: vec![1, 2, 3],
            chunk_index: u64::MAX - 1,
            total_chunks: u64::MAX,
            speed: 0.0,
            peer_id: "mallory".to_string(),
            peer_username: "Mallory".to_string(),
        }))
        .await
        .unwrap();
        raw.send(&Message::Ping {
            timestamp: 2,
            peer_id: "mallory".to_string(),
        })
        .await
        .unwrap();

        let pong = tokio::time::timeout(std::time::Duration::from_secs(5), raw.recv())
            .await
            .unwrap();
        assert_eq!(pong, Some(Message::Pong { timestamp: 2 }));
        assert_eq!(
            node.transfer_progress("file-x").await.unwrap().progress["mallory"],
            100
        );
        node.shutdown().await;
    }

    /// A sink whose close only shuts down the local write side
    #[derive(Debug, Default)]
    struct HalfCloseSink {
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl crate::transport::MessageSink for HalfCloseSink {
        async fn send(&self, _message: &Message) -> Result<()> {
            if !self.closed.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ProtocolError::Transport("connection closed".to_string()))
            }
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }

    /// A remote that never sends and never closes its side
    #[derive(Debug)]
    struct SilentStream;

    #[async_trait::async_trait]
    impl MessageStream for SilentStream {
        async fn next_message(&mut self) -> Option<Result<Message>> {
            std::future::pending().await
        }
    }

    fn half_open_channel(remote_id: &str) -> Channel {
        Channel {
            remote_id: remote_id.to_string(),
            sink: Arc::new(HalfCloseSink::default()),
            stream: Box::new(SilentStream),
        }
    }

    #[tokio::test]
    async fn test_disconnect_without_remote_close() {
        let network = MemoryNetwork::new();
        let (node, mut events) = node(&network, "alice");
        node.accept(half_open_channel("bob")).await;
        assert_eq!(next_title(&mut events).await, "Peer Connected");
        assert!(node.inner.liveness.is_probing("bob").await);

        node.disconnect("bob").await.unwrap();

        let bob = node.connection("bob").await.unwrap();
        assert_eq!(bob.status, ConnectionStatus::Disconnected);
        assert!(bob.sink.is_none());
        assert!(!node.inner.liveness.is_probing("bob").await);
        assert!(node.inner.readers.lock().await.is_empty());
        assert_eq!(next_title(&mut events).await, "Peer Disconnected");
        assert_eq!(
            events.connections.recv().await,
            Some(ConnectionEvent::Connected {
                connection_id: "bob".to_string()
            })
        );
        assert_eq!(
            events.connections.recv().await,
            Some(ConnectionEvent::Disconnected {
                connection_id: "bob".to_string()
            })
        );

        // A second disconnect finds nothing connected
        assert!(matches!(
            node.disconnect("bob").await,
            Err(ProtocolError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let network = MemoryNetwork::new();
        let (node, mut events) = node(&network, "alice");

        let err = node.connect("nobody").await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionRefused(_)));
        assert_eq!(next_title(&mut events).await, "Connection Error");
        assert_eq!(
            node.connection("nobody").await.unwrap().status,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_disconnect_unknown_peer() {
        let network = MemoryNetwork::new();
        let (node, _events) = node(&network, "alice");
        assert!(matches!(
            node.disconnect("ghost").await,
            Err(ProtocolError::NotConnected(_))
        ));
    }
}
