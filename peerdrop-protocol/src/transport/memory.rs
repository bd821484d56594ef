//! In-memory Transport
//!
//! Connects peers living in the same process. Frames cross the channel as
//! encoded bytes, so the newline JSON codec runs exactly as it does over TCP.
//!
//! ```rust,ignore
//! let network = MemoryNetwork::new();
//! let mut incoming = network.register("bob").await;
//! let factory = network.factory("alice");
//!
//! let channel = factory.connect("bob").await?;
//! let accepted = incoming.recv().await.unwrap();
//! assert_eq!(accepted.remote_id, "alice");
//! ```

use super::{Channel, MessageSink, MessageStream, TransportCapabilities, TransportFactory, TransportType};
use crate::{Message, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::debug;

/// Maximum encoded message size accepted by the memory transport
pub const MEMORY_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug)]
struct MemorySink {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&self, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        if bytes.len() > MEMORY_MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageSizeExceeded(
                bytes.len(),
                MEMORY_MAX_MESSAGE_SIZE,
            ));
        }
        send_frame(&self.tx, &self.closed, bytes).await
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().await.take();
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

async fn send_frame(
    tx: &Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    closed: &watch::Sender<bool>,
    bytes: Vec<u8>,
) -> Result<()> {
    if *closed.borrow() {
        return Err(ProtocolError::Transport("channel closed".to_string()));
    }
    let guard = tx.lock().await;
    match guard.as_ref() {
        Some(tx) => tx
            .send(bytes)
            .map_err(|_| ProtocolError::Transport("channel closed by peer".to_string())),
        None => Err(ProtocolError::Transport("channel closed".to_string())),
    }
}

#[derive(Debug)]
struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn next_message(&mut self) -> Option<Result<Message>> {
        let frame = tokio::select! {
            biased;
            frame = self.rx.recv() => frame,
            _ = self.closed.wait_for(|closed| *closed) => None,
        }?;
        Some(Message::from_bytes(&frame))
    }
}

/// Build two connected channel ends
///
/// The returned channels face each other: the first one's `remote_id` is
/// `b`, the second one's is `a`.
pub fn pair(a: &str, b: &str) -> (Channel, Channel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    let a_end = Channel {
        remote_id: b.to_string(),
        sink: Arc::new(MemorySink {
            tx: Mutex::new(Some(a_tx)),
            closed: closed_tx.clone(),
        }),
        stream: Box::new(MemoryStream {
            rx: a_rx,
            closed: closed_rx.clone(),
        }),
    };
    let b_end = Channel {
        remote_id: a.to_string(),
        sink: Arc::new(MemorySink {
            tx: Mutex::new(Some(b_tx)),
            closed: closed_tx,
        }),
        stream: Box::new(MemoryStream {
            rx: b_rx,
            closed: closed_rx,
        }),
    };
    (a_end, b_end)
}

/// A hand-driven channel end for exercising a peer with arbitrary frames
#[derive(Debug)]
pub struct RawPeer {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: watch::Sender<bool>,
}

impl RawPeer {
    /// Send raw bytes, bypassing the encoder
    pub async fn send_bytes(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        send_frame(&self.tx, &self.closed, bytes.into()).await
    }

    /// Encode and send a message
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_bytes(message.to_bytes()?).await
    }

    /// Receive the next decoded message; `None` once the other end closed
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let frame = self.rx.recv().await?;
            match Message::from_bytes(&frame) {
                Ok(message) => return Some(message),
                Err(e) => debug!("RawPeer dropped undecodable frame: {}", e),
            }
        }
    }

    /// Close the channel
    pub async fn close(&self) {
        self.tx.lock().await.take();
        self.closed.send_replace(true);
    }
}

/// Build a channel whose remote side is a [`RawPeer`]
///
/// `remote_id` becomes the channel's `remote_id`.
pub fn raw_pair(remote_id: &str) -> (RawPeer, Channel) {
    let (raw_tx, chan_rx) = mpsc::unbounded_channel();
    let (chan_tx, raw_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);

    let channel = Channel {
        remote_id: remote_id.to_string(),
        sink: Arc::new(MemorySink {
            tx: Mutex::new(Some(chan_tx)),
            closed: closed_tx.clone(),
        }),
        stream: Box::new(MemoryStream {
            rx: chan_rx,
            closed: closed_rx,
        }),
    };
    let raw = RawPeer {
        tx: Mutex::new(Some(raw_tx)),
        rx: raw_rx,
        closed: closed_tx,
    };
    (raw, channel)
}

/// Process-local registry of reachable peers
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Channel>>>>,
    connect_attempts: Arc<AtomicUsize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer_id` reachable; incoming channels arrive on the returned receiver
    pub async fn register(&self, peer_id: &str) -> mpsc::UnboundedReceiver<Channel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.write().await.insert(peer_id.to_string(), tx);
        rx
    }

    /// A factory that dials out as `local_id`
    pub fn factory(&self, local_id: &str) -> MemoryTransportFactory {
        MemoryTransportFactory {
            local_id: local_id.to_string(),
            network: self.clone(),
        }
    }

    /// Number of `connect` calls made through any factory of this network
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }
}

/// [`TransportFactory`] over a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryTransportFactory {
    local_id: String,
    network: MemoryNetwork,
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(&self, remote_id: &str) -> Result<Channel> {
        self.network.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let peers = self.network.peers.read().await;
        let inbox = peers.get(remote_id).ok_or_else(|| {
            ProtocolError::ConnectionRefused(format!("no peer registered as {}", remote_id))
        })?;

        let (local, remote) = pair(&self.local_id, remote_id);
        inbox.send(remote).map_err(|_| {
            ProtocolError::ConnectionRefused(format!("peer {} stopped accepting", remote_id))
        })?;

        debug!("Memory channel opened {} -> {}", self.local_id, remote_id);
        Ok(local)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Memory
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            max_message_size: MEMORY_MAX_MESSAGE_SIZE,
            reliable: true,
            ordered: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, mut b) = pair("alice", "bob");
        assert_eq!(a.remote_id, "bob");
        assert_eq!(b.remote_id, "alice");

        for timestamp in 0..5 {
            a.sink.send(&Message::Pong { timestamp }).await.unwrap();
        }
        for timestamp in 0..5 {
            let message = b.stream.next_message().await.unwrap().unwrap();
            assert_eq!(message, Message::Pong { timestamp });
        }
    }

    #[tokio::test]
    async fn test_close_is_seen_by_both_ends() {
        let (mut a, mut b) = pair("alice", "bob");
        a.sink.send(&Message::Pong { timestamp: 1 }).await.unwrap();
        a.sink.close().await.unwrap();

        assert!(!a.sink.is_open());
        assert!(!b.sink.is_open());

        // Frames queued before close are still delivered
        assert!(b.stream.next_message().await.unwrap().is_ok());
        assert!(b.stream.next_message().await.is_none());
        assert!(a.stream.next_message().await.is_none());
        assert!(b.sink.send(&Message::Pong { timestamp: 2 }).await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_an_end_closes_the_other() {
        let (a, mut b) = pair("alice", "bob");
        drop(a);
        assert!(b.stream.next_message().await.is_none());
    }

    #[tokio::test]
    async fn test_raw_peer_malformed_frame() {
        let (raw, mut channel) = raw_pair("mallory");
        raw.send_bytes(b"{not json}\n".to_vec()).await.unwrap();
        raw.send(&Message::Pong { timestamp: 3 }).await.unwrap();

        assert!(channel.stream.next_message().await.unwrap().is_err());
        assert_eq!(
            channel.stream.next_message().await.unwrap().unwrap(),
            Message::Pong { timestamp: 3 }
        );
    }

    #[tokio::test]
    async fn test_network_connect_and_refuse() {
        let network = MemoryNetwork::new();
        let mut incoming = network.register("bob").await;
        let factory = network.factory("alice");

        let channel = factory.connect("bob").await.unwrap();
        assert_eq!(channel.remote_id, "bob");
        let accepted = incoming.recv().await.unwrap();
        assert_eq!(accepted.remote_id, "alice");

        let err = factory.connect("carol").await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionRefused(_)));
        assert_eq!(network.connect_attempts(), 2);
    }
}
