//! TCP Transport
//!
//! Newline-delimited JSON messages over a plain TCP stream. The connecting side
//! opens with a `username` message whose `peerId` tells the accepting side who
//! is calling; that first message is handed to the accepting node like any
//! other so the display name is recorded as usual.

use super::{Channel, MessageSink, MessageStream, TransportCapabilities, TransportFactory, TransportType};
use crate::{Message, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum length of one JSON line (a `file-complete` carries the whole file)
pub const TCP_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default timeout for dialing and for the opening handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct TcpSink {
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
}

#[async_trait]
impl MessageSink for TcpSink {
    async fn send(&self, message: &Message) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::Transport("connection closed".to_string()));
        }
        let bytes = message.to_bytes()?;
        if bytes.len() > TCP_MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageSizeExceeded(
                bytes.len(),
                TCP_MAX_MESSAGE_SIZE,
            ));
        }

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            ProtocolError::from_io_error(e, "sending message")
        })
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "closing connection"))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct TcpMessageStream {
    reader: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
    pending: Option<Message>,
    finished: bool,
}

impl TcpMessageStream {
    fn new(read: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(read),
            buf: Vec::new(),
            pending: None,
            finished: false,
        }
    }

    async fn read_line(&mut self) -> Option<Result<Message>> {
        if self.finished {
            return None;
        }
        self.buf.clear();

        let mut limited = (&mut self.reader).take(TCP_MAX_MESSAGE_SIZE as u64 + 1);
        match limited.read_until(b'\n', &mut self.buf).await {
            Ok(0) => {
                self.finished = true;
                None
            }
            Ok(n) if n > TCP_MAX_MESSAGE_SIZE => {
                // The rest of the line is still in the socket; framing is lost
                self.finished = true;
                Some(Err(ProtocolError::MessageSizeExceeded(n, TCP_MAX_MESSAGE_SIZE)))
            }
            Ok(_) => Some(Message::from_bytes(&self.buf)),
            Err(e) => {
                debug!("TCP read failed, treating as close: {}", e);
                self.finished = true;
                None
            }
        }
    }
}

#[async_trait]
impl MessageStream for TcpMessageStream {
    async fn next_message(&mut self) -> Option<Result<Message>> {
        if let Some(message) = self.pending.take() {
            return Some(Ok(message));
        }
        self.read_line().await
    }
}

fn split(stream: TcpStream) -> (Arc<TcpSink>, TcpMessageStream) {
    let (read, write) = stream.into_split();
    let sink = Arc::new(TcpSink {
        writer: Mutex::new(write),
        open: AtomicBool::new(true),
    });
    (sink, TcpMessageStream::new(read))
}

/// Dials peers over TCP
///
/// A remote id is looked up in the address book first and otherwise used as
/// a literal `host:port`.
#[derive(Debug, Clone)]
pub struct TcpTransportFactory {
    local_id: String,
    username: String,
    address_book: HashMap<String, String>,
    connect_timeout: Duration,
}

impl TcpTransportFactory {
    pub fn new(local_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            username: username.into(),
            address_book: HashMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Builder pattern: set the alias → `host:port` table
    pub fn with_address_book(mut self, address_book: HashMap<String, String>) -> Self {
        self.address_book = address_book;
        self
    }

    /// Builder pattern: set the dial timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve a remote id to the address that will be dialed
    pub fn resolve(&self, remote_id: &str) -> String {
        self.address_book
            .get(remote_id)
            .cloned()
            .unwrap_or_else(|| remote_id.to_string())
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn connect(&self, remote_id: &str) -> Result<Channel> {
        let address = self.resolve(remote_id);
        debug!("Dialing {} at {}", remote_id, address);

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", address)))?
            .map_err(|e| ProtocolError::from_io_error(e, &format!("connecting to {}", address)))?;
        stream.set_nodelay(true)?;

        let (sink, stream) = split(stream);
        sink.send(&Message::Username {
            username: self.username.clone(),
            peer_id: self.local_id.clone(),
        })
        .await?;

        info!("TCP channel open to {} ({})", remote_id, address);
        Ok(Channel {
            remote_id: remote_id.to_string(),
            sink,
            stream: Box::new(stream),
        })
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Tcp
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            max_message_size: TCP_MAX_MESSAGE_SIZE,
            reliable: true,
            ordered: true,
        }
    }
}

/// Accepts incoming TCP peers
#[derive(Debug)]
pub struct TcpListenerTransport {
    listener: TcpListener,
    handshake_timeout: Duration,
}

impl TcpListenerTransport {
    /// Bind a listener on `addr`
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("binding {}", addr)))?;
        Ok(Self {
            listener,
            handshake_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// The bound address (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and complete the opening handshake
    pub async fn accept(&self) -> Result<Channel> {
        let (stream, addr) = self.listener.accept().await?;
        handshake(stream, addr, self.handshake_timeout).await
    }

    /// Accept connections forever, forwarding each open channel
    ///
    /// Every handshake runs in its own task, so a peer that connects and
    /// stays silent delays nobody else. Failed handshakes are logged and
    /// skipped. The loop ends when the receiver is dropped.
    pub fn spawn_accept_loop(self, channels: mpsc::UnboundedSender<Channel>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = self.listener.accept() => accepted,
                    _ = channels.closed() => break,
                };
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept TCP connection: {}", e);
                        continue;
                    }
                };

                let channels = channels.clone();
                let timeout = self.handshake_timeout;
                tokio::spawn(async move {
                    match handshake(stream, addr, timeout).await {
                        Ok(channel) => {
                            if channels.send(channel).is_err() {
                                debug!("Channel receiver dropped before {} was handed over", addr);
                            }
                        }
                        Err(e) => warn!("Rejected incoming TCP connection: {}", e),
                    }
                });
            }
            debug!("Channel receiver dropped, stopping accept loop");
        })
    }
}

/// Read the caller's `username` line and build the channel from it
async fn handshake(stream: TcpStream, addr: SocketAddr, timeout: Duration) -> Result<Channel> {
    stream.set_nodelay(true)?;
    let (sink, mut stream) = split(stream);

    let first = tokio::time::timeout(timeout, stream.read_line())
        .await
        .map_err(|_| ProtocolError::Timeout(format!("handshake from {}", addr)))?;

    let remote_id = match first {
        Some(Ok(Message::Username { username, peer_id })) => {
            stream.pending = Some(Message::Username {
                username,
                peer_id: peer_id.clone(),
            });
            peer_id
        }
        Some(Ok(other)) => {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected username handshake from {}, got {}",
                addr,
                other.kind()
            )))
        }
        Some(Err(e)) => return Err(e),
        None => {
            return Err(ProtocolError::NetworkError(format!(
                "{} closed before handshake",
                addr
            )))
        }
    };

    info!("Accepted TCP peer {} from {}", remote_id, addr);
    Ok(Channel {
        remote_id,
        sink,
        stream: Box::new(stream),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_address_book() {
        let mut book = HashMap::new();
        book.insert("laptop".to_string(), "10.0.0.2:4717".to_string());
        let factory = TcpTransportFactory::new("me", "SwiftPeer1").with_address_book(book);

        assert_eq!(factory.resolve("laptop"), "10.0.0.2:4717");
        assert_eq!(factory.resolve("127.0.0.1:9"), "127.0.0.1:9");
    }

    #[tokio::test]
    async fn test_loopback_handshake_and_messages() {
        let listener = TcpListenerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await });

        let factory = TcpTransportFactory::new("alice", "SwiftPeer1");
        let mut dialed = factory.connect(&addr.to_string()).await.unwrap();
        let mut accepted = accept.await.unwrap().unwrap();

        assert_eq!(accepted.remote_id, "alice");
        match accepted.stream.next_message().await.unwrap().unwrap() {
            Message::Username { username, peer_id } => {
                assert_eq!(username, "SwiftPeer1");
                assert_eq!(peer_id, "alice");
            }
            other => panic!("unexpected first message: {:?}", other),
        }

        accepted.sink.send(&Message::Pong { timestamp: 5 }).await.unwrap();
        assert_eq!(
            dialed.stream.next_message().await.unwrap().unwrap(),
            Message::Pong { timestamp: 5 }
        );

        dialed.sink.close().await.unwrap();
        assert!(accepted.stream.next_message().await.is_none());
    }

    #[tokio::test]
    async fn test_silent_client_does_not_block_accept_loop() {
        let listener = TcpListenerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut incoming) = mpsc::unbounded_channel();
        let accept_task = listener.spawn_accept_loop(tx);

        // Connects first and never sends its handshake
        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let factory = TcpTransportFactory::new("alice", "SwiftPeer1");
        let _dialed = factory.connect(&addr.to_string()).await.unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(3), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.remote_id, "alice");

        drop(incoming);
        let _late = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(3), accept_task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_is_not_sent() {
        let listener = TcpListenerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let factory = TcpTransportFactory::new("alice", "SwiftPeer1");
        let dialed = factory.connect(&addr.to_string()).await.unwrap();
        let mut accepted = accept.await.unwrap().unwrap();
        accepted.stream.next_message().await.unwrap().unwrap();

        // Base64 makes 13 MiB of payload exceed the 16 MiB line limit
        let complete = Message::FileComplete(crate::message::FileComplete {
            file_id: "file-big".to_string(),
            file_name: "big.bin".to_string(),
            file_type: "application/octet-stream".to_string(),
            file_size: 13 * 1024 * 1024,
            file_data: vec![0; 13 * 1024 * 1024],
            peer_id: "alice".to_string(),
            peer_username: "SwiftPeer1".to_string(),
        });
        match dialed.sink.send(&complete).await {
            Err(ProtocolError::MessageSizeExceeded(size, max)) => {
                assert!(size > TCP_MAX_MESSAGE_SIZE);
                assert_eq!(max, TCP_MAX_MESSAGE_SIZE);
            }
            other => panic!("expected MessageSizeExceeded, got {:?}", other),
        }

        // Nothing was written, so the channel is still usable
        assert!(dialed.sink.is_open());
        dialed.sink.send(&Message::Pong { timestamp: 9 }).await.unwrap();
        assert_eq!(
            accepted.stream.next_message().await.unwrap().unwrap(),
            Message::Pong { timestamp: 9 }
        );
    }

    #[tokio::test]
    async fn test_oversized_line_ends_stream() {
        let listener = TcpListenerTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });

        let writer = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let hello = Message::Username {
                username: "Mallory".to_string(),
                peer_id: "mallory".to_string(),
            };
            client.write_all(&hello.to_bytes().unwrap()).await.unwrap();
            client
                .write_all(&vec![b'a'; TCP_MAX_MESSAGE_SIZE + 1])
                .await
                .unwrap();
            client.write_all(b"\n").await.unwrap();
            client.write_all(&Message::Pong { timestamp: 1 }.to_bytes().unwrap()).await.unwrap();
            client
        });

        let mut accepted = accept.await.unwrap().unwrap();
        assert_eq!(accepted.remote_id, "mallory");
        assert!(matches!(
            accepted.stream.next_message().await,
            Some(Ok(Message::Username { .. }))
        ));
        assert!(matches!(
            accepted.stream.next_message().await,
            Some(Err(ProtocolError::MessageSizeExceeded(_, TCP_MAX_MESSAGE_SIZE)))
        ));
        // Framing is lost; the trailing pong is never surfaced
        assert!(accepted.stream.next_message().await.is_none());

        let _client = writer.await.unwrap();
    }

    #[test]
    fn test_capabilities() {
        let caps = TcpTransportFactory::new("me", "SwiftPeer1").capabilities();
        assert_eq!(caps.max_message_size, TCP_MAX_MESSAGE_SIZE);
        assert!(caps.reliable && caps.ordered);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with no listener
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let factory = TcpTransportFactory::new("alice", "SwiftPeer1");
        assert!(factory.connect(&addr.to_string()).await.is_err());
    }
}
