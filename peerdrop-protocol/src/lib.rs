//! # PeerDrop Protocol
//!
//! Peer-to-peer file sharing over an ordered, reliable message channel.
//!
//! A [`PeerNode`] keeps one connection record per remote peer, streams files
//! to connected peers in 16 KiB chunks, rebuilds files it receives and probes
//! every connection for latency.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use peerdrop_protocol::transport::MemoryNetwork;
//! use peerdrop_protocol::{NodeConfig, OutgoingFile, PeerNode};
//! use std::sync::Arc;
//!
//! # async fn example() -> peerdrop_protocol::Result<()> {
//! let network = MemoryNetwork::new();
//! let mut incoming = network.register("bob").await;
//!
//! let (alice, _alice_events) = PeerNode::new(
//!     NodeConfig::new("alice"),
//!     Arc::new(network.factory("alice")),
//! );
//! let (bob, _bob_events) = PeerNode::new(NodeConfig::new("bob"), Arc::new(network.factory("bob")));
//!
//! alice.connect("bob").await?;
//! if let Some(channel) = incoming.recv().await {
//!     bob.accept(channel).await;
//! }
//!
//! let file = OutgoingFile::from_bytes("hello.txt", b"hello".to_vec());
//! let handle = alice.send_file(file, &["bob".to_string()]).await?;
//! handle.wait().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`message`]: wire messages and their newline-delimited JSON encoding
//! - [`transport`]: channel traits plus in-memory and TCP transports
//! - [`connection`]: connection records, lifecycle and quality
//! - [`transfer`]: chunking, the sender, the receiver and progress tracking
//! - [`liveness`]: periodic ping/pong latency probes
//! - [`node`]: the coordinator tying everything together

pub mod connection;
pub mod error;
pub mod events;
pub mod format;
pub mod fs_utils;
pub mod liveness;
pub mod message;
pub mod node;
pub mod transfer;
pub mod transport;
pub mod username;

pub use connection::{Connection, ConnectionRegistry, ConnectionStatus, NetworkQuality};
pub use error::{ProtocolError, Result};
pub use events::{ConnectionEvent, NodeEvents, Notification, Severity, TransferDirection, TransferEvent};
pub use liveness::{LivenessConfig, LivenessTracker, UNREACHABLE_LATENCY_MS};
pub use message::{current_timestamp, FileChunk, FileComplete, FileStart, Message};
pub use node::{NetworkStats, NodeConfig, PeerNode};
pub use transfer::{OutgoingFile, ReceivedFile, TransferHandle, TransferState, CHUNK_SIZE};
pub use username::generate_username;
