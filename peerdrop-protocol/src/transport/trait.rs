//! Transport Trait Abstraction
//!
//! Defines the channel interface the rest of the protocol is written against.
//! A transport supplies connect, send, receive and close over an ordered,
//! reliable channel; framing is its own business.

use crate::{Message, Result};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Transport capabilities and characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Maximum encoded message size in bytes
    pub max_message_size: usize,

    /// Whether this transport supports reliable delivery
    pub reliable: bool,

    /// Whether messages arrive in send order
    pub ordered: bool,
}

/// Sending half of an open channel
///
/// Shared between the transfer sender, the liveness probe and the dispatcher,
/// so every method takes `&self`.
#[async_trait]
pub trait MessageSink: Send + Sync + Debug {
    /// Queue a message for in-order delivery
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is closed or the message is too large
    /// for this transport.
    async fn send(&self, message: &Message) -> Result<()>;

    /// Close the channel; the remote side observes a close event
    async fn close(&self) -> Result<()>;

    /// Check if the channel is still open
    fn is_open(&self) -> bool;
}

/// Receiving half of an open channel
#[async_trait]
pub trait MessageStream: Send + Debug {
    /// Wait for the next message
    ///
    /// `None` is the close event. `Some(Err(_))` is a frame that could not be
    /// decoded; the channel stays usable.
    async fn next_message(&mut self) -> Option<Result<Message>>;
}

/// An open channel to a remote peer
///
/// Holding a `Channel` value is the "open" event: both halves are ready.
#[derive(Debug)]
pub struct Channel {
    /// Identifier of the remote peer
    pub remote_id: String,

    /// Sending half
    pub sink: Arc<dyn MessageSink>,

    /// Receiving half
    pub stream: Box<dyn MessageStream>,
}

/// Factory trait for creating channels
#[async_trait]
pub trait TransportFactory: Send + Sync + Debug {
    /// Connect to a remote peer and wait until the channel is open
    async fn connect(&self, remote_id: &str) -> Result<Channel>;

    /// Get the transport type this factory creates
    fn transport_type(&self) -> TransportType;

    /// Get transport capabilities
    fn capabilities(&self) -> TransportCapabilities;
}

/// Transport type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    /// In-process channel pair
    Memory,

    /// Newline-delimited JSON over TCP
    Tcp,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Memory => write!(f, "Memory"),
            TransportType::Tcp => write!(f, "TCP"),
        }
    }
}
