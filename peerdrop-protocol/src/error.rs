//! Error handling for the PeerDrop protocol
//!
//! This module provides a single error type for all protocol operations.
//! Errors are converted from underlying library errors using `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! ### Error Propagation
//!
//! Use `?` operator for automatic error propagation:
//!
//! ```rust
//! use peerdrop_protocol::Result;
//!
//! fn parse(data: &[u8]) -> Result<serde_json::Value> {
//!     let value: serde_json::Value = serde_json::from_slice(data)?;
//!     Ok(value)
//! }
//! ```
//!
//! ### Error Matching
//!
//! ```rust
//! use peerdrop_protocol::ProtocolError;
//!
//! fn describe(error: &ProtocolError) -> &'static str {
//!     match error {
//!         ProtocolError::AlreadyConnected(_) => "duplicate",
//!         ProtocolError::NoEligibleTargets => "nobody to send to",
//!         _ => "other",
//!     }
//! }
//! ```
//!
//! ## Error Categories
//!
//! - **Transport errors**: the channel failed, was refused or closed. The
//!   connection is marked disconnected and its probe cancelled.
//! - **Duplicate connection**: connecting to an id that is already connected.
//! - **Probe timeout**: never surfaced as an error; a timed-out ping attempt is
//!   simply excluded from the latency average.
//! - **Malformed messages**: `InvalidMessage`, logged and dropped by readers.

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Automatic Conversions
///
/// - `std::io::Error` → `ProtocolError::Io`
/// - `serde_json::Error` → `ProtocolError::Json`
///
/// # Examples
///
/// ```rust
/// use peerdrop_protocol::ProtocolError;
///
/// let error = ProtocolError::NotConnected("peer-123".to_string());
/// assert_eq!(error.to_string(), "Peer not connected: peer-123");
///
/// let error = ProtocolError::InvalidMessage("missing fileId".to_string());
/// assert_eq!(error.to_string(), "Invalid message: missing fileId");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport layer error
    ///
    /// The underlying channel failed while sending or receiving.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer is not known or not in `connected` status
    #[error("Peer not connected: {0}")]
    NotConnected(String),

    /// A connection to this peer is already established
    ///
    /// Returned by `PeerNode::connect` without touching the transport.
    #[error("Already connected: {0}")]
    AlreadyConnected(String),

    /// None of the requested targets is currently connected
    #[error("No connected peers among the selected targets")]
    NoEligibleTargets,

    /// Invalid or malformed message
    ///
    /// Raised when a frame is not valid JSON, carries an ill-typed field or
    /// misses a required field.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message size exceeded
    #[error("Message size exceeded: {0} bytes (max: {1})")]
    MessageSizeExceeded(usize, usize),

    /// Unknown transfer or received file id
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Connection refused
    ///
    /// The remote peer is unreachable or actively refused the connection.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Network connection was interrupted
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Resource exhausted (disk full, etc.)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Convert a generic I/O error into a more specific network error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peerdrop_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let io_error = Error::new(ErrorKind::TimedOut, "connection timeout");
    /// let error = ProtocolError::from_io_error(io_error, "connecting to peer");
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::PermissionDenied => {
                ProtocolError::PermissionDenied(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::NetworkError(format!(
                    "{}: connection interrupted ({})",
                    context, error
                ))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error is transient
    ///
    /// Nothing in the protocol retries on its own; callers may use this to
    /// decide whether offering a manual retry makes sense.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::Transport(_)
                | ProtocolError::Io(_)
        )
    }

    /// Get a user-friendly message suitable for a notification
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peerdrop_protocol::ProtocolError;
    ///
    /// assert_eq!(
    ///     ProtocolError::NoEligibleTargets.user_message(),
    ///     "Select at least one connected peer to send files."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NoEligibleTargets => {
                "Select at least one connected peer to send files.".to_string()
            }
            ProtocolError::AlreadyConnected(_) => {
                "You are already connected to this peer.".to_string()
            }
            ProtocolError::NotConnected(id) => {
                format!("Peer '{}' is not connected.", id)
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timeout: {}. Check network connection.", msg)
            }
            ProtocolError::ConnectionRefused(msg) => {
                format!("Connection refused: {}. Check the peer id.", msg)
            }
            ProtocolError::NetworkError(msg) | ProtocolError::Transport(msg) => {
                format!("Connection lost: {}.", msg)
            }
            ProtocolError::MessageSizeExceeded(size, max) => {
                format!("Message too large ({} bytes, max {} bytes).", size, max)
            }
            ProtocolError::InvalidMessage(msg) => format!("Invalid data received: {}.", msg),
            ProtocolError::TransferNotFound(id) => format!("Unknown file '{}'.", id),
            ProtocolError::PermissionDenied(msg) => {
                format!("Permission denied: {}. Check directory permissions.", msg)
            }
            ProtocolError::ResourceExhausted(msg) => {
                format!("Resource exhausted: {}. Free up space and try again.", msg)
            }
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
        }
    }
}
