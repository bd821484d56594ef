//! Peer Connections
//!
//! Book-keeping for every channel this node knows about: lifecycle status,
//! display name, latency, link quality and byte counters.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──open──▶ Connected ──close──▶ Disconnected
//! ```
//!
//! `Disconnected` is terminal for a record. Connecting to the same id again
//! replaces the record with a fresh one.

mod registry;

pub use registry::ConnectionRegistry;

use crate::transport::MessageSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Latency below this many milliseconds is `Excellent`
pub const EXCELLENT_LATENCY_MS: u64 = 100;

/// Latency below this many milliseconds is `Good`
pub const GOOD_LATENCY_MS: u64 = 300;

/// Connection lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latency-derived link quality, used for display only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Poor,
}

impl NetworkQuality {
    /// Classify a latency measurement
    ///
    /// ```
    /// use peerdrop_protocol::NetworkQuality;
    ///
    /// assert_eq!(NetworkQuality::from_latency(50), NetworkQuality::Excellent);
    /// assert_eq!(NetworkQuality::from_latency(100), NetworkQuality::Good);
    /// assert_eq!(NetworkQuality::from_latency(300), NetworkQuality::Poor);
    /// ```
    pub fn from_latency(latency_ms: u64) -> Self {
        if latency_ms < EXCELLENT_LATENCY_MS {
            NetworkQuality::Excellent
        } else if latency_ms < GOOD_LATENCY_MS {
            NetworkQuality::Good
        } else {
            NetworkQuality::Poor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Poor => "poor",
        }
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection to one remote peer
#[derive(Debug, Clone)]
pub struct Connection {
    /// Remote peer id
    pub id: String,

    /// Display name announced by the peer (empty until `username` arrives)
    pub username: String,

    /// Sending half of the channel; `None` while still connecting
    pub sink: Option<Arc<dyn MessageSink>>,

    /// Last measured round-trip latency in milliseconds
    pub latency_ms: u64,

    /// When latency was last measured
    pub last_ping: DateTime<Utc>,

    /// Bytes received from this peer in file chunks
    pub bytes_transferred: u64,

    pub status: ConnectionStatus,

    pub quality: NetworkQuality,

    /// When this record was created
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    /// A record for an outgoing connection attempt
    pub fn connecting(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            username: String::new(),
            sink: None,
            latency_ms: 0,
            last_ping: now,
            bytes_transferred: 0,
            status: ConnectionStatus::Connecting,
            quality: NetworkQuality::Good,
            connected_at: now,
        }
    }

    /// A record for an open channel
    pub fn connected(id: impl Into<String>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            sink: Some(sink),
            status: ConnectionStatus::Connected,
            ..Self::connecting(id)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Time since the record was created
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.connected_at).to_std().unwrap_or_default()
    }

    /// Name for logs and notifications
    pub fn display_name(&self) -> &str {
        if self.username.is_empty() {
            &self.id
        } else {
            &self.username
        }
    }
}
