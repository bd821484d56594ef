//! Node Events
//!
//! Events emitted by a node for whoever drives the user interface:
//! user-visible notifications plus machine-readable connection and transfer
//! updates.

use crate::connection::NetworkQuality;
use tokio::sync::mpsc;

/// Notification severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// A user-visible notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub severity: Severity,
}

impl Notification {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            severity: Severity::Info,
        }
    }

    pub fn error(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            severity: Severity::Error,
        }
    }
}

/// Which way a transfer flows relative to this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

/// Transfer lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// A remote peer announced a transfer
    Incoming {
        transfer_id: String,
        connection_id: String,
        file_name: String,
        file_size: u64,
    },

    /// One chunk was sent or received
    Progress {
        transfer_id: String,
        connection_id: String,
        direction: TransferDirection,
        percent: u8,
        /// Speed estimate in bytes per second
        speed: f64,
    },

    /// The `file-complete` message went out to one target
    Sent {
        transfer_id: String,
        connection_id: String,
    },

    /// A file was rebuilt from a `file-complete` message
    Received {
        transfer_id: String,
        connection_id: String,
        file_name: String,
        size: u64,
    },

    /// Sending to one target failed
    Failed {
        transfer_id: String,
        connection_id: String,
        error: String,
    },
}

/// Connection state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { connection_id: String },
    Disconnected { connection_id: String },
    /// A liveness round finished
    Updated {
        connection_id: String,
        latency_ms: u64,
        quality: NetworkQuality,
    },
}

/// Receivers for everything a node reports
#[derive(Debug)]
pub struct NodeEvents {
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub connections: mpsc::UnboundedReceiver<ConnectionEvent>,
    pub transfers: mpsc::UnboundedReceiver<TransferEvent>,
}

/// Cloneable sending side of [`NodeEvents`]
///
/// Sending never fails: events are dropped once nobody listens.
#[derive(Debug, Clone)]
pub struct EventSender {
    notifications: mpsc::UnboundedSender<Notification>,
    connections: mpsc::UnboundedSender<ConnectionEvent>,
    transfers: mpsc::UnboundedSender<TransferEvent>,
}

impl EventSender {
    pub fn channel() -> (EventSender, NodeEvents) {
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        let (connections_tx, connections_rx) = mpsc::unbounded_channel();
        let (transfers_tx, transfers_rx) = mpsc::unbounded_channel();
        (
            EventSender {
                notifications: notifications_tx,
                connections: connections_tx,
                transfers: transfers_tx,
            },
            NodeEvents {
                notifications: notifications_rx,
                connections: connections_rx,
                transfers: transfers_rx,
            },
        )
    }

    pub fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    pub fn connection(&self, event: ConnectionEvent) {
        let _ = self.connections.send(event);
    }

    pub fn transfer(&self, event: TransferEvent) {
        let _ = self.transfers.send(event);
    }
}
