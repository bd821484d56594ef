//! Connection Registry
//!
//! Holds every connection record of the node. Handlers mutate it from the
//! dispatcher task, the liveness probes and the public API, so the map sits
//! behind an async `RwLock`.

use super::{Connection, ConnectionStatus, NetworkQuality};
use crate::transport::MessageSink;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,

    /// Process-wide bytes received in file chunks
    total_bytes: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any previous one with the same id
    pub async fn upsert(&self, connection: Connection) {
        self.connections
            .write()
            .await
            .insert(connection.id.clone(), connection);
    }

    pub async fn get(&self, id: &str) -> Option<Connection> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn status(&self, id: &str) -> Option<ConnectionStatus> {
        self.connections.read().await.get(id).map(|c| c.status)
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.status(id).await == Some(ConnectionStatus::Connected)
    }

    /// Replace the record for `id` with a fresh connected one
    ///
    /// A username announced before the channel opened is kept.
    pub async fn mark_connected(&self, id: &str, sink: Arc<dyn MessageSink>) {
        let mut connections = self.connections.write().await;
        let username = connections
            .get(id)
            .map(|c| c.username.clone())
            .unwrap_or_default();
        let mut connection = Connection::connected(id, sink);
        connection.username = username;
        connections.insert(id.to_string(), connection);
    }

    /// Move `id` to `Disconnected`
    ///
    /// Returns `false` when the record was unknown or already disconnected.
    pub async fn mark_disconnected(&self, id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(id) {
            Some(c) if c.status != ConnectionStatus::Disconnected => {
                c.status = ConnectionStatus::Disconnected;
                c.sink = None;
                true
            }
            _ => false,
        }
    }

    pub async fn set_username(&self, id: &str, username: &str) {
        if let Some(c) = self.connections.write().await.get_mut(id) {
            debug!("Peer {} is now known as {}", id, username);
            c.username = username.to_string();
        }
    }

    /// Add chunk bytes to the peer's counter and the process-wide total
    pub async fn record_bytes(&self, id: &str, bytes: u64) {
        if let Some(c) = self.connections.write().await.get_mut(id) {
            c.bytes_transferred += bytes;
        }
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Store a probe result and reclassify quality
    pub async fn update_latency(&self, id: &str, latency_ms: u64) -> Option<NetworkQuality> {
        let mut connections = self.connections.write().await;
        let c = connections.get_mut(id)?;
        c.latency_ms = latency_ms;
        c.last_ping = Utc::now();
        c.quality = NetworkQuality::from_latency(latency_ms);
        Some(c.quality)
    }

    /// All records, oldest first
    pub async fn list(&self) -> Vec<Connection> {
        let mut connections: Vec<Connection> =
            self.connections.read().await.values().cloned().collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        connections
    }

    pub async fn connected_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    /// The subset of `ids` that are connected, with their sinks
    ///
    /// Unknown, connecting and disconnected ids are left out. Duplicate ids
    /// appear once.
    pub async fn eligible_targets(&self, ids: &[String]) -> Vec<(String, Arc<dyn MessageSink>)> {
        let connections = self.connections.read().await;
        let mut targets: Vec<(String, Arc<dyn MessageSink>)> = Vec::new();
        for id in ids {
            if targets.iter().any(|(existing, _)| existing == id) {
                continue;
            }
            if let Some(Connection {
                status: ConnectionStatus::Connected,
                sink: Some(sink),
                ..
            }) = connections.get(id)
            {
                targets.push((id.clone(), Arc::clone(sink)));
            }
        }
        targets
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}
