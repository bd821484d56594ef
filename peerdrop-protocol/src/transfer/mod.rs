//! Chunked File Transfer
//!
//! A transfer is one file-send operation. The sender announces it with
//! `file-start`, streams fixed-size `file-chunk` slices in order and finishes
//! with `file-complete`, which carries the whole payload. The channel is
//! ordered and reliable, so there is no reordering, resend or acknowledgement.
//!
//! ## Chunking
//!
//! ```
//! use peerdrop_protocol::transfer::{chunk_len, progress_percent, total_chunks};
//!
//! assert_eq!(total_chunks(40_000), 3);
//! assert_eq!(chunk_len(40_000, 2), 7_232);
//!
//! let progress: Vec<u8> = (0..3).map(|i| progress_percent(i, 3)).collect();
//! assert_eq!(progress, vec![33, 66, 100]);
//! ```
//!
//! The receiver rebuilds the file from the `file-complete` payload; chunks
//! drive progress and byte accounting only.

mod receiver;
mod sender;

pub use receiver::{ReceivedFile, ReceivedFiles, TransferReceiver};
pub use sender::{guess_mime_type, OutgoingFile, TargetOutcome, TransferHandle, TransferSender};

use crate::events::TransferDirection;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Fixed chunk size in bytes
pub const CHUNK_SIZE: usize = 16384;

/// Number of chunks for a file of `file_size` bytes
pub fn total_chunks(file_size: u64) -> u64 {
    file_size.div_ceil(CHUNK_SIZE as u64)
}

/// Length of chunk `index`; the last chunk carries the remainder
pub fn chunk_len(file_size: u64, index: u64) -> usize {
    let start = index.saturating_mul(CHUNK_SIZE as u64);
    if start >= file_size {
        return 0;
    }
    (file_size - start).min(CHUNK_SIZE as u64) as usize
}

/// Progress after chunk `chunk_index` has been handled
///
/// Reaches 100 with the last chunk, which is directly followed by
/// `file-complete`. An empty transfer counts as done.
pub fn progress_percent(chunk_index: u64, total_chunks: u64) -> u8 {
    if total_chunks == 0 {
        return 100;
    }
    let done = chunk_index.saturating_add(1).min(total_chunks);
    (u128::from(done) * 100 / u128::from(total_chunks)) as u8
}

/// Per-chunk speed estimate carried in `file-chunk`
pub fn speed_estimate(file_size: u64, total_chunks: u64) -> f64 {
    if total_chunks == 0 {
        0.0
    } else {
        file_size as f64 / total_chunks as f64
    }
}

/// Progress state of one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TransferState {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: usize,
    pub total_chunks: u64,
    pub direction: TransferDirection,
    /// Percent per connection id
    pub progress: HashMap<String, u8>,
    /// Latest speed estimate in bytes per second
    pub speed: f64,
    pub started_at: DateTime<Utc>,
    pub completed: bool,
}

impl TransferState {
    /// Lowest progress over all connections
    pub fn overall_percent(&self) -> u8 {
        self.progress.values().copied().min().unwrap_or(0)
    }
}

/// Progress and speed of every transfer, keyed by transfer id
#[derive(Debug, Default)]
pub struct TransferTracker {
    transfers: RwLock<HashMap<String, TransferState>>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transfer and set its progress for `connection_id` to 0
    pub async fn start(
        &self,
        id: &str,
        connection_id: &str,
        file_name: &str,
        file_size: u64,
        direction: TransferDirection,
    ) {
        let mut transfers = self.transfers.write().await;
        let state = transfers.entry(id.to_string()).or_insert_with(|| TransferState {
            id: id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            chunk_size: CHUNK_SIZE,
            total_chunks: total_chunks(file_size),
            direction,
            progress: HashMap::new(),
            speed: 0.0,
            started_at: Utc::now(),
            completed: false,
        });
        state.progress.insert(connection_id.to_string(), 0);
    }

    /// Record progress for one connection
    ///
    /// Progress never moves backwards. Unknown transfers (a chunk without
    /// a preceding `file-start`) are created on the fly.
    pub async fn update(&self, id: &str, connection_id: &str, percent: u8, speed: f64) -> u8 {
        let mut transfers = self.transfers.write().await;
        let state = transfers.entry(id.to_string()).or_insert_with(|| TransferState {
            id: id.to_string(),
            file_name: String::new(),
            file_size: 0,
            chunk_size: CHUNK_SIZE,
            total_chunks: 0,
            direction: TransferDirection::Incoming,
            progress: HashMap::new(),
            speed: 0.0,
            started_at: Utc::now(),
            completed: false,
        });
        let entry = state.progress.entry(connection_id.to_string()).or_insert(0);
        *entry = (*entry).max(percent);
        state.speed = speed;
        *entry
    }

    /// Mark one connection's leg complete (100%)
    ///
    /// The transfer counts as completed once every leg is at 100.
    pub async fn complete(&self, id: &str, connection_id: &str) {
        if let Some(state) = self.transfers.write().await.get_mut(id) {
            state.progress.insert(connection_id.to_string(), 100);
            state.completed = state.progress.values().all(|p| *p == 100);
        }
    }

    pub async fn get(&self, id: &str) -> Option<TransferState> {
        self.transfers.read().await.get(id).cloned()
    }

    /// Number of transfers not yet completed
    pub async fn active_count(&self) -> usize {
        self.transfers
            .read()
            .await
            .values()
            .filter(|t| !t.completed)
            .count()
    }

    pub async fn list(&self) -> Vec<TransferState> {
        let mut transfers: Vec<TransferState> =
            self.transfers.read().await.values().cloned().collect();
        transfers.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        transfers
    }
}
