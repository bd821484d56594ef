//! Transfer Receiver
//!
//! Handles the three transfer messages for incoming files. Handlers are
//! invoked by the node's dispatcher one message at a time.

use super::{progress_percent, TransferTracker};
use crate::connection::ConnectionRegistry;
use crate::events::{EventSender, Notification, TransferDirection, TransferEvent};
use crate::fs_utils;
use crate::message::{FileChunk, FileComplete, FileStart};
use crate::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A file rebuilt from a `file-complete` message
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    /// Transfer id
    pub id: String,
    pub name: String,
    pub mime_type: String,
    /// Declared size from the sender
    pub size: u64,
    /// Text after the last dot of the name; empty when there is none
    pub extension: String,
    pub data: Arc<Vec<u8>>,
    /// Connection id of the sender
    pub from: String,
    pub from_username: String,
    pub received_at: DateTime<Utc>,
    /// Where the file was written by [`ReceivedFiles::save`]
    pub saved_path: Option<PathBuf>,
}

/// Received files, in arrival order
#[derive(Debug, Default)]
pub struct ReceivedFiles {
    files: RwLock<Vec<ReceivedFile>>,
}

impl ReceivedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, file: ReceivedFile) {
        self.files.write().await.push(file);
    }

    pub async fn list(&self) -> Vec<ReceivedFile> {
        self.files.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<ReceivedFile> {
        self.files.read().await.iter().find(|f| f.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }

    /// Discard a received file
    pub async fn remove(&self, id: &str) -> Option<ReceivedFile> {
        let mut files = self.files.write().await;
        let index = files.iter().position(|f| f.id == id)?;
        Some(files.remove(index))
    }

    /// Write a received file into `dir` under a conflict-free name
    ///
    /// The remote name is reduced to one path component first. On a failed
    /// write the partial file is removed.
    pub async fn save(&self, id: &str, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let file = self
            .get(id)
            .await
            .ok_or_else(|| ProtocolError::TransferNotFound(id.to_string()))?;

        let name = fs_utils::sanitize_file_name(&file.name);
        let path = fs_utils::get_unique_download_path(dir.as_ref(), &name).await;

        let mut handle = fs_utils::create_file_safe(&path).await?;
        if let Err(e) = fs_utils::write_file_safe(&mut handle, &file.data).await {
            drop(handle);
            fs_utils::cleanup_partial_file(&path).await;
            return Err(e);
        }

        if let Some(entry) = self.files.write().await.iter_mut().find(|f| f.id == id) {
            entry.saved_path = Some(path.clone());
        }
        info!("Saved {} to {}", file.name, path.display());
        Ok(path)
    }
}

/// Message handlers for incoming transfers
#[derive(Debug, Clone)]
pub struct TransferReceiver {
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<TransferTracker>,
    received: Arc<ReceivedFiles>,
    events: EventSender,
}

impl TransferReceiver {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<TransferTracker>,
        received: Arc<ReceivedFiles>,
        events: EventSender,
    ) -> Self {
        Self {
            registry,
            tracker,
            received,
            events,
        }
    }

    /// `file-start`: progress 0 and a "Receiving File" notification
    pub async fn on_start(&self, connection_id: &str, start: FileStart) {
        info!(
            "Receiving {} ({} bytes, {} chunks) from {}",
            start.file_name, start.file_size, start.total_chunks, connection_id
        );
        self.tracker
            .start(
                &start.file_id,
                connection_id,
                &start.file_name,
                start.file_size,
                TransferDirection::Incoming,
            )
            .await;

        self.events.notify(Notification::info(
            "Receiving File",
            format!("{} from {}", start.file_name, start.peer_username),
        ));
        self.events.transfer(TransferEvent::Incoming {
            transfer_id: start.file_id,
            connection_id: connection_id.to_string(),
            file_name: start.file_name,
            file_size: start.file_size,
        });
    }

    /// `file-chunk`: progress, speed and byte counters
    pub async fn on_chunk(&self, connection_id: &str, chunk: FileChunk) {
        let percent = progress_percent(chunk.chunk_index, chunk.total_chunks);
        let percent = self
            .tracker
            .update(&chunk.file_id, connection_id, percent, chunk.speed)
            .await;
        self.registry
            .record_bytes(connection_id, chunk.chunk.len() as u64)
            .await;

        debug!(
            "Chunk {}/{} of {} from {} ({}%)",
            chunk.chunk_index.saturating_add(1),
            chunk.total_chunks,
            chunk.file_id,
            connection_id,
            percent
        );
        self.events.transfer(TransferEvent::Progress {
            transfer_id: chunk.file_id,
            connection_id: connection_id.to_string(),
            direction: TransferDirection::Incoming,
            percent,
            speed: chunk.speed,
        });
    }

    /// `file-complete`: rebuild the file from its payload
    pub async fn on_complete(&self, connection_id: &str, complete: FileComplete) -> ReceivedFile {
        if complete.file_data.len() as u64 != complete.file_size {
            warn!(
                "{} declared {} bytes but carried {}",
                complete.file_id,
                complete.file_size,
                complete.file_data.len()
            );
        }

        let extension = Path::new(&complete.file_name)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        let file = ReceivedFile {
            id: complete.file_id,
            name: complete.file_name,
            mime_type: complete.file_type,
            size: complete.file_size,
            extension,
            data: Arc::new(complete.file_data),
            from: connection_id.to_string(),
            from_username: complete.peer_username,
            received_at: Utc::now(),
            saved_path: None,
        };

        self.received.push(file.clone()).await;
        self.tracker.complete(&file.id, connection_id).await;

        info!("Received {} from {}", file.name, connection_id);
        self.events.notify(Notification::info(
            "File Received",
            format!("{} from {}", file.name, file.from_username),
        ));
        self.events.transfer(TransferEvent::Received {
            transfer_id: file.id.clone(),
            connection_id: connection_id.to_string(),
            file_name: file.name.clone(),
            size: file.size,
        });

        file
    }
}
