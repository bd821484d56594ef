//! Transfer Sender
//!
//! Streams one file to every eligible target. Each target gets its own task
//! that reads the file from the start, so a slow peer never holds up the
//! others. There is no retry and no acknowledgement: the only suspension
//! points are the slice read and the channel send.

use super::{chunk_len, progress_percent, speed_estimate, total_chunks, TransferTracker};
use crate::events::{EventSender, Notification, TransferDirection, TransferEvent};
use crate::message::{FileChunk, FileComplete, FileStart, Message};
use crate::transport::MessageSink;
use crate::{ProtocolError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    Memory(SharedBytes),
}

/// In-memory file contents shared by every target's reader
#[derive(Debug, Clone)]
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// A file queued for sending
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    source: FileSource,
}

impl OutgoingFile {
    /// Describe a file on disk; size is taken from its metadata
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("reading {}", path.display())))?;
        if !metadata.is_file() {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self {
            mime_type: guess_mime_type(&name).to_string(),
            name,
            size: metadata.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// Describe an in-memory buffer
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let name = name.into();
        Self {
            mime_type: guess_mime_type(&name).to_string(),
            size: data.len() as u64,
            name,
            source: FileSource::Memory(SharedBytes(Arc::new(data))),
        }
    }

    /// Builder pattern: override the detected MIME type
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Open a fresh reader positioned at the start of the file
    async fn open(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.source {
            FileSource::Path(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    ProtocolError::from_io_error(e, &format!("opening {}", path.display()))
                })?;
                Ok(Box::new(file))
            }
            FileSource::Memory(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
        }
    }
}

/// MIME type for a file name, by extension
pub fn guess_mime_type(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Result of sending to one target
#[derive(Debug)]
pub struct TargetOutcome {
    pub connection_id: String,
    pub result: Result<()>,
}

/// A running send operation
#[derive(Debug)]
pub struct TransferHandle {
    pub transfer_id: String,
    /// Connection ids the transfer was fanned out to
    pub targets: Vec<String>,
    tasks: Vec<JoinHandle<TargetOutcome>>,
}

impl TransferHandle {
    /// Wait for every target to finish
    pub async fn wait(self) -> Vec<TargetOutcome> {
        let results = futures::future::join_all(self.tasks).await;
        results
            .into_iter()
            .zip(self.targets)
            .map(|(joined, connection_id)| {
                joined.unwrap_or_else(|e| TargetOutcome {
                    connection_id,
                    result: Err(ProtocolError::Transport(format!("send task failed: {}", e))),
                })
            })
            .collect()
    }
}

/// Streams files to connected peers
#[derive(Debug, Clone)]
pub struct TransferSender {
    local_id: String,
    username: String,
    tracker: Arc<TransferTracker>,
    events: EventSender,
}

impl TransferSender {
    pub fn new(
        local_id: impl Into<String>,
        username: impl Into<String>,
        tracker: Arc<TransferTracker>,
        events: EventSender,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            username: username.into(),
            tracker,
            events,
        }
    }

    /// Start sending `file` to each of `targets`
    ///
    /// `targets` must already be filtered to connected peers. With none, a
    /// "No Connected Peers" notification is raised and nothing is sent.
    pub async fn send(
        &self,
        file: OutgoingFile,
        targets: Vec<(String, Arc<dyn MessageSink>)>,
    ) -> Result<TransferHandle> {
        if targets.is_empty() {
            self.events.notify(Notification::error(
                "No Connected Peers",
                ProtocolError::NoEligibleTargets.user_message(),
            ));
            return Err(ProtocolError::NoEligibleTargets);
        }

        let transfer_id = new_transfer_id();
        info!(
            "Sending {} ({} bytes) as {} to {} peer(s)",
            file.name,
            file.size,
            transfer_id,
            targets.len()
        );

        let file = Arc::new(file);
        let mut ids = Vec::with_capacity(targets.len());
        let mut tasks = Vec::with_capacity(targets.len());
        for (connection_id, sink) in targets {
            self.tracker
                .start(
                    &transfer_id,
                    &connection_id,
                    &file.name,
                    file.size,
                    TransferDirection::Outgoing,
                )
                .await;

            let sender = self.clone();
            let file = Arc::clone(&file);
            let id = transfer_id.clone();
            let target = connection_id.clone();
            tasks.push(tokio::spawn(async move {
                let result = sender.send_to(&id, &file, &target, sink.as_ref()).await;
                if let Err(e) = &result {
                    error!("Sending {} to {} failed: {}", id, target, e);
                    sender.events.transfer(TransferEvent::Failed {
                        transfer_id: id.clone(),
                        connection_id: target.clone(),
                        error: e.to_string(),
                    });
                }
                TargetOutcome {
                    connection_id: target,
                    result,
                }
            }));
            ids.push(connection_id);
        }

        Ok(TransferHandle {
            transfer_id,
            targets: ids,
            tasks,
        })
    }

    /// Send start, every chunk and complete to a single target
    pub async fn send_to(
        &self,
        transfer_id: &str,
        file: &OutgoingFile,
        connection_id: &str,
        sink: &dyn MessageSink,
    ) -> Result<()> {
        let total = total_chunks(file.size);
        let speed = speed_estimate(file.size, total);

        sink.send(&Message::FileStart(FileStart {
            file_id: transfer_id.to_string(),
            file_name: file.name.clone(),
            file_type: file.mime_type.clone(),
            file_size: file.size,
            total_chunks: total,
            peer_id: self.local_id.clone(),
            peer_username: self.username.clone(),
        }))
        .await?;

        let mut reader = file.open().await?;
        let mut payload = Vec::with_capacity(file.size as usize);

        for index in 0..total {
            let mut chunk = vec![0u8; chunk_len(file.size, index)];
            reader.read_exact(&mut chunk).await.map_err(|e| {
                ProtocolError::from_io_error(e, &format!("reading chunk {} of {}", index, file.name))
            })?;
            payload.extend_from_slice(&chunk);

            sink.send(&Message::FileChunk(FileChunk {
                file_id: transfer_id.to_string(),
                chunk,
                chunk_index: index,
                total_chunks: total,
                speed,
                peer_id: self.local_id.clone(),
                peer_username: self.username.clone(),
            }))
            .await?;

            let percent = progress_percent(index, total);
            let percent = self
                .tracker
                .update(transfer_id, connection_id, percent, speed)
                .await;
            self.events.transfer(TransferEvent::Progress {
                transfer_id: transfer_id.to_string(),
                connection_id: connection_id.to_string(),
                direction: TransferDirection::Outgoing,
                percent,
                speed,
            });
            debug!(
                "Sent chunk {}/{} of {} to {}",
                index + 1,
                total,
                transfer_id,
                connection_id
            );
        }

        sink.send(&Message::FileComplete(FileComplete {
            file_id: transfer_id.to_string(),
            file_name: file.name.clone(),
            file_type: file.mime_type.clone(),
            file_size: file.size,
            file_data: payload,
            peer_id: self.local_id.clone(),
            peer_username: self.username.clone(),
        }))
        .await?;

        self.tracker.complete(transfer_id, connection_id).await;
        self.events.transfer(TransferEvent::Sent {
            transfer_id: transfer_id.to_string(),
            connection_id: connection_id.to_string(),
        });
        info!("Sent {} to {}", transfer_id, connection_id);
        Ok(())
    }
}

/// `file-<millis>-<random>`, unique per send operation
fn new_transfer_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("file-{}-{}", crate::current_timestamp(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSender;
    use crate::transport::memory;

    fn sender() -> (TransferSender, crate::events::NodeEvents) {
        let (events, rx) = EventSender::channel();
        (
            TransferSender::new("alice", "SwiftPeer1", Arc::new(TransferTracker::new()), events),
            rx,
        )
    }

    async fn drain(stream: &mut Box<dyn crate::transport::MessageStream>) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Some(Ok(message)) = stream.next_message().await {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type("photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime_type("notes.txt"), "text/plain");
        assert_eq!(guess_mime_type("README"), "application/octet-stream");
    }

    #[test]
    fn test_transfer_ids_unique() {
        assert_ne!(new_transfer_id(), new_transfer_id());
        assert!(new_transfer_id().starts_with("file-"));
    }

    #[tokio::test]
    async fn test_send_message_sequence() {
        let (sender, mut events) = sender();
        let (local, mut remote) = memory::pair("alice", "bob");
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let file = OutgoingFile::from_bytes("data.bin", data.clone());

        sender
            .send_to("file-1", &file, "bob", local.sink.as_ref())
            .await
            .unwrap();
        local.sink.close().await.unwrap();

        let messages = drain(&mut remote.stream).await;
        assert_eq!(messages.len(), 5);

        match &messages[0] {
            Message::FileStart(start) => {
                assert_eq!(start.file_size, 40_000);
                assert_eq!(start.total_chunks, 3);
                assert_eq!(start.file_type, "application/octet-stream");
                assert_eq!(start.peer_id, "alice");
            }
            other => panic!("expected file-start, got {:?}", other),
        }

        let mut lens = Vec::new();
        for (i, message) in messages[1..4].iter().enumerate() {
            match message {
                Message::FileChunk(chunk) => {
                    assert_eq!(chunk.chunk_index, i as u64);
                    assert_eq!(chunk.total_chunks, 3);
                    assert_eq!(chunk.speed, 40_000.0 / 3.0);
                    lens.push(chunk.chunk.len());
                }
                other => panic!("expected file-chunk, got {:?}", other),
            }
        }
        assert_eq!(lens, vec![16384, 16384, 7232]);

        match &messages[4] {
            Message::FileComplete(complete) => assert_eq!(complete.file_data, data),
            other => panic!("expected file-complete, got {:?}", other),
        }

        let mut percents = Vec::new();
        while let Ok(event) = events.transfers.try_recv() {
            if let TransferEvent::Progress { percent, .. } = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents, vec![33, 66, 100]);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let (sender, _events) = sender();
        let (local, mut remote) = memory::pair("alice", "bob");
        let file = OutgoingFile::from_bytes("empty.txt", Vec::new());

        sender
            .send_to("file-2", &file, "bob", local.sink.as_ref())
            .await
            .unwrap();
        local.sink.close().await.unwrap();

        let kinds: Vec<&str> = drain(&mut remote.stream)
            .await
            .iter()
            .map(|m| m.kind())
            .collect();
        assert_eq!(kinds, vec!["file-start", "file-complete"]);
    }

    #[tokio::test]
    async fn test_no_targets() {
        let (sender, mut events) = sender();
        let file = OutgoingFile::from_bytes("a.txt", b"abc".to_vec());

        let err = sender.send(file, Vec::new()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NoEligibleTargets));

        let notification = events.notifications.try_recv().unwrap();
        assert_eq!(notification.title, "No Connected Peers");
    }

    #[tokio::test]
    async fn test_send_failure_propagates() {
        let (sender, mut events) = sender();
        let (local, remote) = memory::pair("alice", "bob");
        local.sink.close().await.unwrap();
        drop(remote);

        let file = OutgoingFile::from_bytes("a.txt", b"abc".to_vec());
        let handle = sender
            .send(file, vec![("bob".to_string(), Arc::clone(&local.sink))])
            .await
            .unwrap();
        let outcomes = handle.wait().await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_err());
        assert!(matches!(
            events.transfers.recv().await,
            Some(TransferEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_readers_share_buffer() {
        let file = OutgoingFile::from_bytes("a.bin", vec![5; 1000]);
        let FileSource::Memory(shared) = &file.source else {
            panic!("expected an in-memory source");
        };
        assert_eq!(Arc::strong_count(&shared.0), 1);

        let mut first = file.open().await.unwrap();
        let second = file.open().await.unwrap();
        assert_eq!(Arc::strong_count(&shared.0), 3);

        let mut contents = Vec::new();
        first.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, vec![5; 1000]);

        drop(first);
        drop(second);
        assert_eq!(Arc::strong_count(&shared.0), 1);
    }

    #[tokio::test]
    async fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let file = OutgoingFile::from_path(&path).await.unwrap();
        assert_eq!(file.name, "notes.txt");
        assert_eq!(file.size, 11);
        assert_eq!(file.mime_type, "text/plain");

        let mut reader = file.open().await.unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"hello world");

        assert!(OutgoingFile::from_path(dir.path()).await.is_err());
    }
}
