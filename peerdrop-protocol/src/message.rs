//! PeerDrop Wire Messages
//!
//! Every message exchanged over a channel is a JSON object tagged by its
//! `type` field. Over byte streams each message is one line of JSON terminated
//! by a single newline.
//!
//! ## Message Kinds
//!
//! | type            | fields                                                               |
//! |-----------------|----------------------------------------------------------------------|
//! | `username`      | username, peerId                                                     |
//! | `ping`          | timestamp, peerId                                                    |
//! | `pong`          | timestamp                                                            |
//! | `file-start`    | fileId, fileName, fileType, fileSize, totalChunks, peerId, peerUsername |
//! | `file-chunk`    | fileId, chunk, chunkIndex, totalChunks, speed, peerId, peerUsername  |
//! | `file-complete` | fileId, fileName, fileType, fileSize, fileData, peerId, peerUsername |
//!
//! Binary fields (`chunk`, `fileData`) are standard base64 strings.
//!
//! ```
//! use peerdrop_protocol::Message;
//!
//! let bytes = br#"{"type":"pong","timestamp":1700000000000}"#;
//! let message = Message::from_bytes(bytes).unwrap();
//! assert_eq!(message, Message::Pong { timestamp: 1700000000000 });
//! ```

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A message carried over a peer channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Display name announcement
    Username {
        username: String,
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Latency probe; the receiver echoes the timestamp in a `pong`
    Ping {
        timestamp: i64,
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Probe reply
    Pong { timestamp: i64 },

    FileStart(FileStart),

    FileChunk(FileChunk),

    FileComplete(FileComplete),

    /// Any `type` this implementation does not know
    #[serde(other)]
    Unknown,
}

/// Announces a transfer before its first chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileStart {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u64,
    pub peer_id: String,
    pub peer_username: String,
}

/// One slice of a file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: String,
    #[serde(with = "base64_bytes")]
    pub chunk: Vec<u8>,
    pub chunk_index: u64,
    pub total_chunks: u64,
    /// Bytes per chunk interval as estimated by the sender
    pub speed: f64,
    pub peer_id: String,
    pub peer_username: String,
}

/// Ends a transfer and carries the complete file payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileComplete {
    pub file_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    #[serde(with = "base64_bytes")]
    pub file_data: Vec<u8>,
    pub peer_id: String,
    pub peer_username: String,
}

impl Message {
    /// The wire `type` of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Username { .. } => "username",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::FileStart(_) => "file-start",
            Message::FileChunk(_) => "file-chunk",
            Message::FileComplete(_) => "file-complete",
            Message::Unknown => "unknown",
        }
    }

    /// Serialize to one JSON line terminated by `\n`
    ///
    /// ```
    /// use peerdrop_protocol::Message;
    ///
    /// let bytes = Message::Pong { timestamp: 1 }.to_bytes().unwrap();
    /// assert_eq!(bytes.last(), Some(&b'\n'));
    /// ```
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a message, accepting `\n`, `\r\n` or no terminator
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidMessage` when the data is not JSON, a
    /// required field is missing or a field has the wrong type.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidMessage(format!("Failed to deserialize message: {}", e))
        })
    }
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sample_chunk() -> FileChunk {
        FileChunk {
            file_id: "file-1".to_string(),
            chunk: vec![0, 1, 2, 255],
            chunk_index: 0,
            total_chunks: 1,
            speed: 4.0,
            peer_id: "peer-a".to_string(),
            peer_username: "SwiftPeer1".to_string(),
        }
    }

    #[test]
    fn test_wire_field_names() {
        let bytes = Message::FileChunk(sample_chunk()).to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();

        assert_eq!(value["type"], "file-chunk");
        assert_eq!(value["fileId"], "file-1");
        assert_eq!(value["chunkIndex"], 0);
        assert_eq!(value["totalChunks"], 1);
        assert_eq!(value["peerUsername"], "SwiftPeer1");
        assert_eq!(value["chunk"], "AAEC/w==");
    }

    #[test]
    fn test_ping_pong_shape() {
        let ping = Message::Ping {
            timestamp: 42,
            peer_id: "me".to_string(),
        };
        let value = serde_json::to_value(&ping).unwrap();
        assert_eq!(value, json!({ "type": "ping", "timestamp": 42, "peerId": "me" }));

        let pong = serde_json::to_value(Message::Pong { timestamp: 42 }).unwrap();
        assert_eq!(pong, json!({ "type": "pong", "timestamp": 42 }));
    }

    #[test]
    fn test_decode_file_start() {
        let data = br#"{"type":"file-start","fileId":"f","fileName":"a.txt","fileType":"text/plain","fileSize":3,"totalChunks":1,"peerId":"p","peerUsername":"u"}"#;
        match Message::from_bytes(data).unwrap() {
            Message::FileStart(start) => {
                assert_eq!(start.file_name, "a.txt");
                assert_eq!(start.file_size, 3);
                assert_eq!(start.total_chunks, 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_with_crlf() {
        let data = b"{\"type\":\"pong\",\"timestamp\":7}\r\n";
        assert_eq!(Message::from_bytes(data).unwrap(), Message::Pong { timestamp: 7 });
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let data = br#"{"type":"chat","text":"hello"}"#;
        assert_eq!(Message::from_bytes(data).unwrap(), Message::Unknown);
    }

    #[test]
    fn test_missing_field_is_invalid() {
        let data = br#"{"type":"file-chunk","fileId":"f"}"#;
        let err = Message::from_bytes(data).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_bad_base64_is_invalid() {
        let data = br#"{"type":"file-complete","fileId":"f","fileName":"a","fileType":"","fileSize":1,"fileData":"***","peerId":"p","peerUsername":"u"}"#;
        assert!(Message::from_bytes(data).is_err());
    }

    #[test]
    fn test_not_json() {
        assert!(Message::from_bytes(b"not json data").is_err());
    }

    #[test]
    fn test_kind() {
        assert_eq!(Message::Pong { timestamp: 0 }.kind(), "pong");
        assert_eq!(Message::FileChunk(sample_chunk()).kind(), "file-chunk");
    }

    #[test]
    fn test_timestamp_generation() {
        let timestamp = current_timestamp();
        assert!(timestamp.to_string().len() >= 13);
    }
}
