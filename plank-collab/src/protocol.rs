//! Wire protocol for the commit and subscribe channels.
//!
//! Two message families share one WebSocket server:
//!
//! - **Requests/replies** (commit channel): bincode-encoded binary frames.
//!   One request per frame, one reply per request, in order.
//! - **Push events** (subscribe channel): newline-terminated JSON records in
//!   text frames. The first record after subscribing is a connectivity
//!   acknowledgment; every subsequent record announces that the board
//!   changed and carries the new version. The payload is advisory — peers
//!   re-fetch rather than receiving the edits themselves.
//!
//! ```text
//! ┌──────────┐  CommitRequest (bincode)   ┌──────────┐
//! │  client  │ ─────────────────────────► │  server  │
//! │          │ ◄───────────────────────── │          │
//! └──────────┘  ServerReply (bincode)     └────┬─────┘
//!                                              │ fanout
//!       {"type":"DOCUMENT_UPDATED","version":n}▼
//! ┌──────────┐ ◄──────────────────────────────┘
//! │ peer sub │   newline-delimited JSON records
//! └──────────┘
//! ```

use plank_core::{Board, BoardMeta, Change};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A batch of changes fenced by the session's last-known version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub board_id: Uuid,
    /// Originating session — excluded from the resulting fanout.
    pub session_id: Uuid,
    /// Acting user, resolved by the (external) authentication layer.
    pub identity: Uuid,
    pub expected_version: u64,
    pub changes: Vec<Change>,
}

/// Client-to-server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    Commit(CommitRequest),
    /// Switch this connection into push mode for the given board/session.
    Subscribe { board_id: Uuid, session_id: Uuid },
    FetchBoard { board_id: Uuid, identity: Uuid },
    ListBoards { identity: Uuid },
    CreateBoard {
        board_id: Uuid,
        name: String,
        identity: Uuid,
    },
    RenameBoard {
        board_id: Uuid,
        name: String,
        identity: Uuid,
    },
    DeleteBoard { board_id: Uuid, identity: Uuid },
}

/// Failure taxonomy carried on the wire.
///
/// `Conflict` is expected and recoverable (re-sync then retry by hand);
/// everything else is surfaced as a hard error and never retried
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Conflict,
    NotFound,
    Forbidden,
    Validation,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Conflict => "conflict",
            FailureKind::NotFound => "not found",
            FailureKind::Forbidden => "forbidden",
            FailureKind::Validation => "validation",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A typed failure reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl WireFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Server-to-client reply on the commit channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerReply {
    CommitOk { new_version: u64 },
    Board(Board),
    BoardList(Vec<BoardMeta>),
    /// Acknowledgment for board create/rename/delete.
    Done,
    Failure(WireFailure),
}

/// One record on the subscribe channel, JSON-encoded, one per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushEvent {
    /// Connectivity acknowledgment, first record after subscribing.
    Connected,
    /// The board changed; peers should re-fetch.
    DocumentUpdated { version: u64 },
}

impl PushEvent {
    /// Encode as one newline-terminated JSON record.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Decode a single record, tolerating the trailing newline.
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

impl ClientRequest {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerReply {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        ServerReply::Failure(WireFailure::new(kind, message))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
