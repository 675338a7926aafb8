use shared::{ActionKind, DecodeError};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("server rejected action {client_seq}: {reason}")]
    Rejected { client_seq: u64, reason: String },

    #[error("offline queue full ({capacity} actions), {kind:?} not queued")]
    QueueFull { capacity: usize, kind: ActionKind },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("sync client is no longer running")]
    Stopped,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

impl From<DecodeError> for SyncError {
    fn from(e: DecodeError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}
