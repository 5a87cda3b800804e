//! Error types

use crate::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, CollabError>;

/// Collaboration error
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    /// Save requested with blank content; nothing was sent
    #[error("Document content cannot be empty")]
    EmptyContent,
    #[error("Session closed")]
    SessionClosed,
    #[error("Push transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("No conflict to resolve")]
    NoConflict,
    #[error("Store error: {0}")]
    Store(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Invalid configuration: {0}")]
    Config(String),
}
