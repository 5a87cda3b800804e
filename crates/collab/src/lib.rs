//! # Inkwell Collaboration
//!
//! Real-time multi-user editing of plain-text documents based on:
//! - Operational transformation against a single authoritative server
//! - Optimistic local edits with a pending queue and acknowledgements
//! - Snapshot polling with conflict resolution when no push channel exists
//!
//! [`engine::SyncEngine`] holds the synchronization state of one document;
//! [`session::DocumentSession`] drives it over a [`store::DocumentStore`] and
//! whichever transport the probe picks.

pub mod coalesce;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod memory;
pub mod operation;
pub mod pending;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod transform;
pub mod transport;
pub mod version;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use config::SyncConfig;
pub use diff::diff;
pub use engine::{Ack, AckOutcome, RemoteOutcome, SnapshotOutcome, SyncEngine, SyncMode};
pub use error::{CollabError, Result};
pub use fallback::Conflict;
pub use memory::MemoryServer;
pub use operation::{OpId, OpKind, Operation};
pub use presence::Presence;
pub use session::{DocumentSession, SessionEvent, SessionHandle, SessionView, SyncStatus};
pub use store::{DocumentStore, PushConnector};
pub use transform::{transform, transform_with, Tie};

/// Unique user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique document identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full document state as the store reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: DocumentId,
    pub content: String,
    pub version: u64,
    /// Last user to change the document, when the store tracks it
    #[serde(default)]
    pub last_editor: Option<UserId>,
}

impl Snapshot {
    pub fn new(id: DocumentId, content: impl Into<String>, version: u64) -> Self {
        Self {
            id,
            content: content.into(),
            version,
            last_editor: None,
        }
    }
}
