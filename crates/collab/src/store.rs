//! External collaborators: the document store and the push connector

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::protocol::{EditMessage, FeedEvent, OutboundMessage};
use crate::{DocumentId, Snapshot, UserId};

/// Request to record a named version of the current buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRequest {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub label: Option<String>,
    pub content: String,
}

/// A stored version of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionRecord {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub label: Option<String>,
    pub content: String,
    /// Document version the record was taken at
    pub version: u64,
    pub author: Option<UserId>,
    pub created_at: DateTime<Utc>,
    /// Created by the authority rather than a user
    #[serde(default)]
    pub automatic: bool,
}

/// Per-author edit count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub user_id: UserId,
    pub operations: u64,
}

/// Authoritative document storage
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch_snapshot(&self, document: DocumentId) -> Result<Snapshot>;

    /// Submit an edit. Returns once accepted, not once persisted.
    async fn submit_edit(&self, edit: EditMessage) -> Result<()>;

    async fn create_version(&self, request: VersionRequest) -> Result<VersionRecord>;

    /// Newest first
    async fn list_versions(&self, document: DocumentId) -> Result<Vec<VersionRecord>>;

    async fn contributions(&self, document: DocumentId) -> Result<Vec<Contribution>>;
}

/// Both halves of a live push connection
#[derive(Debug)]
pub struct PushChannel {
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
    pub inbound: mpsc::UnboundedReceiver<FeedEvent>,
}

/// Opens push connections for a document
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, document: DocumentId, user: UserId) -> Result<PushChannel>;
}

/// Connector for environments without a push channel
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPush;

#[async_trait]
impl PushConnector for NoPush {
    async fn connect(&self, _document: DocumentId, _user: UserId) -> Result<PushChannel> {
        Err(CollabError::TransportUnavailable("push disabled".into()))
    }
}
