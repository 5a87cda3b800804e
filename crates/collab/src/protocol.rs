//! Collaboration protocol messages
//!
//! JSON shapes exchanged with the authority. Positions and lengths are signed
//! on the wire; negative values are clamped to zero on the way in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::operation::{OpId, OpKind, Operation};
use crate::{DocumentId, Snapshot, UserId};

/// Protocol decoding error
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown operation type: {0}")]
    UnknownOperationType(String),
    /// A full-content update where a discrete operation was expected
    #[error("Update carries no discrete operation")]
    NotAnOperation,
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Edit kind tag on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Delete,
    /// Full-content replacement, sent on save
    Update,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Delete => "DELETE",
            OperationType::Update => "UPDATE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(OperationType::Insert),
            "DELETE" => Ok(OperationType::Delete),
            "UPDATE" => Ok(OperationType::Update),
            other => Err(ProtocolError::UnknownOperationType(other.to_string())),
        }
    }
}

impl From<&Operation> for OperationType {
    fn from(op: &Operation) -> Self {
        match op.kind {
            OpKind::Insert { .. } => OperationType::Insert,
            OpKind::Delete { .. } => OperationType::Delete,
        }
    }
}

/// Discrete operation as carried on the wire, in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationMessage {
    pub user_id: UserId,
    /// `INSERT`, `DELETE` or `UPDATE`; kept as text so unknown kinds surface
    /// as a decoding error on the message rather than the whole event
    pub operation_type: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    /// Base version outbound, assigned version inbound
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<OpId>,
}

impl OperationMessage {
    pub fn from_operation(op: &Operation, user_id: UserId) -> Self {
        let (content, length) = match &op.kind {
            OpKind::Insert { text } => (Some(text.clone()), None),
            OpKind::Delete { len } => (None, Some(to_signed(*len))),
        };
        Self {
            user_id,
            operation_type: OperationType::from(op).as_str().to_string(),
            position: to_signed(op.position),
            content,
            length,
            version: op.version,
            op_id: Some(op.id),
        }
    }

    pub fn operation_type(&self) -> Result<OperationType, ProtocolError> {
        self.operation_type.parse()
    }

    /// Decode into an [`Operation`]. Missing insert text reads as empty and a
    /// missing delete length as zero; either way the result is a no-op rather
    /// than an error.
    pub fn to_operation(&self) -> Result<Operation, ProtocolError> {
        let position = clamp_signed(self.position);
        let op = match self.operation_type()? {
            OperationType::Insert => {
                Operation::insert(position, self.content.clone().unwrap_or_default(), self.version)
            }
            OperationType::Delete => {
                Operation::delete(position, clamp_signed(self.length.unwrap_or(0)), self.version)
            }
            OperationType::Update => return Err(ProtocolError::NotAnOperation),
        };
        Ok(match self.op_id {
            Some(id) => op.with_id(id),
            None => op,
        })
    }
}

fn clamp_signed(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}

fn to_signed(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Edit submitted to the authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    pub document_id: DocumentId,
    pub user_id: UserId,
    pub operation_type: String,
    /// Full content for updates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationMessage>,
}

/// Decoded payload of an [`EditMessage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Operation(Operation),
    Update(String),
}

impl EditMessage {
    /// A discrete operation
    pub fn operation(document_id: DocumentId, user_id: UserId, op: &Operation) -> Self {
        Self {
            document_id,
            user_id,
            operation_type: OperationType::from(op).as_str().to_string(),
            content: None,
            operation: Some(OperationMessage::from_operation(op, user_id)),
        }
    }

    /// Full-content replacement
    pub fn update(document_id: DocumentId, user_id: UserId, content: impl Into<String>) -> Self {
        Self {
            document_id,
            user_id,
            operation_type: OperationType::Update.as_str().to_string(),
            content: Some(content.into()),
            operation: None,
        }
    }

    pub fn edit(&self) -> Result<Edit, ProtocolError> {
        match self.operation_type.parse()? {
            OperationType::Update => Ok(Edit::Update(self.content.clone().unwrap_or_default())),
            OperationType::Insert | OperationType::Delete => {
                let message = self.operation.as_ref().ok_or(ProtocolError::NotAnOperation)?;
                message.to_operation().map(Edit::Operation)
            }
        }
    }
}

/// Who made a full-document change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeInfo {
    #[serde(default)]
    pub user_id: Option<UserId>,
}

/// Authority -> client messages on the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeedEvent {
    /// The whole document changed, e.g. someone saved
    DocumentChanged { document: Snapshot, change: ChangeInfo },
    /// A discrete operation, possibly our own echo
    Operation(OperationMessage),
    /// Users currently connected to the document
    Presence { users: Vec<UserId> },
    /// Heartbeat reply
    Pong,
}

impl FeedEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client -> authority messages on the push channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    Edit(EditMessage),
    /// Heartbeat
    Ping,
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
