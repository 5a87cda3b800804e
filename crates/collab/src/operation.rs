//! Operation model
//!
//! Positions and lengths are counted in `char`s, never bytes, so an operation
//! can't split a UTF-8 sequence no matter where a remote peer points it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub Uuid);

impl OpId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What an operation does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OpKind {
    /// Insert text at the position
    Insert { text: String },
    /// Remove `len` chars starting at the position
    Delete { len: usize },
}

/// A single text edit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique ID, echoed back by the authority on acknowledgement
    pub id: OpId,
    /// Char offset into the document
    pub position: usize,
    /// Insert payload or delete length
    #[serde(flatten)]
    pub kind: OpKind,
    /// Version stamp. For local operations this is the version the edit was
    /// made against; for operations relayed by the authority it is the
    /// version the authority assigned.
    pub version: u64,
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>, version: u64) -> Self {
        Self {
            id: OpId::new(),
            position,
            kind: OpKind::Insert { text: text.into() },
            version,
        }
    }

    pub fn delete(position: usize, len: usize, version: u64) -> Self {
        Self {
            id: OpId::new(),
            position,
            kind: OpKind::Delete { len },
            version,
        }
    }

    pub fn with_id(mut self, id: OpId) -> Self {
        self.id = id;
        self
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OpKind::Delete { .. })
    }

    /// Inserted text, if this is an insert
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Insert { text } => Some(text),
            OpKind::Delete { .. } => None,
        }
    }

    /// Number of chars this operation adds to the document
    pub fn insert_len(&self) -> usize {
        match &self.kind {
            OpKind::Insert { text } => char_len(text),
            OpKind::Delete { .. } => 0,
        }
    }

    /// Number of chars this operation removes from the document
    pub fn delete_len(&self) -> usize {
        match self.kind {
            OpKind::Delete { len } => len,
            OpKind::Insert { .. } => 0,
        }
    }

    /// Does applying this change nothing?
    pub fn is_noop(&self) -> bool {
        match &self.kind {
            OpKind::Insert { text } => text.is_empty(),
            OpKind::Delete { len } => *len == 0,
        }
    }

    /// Structural equality: kind, position and payload, ignoring id and version.
    ///
    /// Two concurrent operations with the same shape can't be told apart by
    /// this, so it is only a fallback for acknowledgements without an id.
    pub fn same_shape(&self, other: &Operation) -> bool {
        self.position == other.position && self.kind == other.kind
    }

    /// Clamp this operation into a document of `content_len` chars.
    pub fn sanitize(&self, content_len: usize) -> Operation {
        let mut op = self.clone();
        op.position = op.position.min(content_len);
        if let OpKind::Delete { len } = &mut op.kind {
            *len = (*len).min(content_len - op.position);
        }
        op
    }

    /// Whether this operation already fits a document of `content_len` chars
    pub fn fits(&self, content_len: usize) -> bool {
        self.position <= content_len
            && self.position.saturating_add(self.delete_len()) <= content_len
    }

    /// Apply to `content`, clamping first. Returns the operation as applied.
    pub fn apply(&self, content: &mut String) -> Operation {
        let op = self.sanitize(char_len(content));
        let start = byte_index(content, op.position);
        match &op.kind {
            OpKind::Insert { text } => content.insert_str(start, text),
            OpKind::Delete { len } => {
                let end = start + byte_index(&content[start..], *len);
                content.replace_range(start..end, "");
            }
        }
        op
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Insert { text } => write!(f, "Insert({}, {:?})@{}", self.position, text, self.version),
            OpKind::Delete { len } => write!(f, "Delete({}, {})@{}", self.position, len, self.version),
        }
    }
}

/// Apply a sequence of operations to a copy of `content`
pub fn apply_all<'a>(content: &str, ops: impl IntoIterator<Item = &'a Operation>) -> String {
    let mut out = content.to_string();
    for op in ops {
        op.apply(&mut out);
    }
    out
}

/// Length of `s` in chars
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `chars`-th char in `s`, or `s.len()` past the end
pub(crate) fn byte_index(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map(|(i, _)| i).unwrap_or(s.len())
}
