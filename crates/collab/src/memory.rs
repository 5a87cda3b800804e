//! In-memory authority
//!
//! A reference server: it orders operations, transforms late arrivals against
//! what it already applied, stamps versions and fans events out to every
//! connected client. [`Authority`] is the synchronous core; [`MemoryServer`]
//! wraps it as a [`DocumentStore`] and [`PushConnector`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CollabError, Result};
use crate::operation::{OpId, Operation};
use crate::protocol::{ChangeInfo, Edit, EditMessage, FeedEvent, OperationMessage, OutboundMessage};
use crate::store::{Contribution, DocumentStore, PushChannel, PushConnector, VersionRecord, VersionRequest};
use crate::transform::transform;
use crate::{DocumentId, Snapshot, UserId};

/// Operations between automatic versions
pub const AUTO_VERSION_EVERY: u64 = 10;

#[derive(Debug, Clone)]
struct LogEntry {
    version: u64,
    author: UserId,
    /// `None` for a full-content update
    op: Option<Operation>,
}

#[derive(Debug)]
struct DocumentState {
    content: String,
    version: u64,
    log: Vec<LogEntry>,
    versions: Vec<VersionRecord>,
    contributions: HashMap<UserId, u64>,
    last_editor: Option<UserId>,
    ops_since_version: u64,
    seen: HashSet<OpId>,
}

impl DocumentState {
    fn new(content: String) -> Self {
        Self {
            content,
            version: 0,
            log: Vec::new(),
            versions: Vec::new(),
            contributions: HashMap::new(),
            last_editor: None,
            ops_since_version: 0,
            seen: HashSet::new(),
        }
    }

    fn snapshot(&self, id: DocumentId) -> Snapshot {
        Snapshot {
            id,
            content: self.content.clone(),
            version: self.version,
            last_editor: self.last_editor,
        }
    }

    fn record(&mut self, id: DocumentId, author: UserId, op: Option<Operation>) {
        self.log.push(LogEntry {
            version: self.version,
            author,
            op,
        });
        *self.contributions.entry(author).or_default() += 1;
        self.last_editor = Some(author);

        self.ops_since_version += 1;
        if self.ops_since_version >= AUTO_VERSION_EVERY {
            self.ops_since_version = 0;
            self.versions.push(VersionRecord {
                id: Uuid::new_v4(),
                document_id: id,
                label: None,
                content: self.content.clone(),
                version: self.version,
                author: None,
                created_at: Utc::now(),
                automatic: true,
            });
            debug!(document = %id, version = self.version, "automatic version");
        }
    }
}

/// Synchronous authoritative state for any number of documents
#[derive(Debug, Default)]
pub struct Authority {
    documents: HashMap<DocumentId, DocumentState>,
}

impl Authority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_document(&mut self, content: impl Into<String>) -> DocumentId {
        let id = DocumentId::new();
        self.documents.insert(id, DocumentState::new(content.into()));
        id
    }

    pub fn snapshot(&self, document: DocumentId) -> Option<Snapshot> {
        self.documents.get(&document).map(|state| state.snapshot(document))
    }

    fn state(&mut self, document: DocumentId) -> Result<&mut DocumentState> {
        self.documents
            .get_mut(&document)
            .ok_or_else(|| CollabError::Store(format!("unknown document {document}")))
    }

    /// Order a client operation. Its `version` is the base it was made
    /// against; it is transformed against every later operation by other
    /// clients, applied, and returned stamped with its assigned version.
    /// An id already applied is not applied again; its logged form is
    /// returned so the resend still gets an echo.
    pub fn apply_operation(&mut self, document: DocumentId, author: UserId, op: Operation) -> Result<Operation> {
        let state = self.state(document)?;
        if !state.seen.insert(op.id) {
            debug!(%document, id = %op.id, "resent operation already applied");
            let logged = state.log.iter().filter_map(|entry| entry.op.as_ref()).find(|logged| logged.id == op.id);
            return logged
                .cloned()
                .ok_or_else(|| CollabError::Store(format!("operation {} missing from log", op.id)));
        }

        let mut rebased = op;
        let base = rebased.version;
        for entry in state.log.iter().filter(|entry| entry.version > base && entry.author != author) {
            if let Some(logged) = &entry.op {
                rebased = transform(&rebased, logged);
            }
        }

        let mut applied = rebased.apply(&mut state.content);
        state.version += 1;
        applied.version = state.version;
        state.record(document, author, Some(applied.clone()));
        Ok(applied)
    }

    /// Replace the whole content
    pub fn apply_update(&mut self, document: DocumentId, author: UserId, content: String) -> Result<Snapshot> {
        let state = self.state(document)?;
        state.content = content;
        state.version += 1;
        state.record(document, author, None);
        Ok(state.snapshot(document))
    }

    /// Apply a submitted edit and return the event to broadcast
    pub fn submit(&mut self, edit: &EditMessage) -> Result<FeedEvent> {
        match edit.edit()? {
            Edit::Operation(op) => {
                let applied = self.apply_operation(edit.document_id, edit.user_id, op)?;
                Ok(FeedEvent::Operation(OperationMessage::from_operation(&applied, edit.user_id)))
            }
            Edit::Update(content) => {
                let snapshot = self.apply_update(edit.document_id, edit.user_id, content)?;
                Ok(FeedEvent::DocumentChanged {
                    document: snapshot,
                    change: ChangeInfo {
                        user_id: Some(edit.user_id),
                    },
                })
            }
        }
    }

    pub fn create_version(&mut self, request: VersionRequest) -> Result<VersionRecord> {
        let state = self.state(request.document_id)?;
        let record = VersionRecord {
            id: Uuid::new_v4(),
            document_id: request.document_id,
            label: request.label,
            content: request.content,
            version: state.version,
            author: Some(request.user_id),
            created_at: Utc::now(),
            automatic: false,
        };
        state.versions.push(record.clone());
        Ok(record)
    }

    /// Newest first
    pub fn versions(&mut self, document: DocumentId) -> Result<Vec<VersionRecord>> {
        let state = self.state(document)?;
        Ok(state.versions.iter().rev().cloned().collect())
    }

    /// Most active first
    pub fn contributions(&mut self, document: DocumentId) -> Result<Vec<Contribution>> {
        let state = self.state(document)?;
        let mut contributions: Vec<Contribution> = state
            .contributions
            .iter()
            .map(|(user_id, operations)| Contribution {
                user_id: *user_id,
                operations: *operations,
            })
            .collect();
        contributions.sort_by(|a, b| b.operations.cmp(&a.operations).then(a.user_id.cmp(&b.user_id)));
        Ok(contributions)
    }
}

struct Subscriber {
    connection: Uuid,
    user: UserId,
    sender: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct Inner {
    authority: Authority,
    subscribers: HashMap<DocumentId, Vec<Subscriber>>,
    refuse_push: bool,
}

impl Inner {
    fn broadcast(&mut self, document: DocumentId, event: &FeedEvent) {
        if let Some(subscribers) = self.subscribers.get_mut(&document) {
            subscribers.retain(|subscriber| subscriber.sender.send(event.clone()).is_ok());
        }
    }

    fn broadcast_presence(&mut self, document: DocumentId) {
        let mut users: Vec<UserId> = self
            .subscribers
            .get(&document)
            .map(|subscribers| subscribers.iter().map(|s| s.user).collect())
            .unwrap_or_default();
        users.sort();
        users.dedup();
        self.broadcast(document, &FeedEvent::Presence { users });
    }
}

/// In-memory [`DocumentStore`] and [`PushConnector`]
#[derive(Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_document(&self, content: impl Into<String>) -> DocumentId {
        self.inner.lock().authority.create_document(content)
    }

    pub fn snapshot(&self, document: DocumentId) -> Option<Snapshot> {
        self.inner.lock().authority.snapshot(document)
    }

    /// Refuse new push connections, forcing clients onto polling
    pub fn set_refuse_push(&self, refuse: bool) {
        self.inner.lock().refuse_push = refuse;
    }

    /// Drop every push connection to `document`
    pub fn disconnect_all(&self, document: DocumentId) {
        let dropped = self.inner.lock().subscribers.remove(&document).map_or(0, |s| s.len());
        info!(%document, dropped, "push connections dropped");
    }

    /// Number of live push connections to `document`
    pub fn connections(&self, document: DocumentId) -> usize {
        self.inner.lock().subscribers.get(&document).map_or(0, Vec::len)
    }

    fn submit(&self, edit: &EditMessage) -> Result<()> {
        let mut inner = self.inner.lock();
        let event = inner.authority.submit(edit)?;
        inner.broadcast(edit.document_id, &event);
        Ok(())
    }

    fn pong(&self, document: DocumentId, connection: Uuid) {
        let inner = self.inner.lock();
        let subscriber = inner
            .subscribers
            .get(&document)
            .and_then(|subscribers| subscribers.iter().find(|s| s.connection == connection));
        if let Some(subscriber) = subscriber {
            let _ = subscriber.sender.send(FeedEvent::Pong);
        }
    }

    fn disconnect(&self, document: DocumentId, connection: Uuid) {
        let mut inner = self.inner.lock();
        let Some(subscribers) = inner.subscribers.get_mut(&document) else {
            return;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.connection != connection);
        if subscribers.len() != before {
            inner.broadcast_presence(document);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryServer {
    async fn fetch_snapshot(&self, document: DocumentId) -> Result<Snapshot> {
        self.snapshot(document)
            .ok_or_else(|| CollabError::Store(format!("unknown document {document}")))
    }

    async fn submit_edit(&self, edit: EditMessage) -> Result<()> {
        self.submit(&edit)
    }

    async fn create_version(&self, request: VersionRequest) -> Result<VersionRecord> {
        self.inner.lock().authority.create_version(request)
    }

    async fn list_versions(&self, document: DocumentId) -> Result<Vec<VersionRecord>> {
        self.inner.lock().authority.versions(document)
    }

    async fn contributions(&self, document: DocumentId) -> Result<Vec<Contribution>> {
        self.inner.lock().authority.contributions(document)
    }
}

#[async_trait]
impl PushConnector for MemoryServer {
    async fn connect(&self, document: DocumentId, user: UserId) -> Result<PushChannel> {
        let (outbound, mut from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let connection = Uuid::new_v4();

        {
            let mut inner = self.inner.lock();
            if inner.refuse_push {
                return Err(CollabError::TransportUnavailable("push refused".into()));
            }
            if inner.authority.snapshot(document).is_none() {
                return Err(CollabError::Store(format!("unknown document {document}")));
            }
            inner.subscribers.entry(document).or_default().push(Subscriber {
                connection,
                user,
                sender: to_client,
            });
            inner.broadcast_presence(document);
        }

        let server = self.clone();
        tokio::spawn(async move {
            while let Some(message) = from_client.recv().await {
                match message {
                    OutboundMessage::Edit(edit) => {
                        if let Err(e) = server.submit(&edit) {
                            debug!(%document, error = %e, "rejected edit");
                        }
                    }
                    OutboundMessage::Ping => server.pong(document, connection),
                }
            }
            server.disconnect(document, connection);
        });

        Ok(PushChannel { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_stamped_in_order() {
        let mut authority = Authority::new();
        let doc = authority.create_document("abc");
        let user = UserId::new();

        let first = authority.apply_operation(doc, user, Operation::insert(3, "d", 0)).unwrap();
        let second = authority.apply_operation(doc, user, Operation::insert(4, "e", 1)).unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(authority.snapshot(doc).unwrap().content, "abcde");
    }

    #[test]
    fn test_concurrent_operation_transformed() {
        let mut authority = Authority::new();
        let doc = authority.create_document("hello");
        let (alice, bob) = (UserId::new(), UserId::new());

        authority.apply_operation(doc, alice, Operation::insert(0, ">> ", 0)).unwrap();
        let late = authority.apply_operation(doc, bob, Operation::insert(5, "!", 0)).unwrap();
        assert_eq!(late.position, 8);
        assert_eq!(authority.snapshot(doc).unwrap().content, ">> hello!");
    }

    #[test]
    fn test_resent_operation_applied_once() {
        let mut authority = Authority::new();
        let doc = authority.create_document("");
        let op = Operation::insert(0, "x", 0);
        let user = UserId::new();
        let first = authority.apply_operation(doc, user, op.clone()).unwrap();
        let again = authority.apply_operation(doc, user, op).unwrap();
        assert_eq!(first, again);
        assert_eq!(authority.snapshot(doc).unwrap().content, "x");
        assert_eq!(authority.snapshot(doc).unwrap().version, 1);
    }

    #[test]
    fn test_out_of_bounds_clamped() {
        let mut authority = Authority::new();
        let doc = authority.create_document("abc");
        let applied = authority
            .apply_operation(doc, UserId::new(), Operation::delete(2, 10, 0))
            .unwrap();
        assert_eq!(applied.delete_len(), 1);
        assert_eq!(authority.snapshot(doc).unwrap().content, "ab");
    }

    #[test]
    fn test_automatic_versions() {
        let mut authority = Authority::new();
        let doc = authority.create_document("");
        let user = UserId::new();
        for i in 0..AUTO_VERSION_EVERY {
            authority.apply_operation(doc, user, Operation::insert(i as usize, "a", i)).unwrap();
        }
        let versions = authority.versions(doc).unwrap();
        assert_eq!(versions.len(), 1);
        assert!(versions[0].automatic);
        assert_eq!(versions[0].version, AUTO_VERSION_EVERY);
    }

    #[test]
    fn test_contributions_ranked() {
        let mut authority = Authority::new();
        let doc = authority.create_document("");
        let (alice, bob) = (UserId::new(), UserId::new());
        authority.apply_operation(doc, alice, Operation::insert(0, "a", 0)).unwrap();
        authority.apply_operation(doc, bob, Operation::insert(0, "b", 1)).unwrap();
        authority.apply_update(doc, bob, "bb".into()).unwrap();

        let contributions = authority.contributions(doc).unwrap();
        assert_eq!(contributions[0].user_id, bob);
        assert_eq!(contributions[0].operations, 2);
        assert_eq!(contributions[1].operations, 1);
    }

    #[test]
    fn test_unknown_document() {
        let mut authority = Authority::new();
        let result = authority.apply_operation(DocumentId::new(), UserId::new(), Operation::insert(0, "x", 0));
        assert!(matches!(result, Err(CollabError::Store(_))));
    }

    #[tokio::test]
    async fn test_push_echo_and_presence() {
        let server = MemoryServer::new();
        let doc = server.create_document("hi");
        let user = UserId::new();
        let mut channel = server.connect(doc, user).await.unwrap();

        let Some(FeedEvent::Presence { users }) = channel.inbound.recv().await else {
            panic!("expected presence");
        };
        assert_eq!(users, vec![user]);

        let op = Operation::insert(2, "!", 0);
        channel
            .outbound
            .send(OutboundMessage::Edit(EditMessage::operation(doc, user, &op)))
            .unwrap();
        let Some(FeedEvent::Operation(echo)) = channel.inbound.recv().await else {
            panic!("expected echo");
        };
        assert_eq!(echo.op_id, Some(op.id));
        assert_eq!(echo.version, 1);
        assert_eq!(server.snapshot(doc).unwrap().content, "hi!");
    }

    #[tokio::test]
    async fn test_refused_push() {
        let server = MemoryServer::new();
        let doc = server.create_document("");
        server.set_refuse_push(true);
        let result = server.connect(doc, UserId::new()).await;
        assert!(matches!(result, Err(CollabError::TransportUnavailable(_))));
    }
}
