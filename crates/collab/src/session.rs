//! Document session
//!
//! One tokio task per open document owns the [`SyncEngine`] and the transport
//! strategy. Callers talk to it through a cloneable [`SessionHandle`]; every
//! engine mutation happens on the task, one step at a time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::coalesce::Batcher;
use crate::config::SyncConfig;
use crate::engine::{Ack, AckOutcome, RemoteOutcome, SnapshotOutcome, SyncEngine, SyncMode};
use crate::error::{CollabError, Result};
use crate::fallback::Conflict;
use crate::operation::Operation;
use crate::presence::Presence;
use crate::protocol::{EditMessage, FeedEvent, OperationMessage};
use crate::store::{Contribution, DocumentStore, PushConnector, VersionRecord, VersionRequest};
use crate::transport::{connect_with_backoff, probe, Inbound, PollingStrategy, PushStrategy, SyncStrategy};
use crate::{DocumentId, Snapshot, UserId};

pub use crate::transport::SyncStatus;

/// What the presentation layer shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub document: DocumentId,
    pub content: String,
    pub version: u64,
    pub status: SyncStatus,
    /// Unacknowledged local operations
    pub pending: usize,
    /// Edits not yet saved
    pub dirty: bool,
    /// Conflict banner, when raised
    pub conflict: Option<Conflict>,
    pub online: Vec<UserId>,
    pub contributors: Vec<UserId>,
}

/// Session event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Buffer changed because of a remote edit
    ContentChanged { content: String, version: u64 },
    StatusChanged(SyncStatus),
    /// Remote snapshot collided with unsaved edits
    Conflict(Conflict),
    ConflictResolved,
    Saved,
    PresenceChanged(Vec<UserId>),
}

enum Command {
    Edit {
        content: String,
        reply: oneshot::Sender<()>,
    },
    Save {
        reply: oneshot::Sender<Result<()>>,
    },
    CreateVersion {
        label: Option<String>,
        reply: oneshot::Sender<Result<VersionRecord>>,
    },
    AcceptRemote {
        reply: oneshot::Sender<Result<String>>,
    },
    IgnoreRemote {
        reply: oneshot::Sender<Result<()>>,
    },
    View {
        reply: oneshot::Sender<SessionView>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Opens document sessions
pub struct DocumentSession;

impl DocumentSession {
    /// Fetch the document, probe the transport and start the session task
    pub async fn open(
        config: SyncConfig,
        store: Arc<dyn DocumentStore>,
        connector: Arc<dyn PushConnector>,
        document: DocumentId,
        user: UserId,
    ) -> Result<SessionHandle> {
        config.validate()?;
        let snapshot = store.fetch_snapshot(document).await?;
        let strategy = probe(&config, Arc::clone(&store), connector.as_ref(), document, user).await;
        let mode = match strategy.status() {
            SyncStatus::Live => SyncMode::Operations,
            _ => SyncMode::Snapshots,
        };
        info!(%document, %user, version = snapshot.version, status = ?strategy.status(), "session opened");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let task = SessionTask {
            batcher: Batcher::new(config.debounce, config.max_debounce, config.flush_threshold),
            engine: SyncEngine::new(snapshot).with_mode(mode),
            strategy,
            store: Arc::clone(&store),
            connector,
            user,
            presence: Presence::new(),
            events: events.clone(),
            save: None,
            config,
        };
        tokio::spawn(task.run(command_rx));

        Ok(SessionHandle {
            document,
            user,
            commands,
            events,
            store,
        })
    }
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    document: DocumentId,
    user: UserId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    store: Arc<dyn DocumentStore>,
}

impl SessionHandle {
    pub fn document(&self) -> DocumentId {
        self.document
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).map_err(|_| CollabError::SessionClosed)?;
        response.await.map_err(|_| CollabError::SessionClosed)
    }

    /// The user changed the buffer to `content`
    pub async fn edit(&self, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.request(|reply| Command::Edit { content, reply }).await
    }

    /// Save the buffer. Waits a bounded time for pending operations first.
    pub async fn save(&self) -> Result<()> {
        self.request(|reply| Command::Save { reply }).await?
    }

    /// Record a named version of the current buffer
    pub async fn create_version(&self, label: Option<String>) -> Result<VersionRecord> {
        self.request(|reply| Command::CreateVersion { label, reply }).await?
    }

    /// Resolve the conflict by taking the remote content; returns it
    pub async fn accept_remote(&self) -> Result<String> {
        self.request(|reply| Command::AcceptRemote { reply }).await?
    }

    /// Resolve the conflict by keeping local edits
    pub async fn ignore_remote(&self) -> Result<()> {
        self.request(|reply| Command::IgnoreRemote { reply }).await?
    }

    pub async fn view(&self) -> Result<SessionView> {
        self.request(|reply| Command::View { reply }).await
    }

    pub async fn history(&self) -> Result<Vec<VersionRecord>> {
        self.store.list_versions(self.document).await
    }

    pub async fn contributions(&self) -> Result<Vec<Contribution>> {
        self.store.contributions(self.document).await
    }

    /// End the session. Later calls fail with [`CollabError::SessionClosed`].
    pub async fn close(&self) -> Result<()> {
        match self.request(|reply| Command::Close { reply }).await {
            Ok(()) | Err(CollabError::SessionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Save waiting for the pending queue to drain
struct PendingSave {
    deadline: Instant,
    replies: Vec<oneshot::Sender<Result<()>>>,
}

struct SessionTask {
    config: SyncConfig,
    engine: SyncEngine,
    strategy: Box<dyn SyncStrategy>,
    store: Arc<dyn DocumentStore>,
    connector: Arc<dyn PushConnector>,
    user: UserId,
    batcher: Batcher,
    presence: Presence,
    events: broadcast::Sender<SessionEvent>,
    save: Option<PendingSave>,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

impl SessionTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let flush_at = self.batcher.deadline();
            let save_at = self.save.as_ref().map(|save| save.deadline);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                inbound = self.strategy.next_inbound() => self.handle_inbound(inbound).await,
                _ = sleep_until(flush_at) => self.flush().await,
                _ = sleep_until(save_at) => self.finish_save().await,
            }

            if self.save.is_some() && self.engine.pending_len() == 0 {
                self.finish_save().await;
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn content_changed(&self) {
        self.emit(SessionEvent::ContentChanged {
            content: self.engine.content().to_string(),
            version: self.engine.version(),
        });
    }

    fn status(&self) -> SyncStatus {
        self.strategy.status()
    }

    fn view(&self) -> SessionView {
        SessionView {
            document: self.engine.document(),
            content: self.engine.content().to_string(),
            version: self.engine.version(),
            status: self.status(),
            pending: self.engine.pending_len(),
            dirty: self.engine.is_dirty(),
            conflict: self.engine.conflict().cloned(),
            online: self.presence.online(),
            contributors: self.presence.contributors().to_vec(),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Edit { content, reply } => {
                let ops = self.engine.local_edit(&content);
                if !ops.is_empty() {
                    self.batcher.record(Instant::now());
                    if self.batcher.over_threshold(self.engine.pending_len()) {
                        self.flush().await;
                    }
                }
                let _ = reply.send(());
            }
            Command::Save { reply } => self.start_save(reply).await,
            Command::CreateVersion { label, reply } => {
                let request = VersionRequest {
                    document_id: self.engine.document(),
                    user_id: self.user,
                    label,
                    content: self.engine.content().to_string(),
                };
                let _ = reply.send(self.store.create_version(request).await);
            }
            Command::AcceptRemote { reply } => {
                let result = self.engine.accept_remote().map(|snapshot| snapshot.content);
                if result.is_ok() {
                    self.batcher.reset();
                    self.content_changed();
                    self.emit(SessionEvent::ConflictResolved);
                }
                let _ = reply.send(result);
            }
            Command::IgnoreRemote { reply } => {
                let result = self.engine.ignore_remote();
                if result.is_ok() {
                    self.emit(SessionEvent::ConflictResolved);
                }
                let _ = reply.send(result);
            }
            Command::View { reply } => {
                let _ = reply.send(self.view());
            }
            Command::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Hand everything queued to the transport
    async fn flush(&mut self) {
        self.batcher.reset();
        let ops = self.engine.take_outbound();
        if ops.is_empty() {
            return;
        }
        debug!(count = ops.len(), pending = self.engine.pending_len(), "transmitting operations");
        let edits = self.edits(&ops);
        if let Err(e) = self.strategy.transmit(edits).await {
            warn!(error = %e, "transmit failed");
            self.reconnect().await;
        }
    }

    fn edits(&self, ops: &[Operation]) -> Vec<EditMessage> {
        ops.iter()
            .map(|op| EditMessage::operation(self.engine.document(), self.user, op))
            .collect()
    }

    async fn start_save(&mut self, reply: oneshot::Sender<Result<()>>) {
        if let Err(e) = self.engine.prepare_save() {
            let _ = reply.send(Err(e));
            return;
        }
        if self.engine.pending_len() == 0 {
            let _ = reply.send(self.save_now().await);
            return;
        }

        self.flush().await;
        match &mut self.save {
            Some(save) => save.replies.push(reply),
            None => {
                self.save = Some(PendingSave {
                    deadline: Instant::now() + self.config.save_timeout,
                    replies: vec![reply],
                })
            }
        }
    }

    async fn finish_save(&mut self) {
        let Some(save) = self.save.take() else {
            return;
        };
        if self.engine.pending_len() > 0 {
            warn!(pending = self.engine.pending_len(), "saving before every operation was acknowledged");
        }

        let mut replies = save.replies.into_iter();
        match self.save_now().await {
            Ok(()) => replies.for_each(|reply| {
                let _ = reply.send(Ok(()));
            }),
            Err(e) => {
                let message = e.to_string();
                if let Some(first) = replies.next() {
                    let _ = first.send(Err(e));
                }
                replies.for_each(|reply| {
                    let _ = reply.send(Err(CollabError::Store(message.clone())));
                });
            }
        }
    }

    async fn save_now(&mut self) -> Result<()> {
        let content = self.engine.prepare_save()?;
        let edit = EditMessage::update(self.engine.document(), self.user, content.clone());
        self.store.submit_edit(edit).await?;
        self.engine.mark_saved(&content, None);
        info!(document = %self.engine.document(), chars = self.engine.content_len(), "document saved");
        self.emit(SessionEvent::Saved);
        Ok(())
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Event(event) => self.handle_event(event),
            Inbound::Snapshot(snapshot) => {
                let author = snapshot.last_editor;
                if let Some(author) = author.filter(|author| *author != self.user) {
                    self.presence.record_contributor(author);
                }
                self.apply_snapshot(snapshot, author);
            }
            Inbound::Disconnected => self.reconnect().await,
        }
    }

    fn handle_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Operation(message) => self.handle_operation(message),
            FeedEvent::DocumentChanged { document, change } => {
                if document.id != self.engine.document() {
                    return;
                }
                if let Some(author) = change.user_id.filter(|author| *author != self.user) {
                    self.presence.record_contributor(author);
                }
                self.apply_snapshot(document, change.user_id);
            }
            FeedEvent::Presence { users } => {
                if self.presence.set_online(users) {
                    self.emit(SessionEvent::PresenceChanged(self.presence.online()));
                }
            }
            FeedEvent::Pong => {}
        }
    }

    fn handle_operation(&mut self, message: OperationMessage) {
        let op = match message.to_operation() {
            Ok(op) => op,
            Err(e) => {
                warn!(error = %e, "dropping undecodable operation");
                return;
            }
        };

        // Our own operation coming back is the acknowledgement
        if message.user_id == self.user {
            let ack = Ack {
                op_id: message.op_id,
                version: message.version,
                shape: Some(op),
            };
            match self.engine.acknowledge(ack) {
                AckOutcome::Matched { flushed, resynced, .. } if resynced || !flushed.is_empty() => {
                    self.content_changed()
                }
                AckOutcome::Matched { .. } => {}
                AckOutcome::Unknown => warn!(op_id = ?message.op_id, "acknowledgement for unknown operation"),
            }
            return;
        }

        self.presence.record_contributor(message.user_id);
        match self.engine.receive_remote(op) {
            RemoteOutcome::Applied(_) => self.content_changed(),
            RemoteOutcome::Deferred | RemoteOutcome::Duplicate => {}
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot, author: Option<UserId>) {
        match self.engine.receive_snapshot(snapshot, author) {
            SnapshotOutcome::Unchanged | SnapshotOutcome::Held => {}
            SnapshotOutcome::Adopted => {
                self.batcher.reset();
                self.content_changed();
            }
            SnapshotOutcome::Conflict(conflict) => self.emit(SessionEvent::Conflict(conflict)),
        }
    }

    /// The push channel dropped: reconnect with backoff, else fall back to
    /// polling for the rest of the session.
    async fn reconnect(&mut self) {
        if self.status() != SyncStatus::Live {
            return;
        }
        let document = self.engine.document();
        warn!(%document, "push channel lost, reconnecting");

        match connect_with_backoff(&self.config, self.connector.as_ref(), document, self.user).await {
            Ok(channel) => {
                self.strategy = Box::new(PushStrategy::new(channel, self.config.heartbeat));
                let resend = self.engine.resend_pending();
                let edits = self.edits(&resend);
                if let Err(e) = self.strategy.transmit(edits).await {
                    warn!(%document, error = %e, "resend failed");
                    self.degrade();
                    return;
                }
                info!(%document, resent = resend.len(), "push channel restored");

                // Whatever was broadcast while disconnected is only visible in a snapshot
                match self.store.fetch_snapshot(document).await {
                    Ok(snapshot) => self.apply_snapshot(snapshot, None),
                    Err(e) => warn!(%document, error = %e, "snapshot fetch after reconnect failed"),
                }
            }
            Err(e) => {
                warn!(%document, error = %e, "push unavailable");
                self.degrade();
            }
        }
    }

    fn degrade(&mut self) {
        let document = self.engine.document();
        let flushed = self.engine.degrade_to_snapshots();
        self.batcher.reset();
        self.strategy = Box::new(PollingStrategy::new(
            Arc::clone(&self.store),
            document,
            self.config.poll_interval,
        ));
        warn!(%document, "degraded to snapshot polling");
        self.emit(SessionEvent::StatusChanged(SyncStatus::Polling));
        if !flushed.is_empty() {
            self.content_changed();
        }
    }

    fn shutdown(&mut self) {
        self.engine.close();
        self.batcher.reset();
        self.save = None;
        info!(document = %self.engine.document(), "session closed");
        self.emit(SessionEvent::StatusChanged(SyncStatus::Closed));
    }
}
