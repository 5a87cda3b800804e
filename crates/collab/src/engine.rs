//! Per-document synchronization state
//!
//! [`SyncEngine`] owns the buffer, pending and deferred queues, version counter
//! and snapshot baseline for one open document. Every method is one complete
//! step; nothing here awaits, so callers serialize steps simply by owning it.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::diff::diff;
use crate::error::{CollabError, Result};
use crate::fallback::{Conflict, FallbackSynchronizer, PollOutcome};
use crate::operation::{char_len, OpId, Operation};
use crate::pending::{AckMatch, PendingQueue};
use crate::reconcile::{apply_to_buffer, Admission, Reconciler};
use crate::version::VersionCounter;
use crate::{DocumentId, Snapshot, UserId};

/// Whether local edits become discrete operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Per-edit operations over a push channel
    Operations,
    /// Full snapshots only; edits stay local until saved
    Snapshots,
}

/// Confirmation that the authority accepted one of our operations
#[derive(Debug, Clone)]
pub struct Ack {
    pub op_id: Option<OpId>,
    /// Version the authority assigned
    pub version: u64,
    /// The echoed operation, for matching when the id is missing or unknown
    pub shape: Option<Operation>,
}

/// Result of receiving a remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Applied to the buffer in this (clamped) form
    Applied(Operation),
    /// Held until the pending queue drains
    Deferred,
    /// Already delivered once
    Duplicate,
}

/// Result of an acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Matched {
        op: Operation,
        how: AckMatch,
        /// Deferred operations applied because the queue drained
        flushed: Vec<Operation>,
        /// The queue drained with a snapshot held; the buffer now matches
        /// the authority
        resynced: bool,
    },
    /// Matched nothing; dropped
    Unknown,
}

/// Result of receiving a full snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Unchanged,
    Adopted,
    /// Kept until our in-flight operations are acknowledged
    Held,
    Conflict(Conflict),
}

/// Synchronization state for one open document
#[derive(Debug)]
pub struct SyncEngine {
    document: DocumentId,
    buffer: String,
    pending: PendingQueue,
    reconciler: Reconciler,
    version: VersionCounter,
    fallback: FallbackSynchronizer,
    /// Local edits made since the last save or adopted snapshot
    dirty: bool,
    mode: SyncMode,
    /// Pushed snapshot that arrived with operations in flight, rolled forward
    /// with every later operation the authority broadcast
    held: Option<Snapshot>,
}

impl SyncEngine {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            document: snapshot.id,
            buffer: snapshot.content.clone(),
            pending: PendingQueue::new(),
            reconciler: Reconciler::new(),
            version: VersionCounter::new(snapshot.version),
            fallback: FallbackSynchronizer::new(snapshot),
            dirty: false,
            mode: SyncMode::Operations,
            held: None,
        }
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn document(&self) -> DocumentId {
        self.document
    }

    pub fn content(&self) -> &str {
        &self.buffer
    }

    pub fn version(&self) -> u64 {
        self.version.get()
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    pub fn deferred_len(&self) -> usize {
        self.reconciler.deferred_len()
    }

    pub fn conflict(&self) -> Option<&Conflict> {
        self.fallback.conflict()
    }

    pub fn baseline(&self) -> &Snapshot {
        self.fallback.baseline()
    }

    pub fn has_outbound(&self) -> bool {
        self.pending.has_outbound()
    }

    /// Version new local operations are made against. While remote operations
    /// are deferred the buffer hasn't caught up with them, so local edits must
    /// still be transformed against them by the authority.
    pub fn local_base_version(&self) -> u64 {
        match self.reconciler.oldest_deferred_version() {
            Some(deferred) => self.version.get().min(deferred.saturating_sub(1)),
            None => self.version.get(),
        }
    }

    /// Replace the buffer with `content` as typed locally. Returns the
    /// operations derived from the change.
    pub fn local_edit(&mut self, content: &str) -> Vec<Operation> {
        if content == self.buffer {
            return Vec::new();
        }
        self.dirty = true;

        if self.mode == SyncMode::Snapshots {
            self.buffer = content.to_string();
            return Vec::new();
        }

        let ops = diff(&self.buffer, content, self.local_base_version());
        for op in &ops {
            self.queue_local(op.clone());
        }
        self.buffer = content.to_string();
        ops
    }

    /// Insert `text` at char `position` locally
    pub fn local_insert(&mut self, position: usize, text: &str) -> Operation {
        let op = Operation::insert(position, text, self.local_base_version());
        self.apply_local(op)
    }

    /// Delete `len` chars at `position` locally
    pub fn local_delete(&mut self, position: usize, len: usize) -> Operation {
        let op = Operation::delete(position, len, self.local_base_version());
        self.apply_local(op)
    }

    fn apply_local(&mut self, op: Operation) -> Operation {
        let applied = op.apply(&mut self.buffer);
        self.dirty = true;
        if self.mode == SyncMode::Operations && !applied.is_noop() {
            self.queue_local(applied.clone());
        }
        applied
    }

    fn queue_local(&mut self, op: Operation) {
        self.reconciler.rebase_deferred(&op);
        let queued = self.pending.push(op);
        trace!(?queued, pending = self.pending.len(), "queued local operation");
    }

    /// Operations to hand to the transport now
    pub fn take_outbound(&mut self) -> Vec<Operation> {
        self.pending.take_outbound()
    }

    /// Every unacknowledged operation in wire form, after a reconnect
    pub fn resend_pending(&mut self) -> Vec<Operation> {
        self.pending.resend_all()
    }

    /// Rebase and apply (or defer) an operation from another client
    pub fn receive_remote(&mut self, op: Operation) -> RemoteOutcome {
        if !self.reconciler.first_delivery(op.id) {
            debug!(id = %op.id, "duplicate remote operation ignored");
            return RemoteOutcome::Duplicate;
        }
        self.roll_held(&op, op.version);

        let rebased = self.pending.rebase_remote(&op);
        match self.reconciler.admit(rebased, self.pending.is_empty()) {
            Admission::Apply(rebased) => {
                let applied = apply_to_buffer(&mut self.buffer, &rebased);
                self.version.advance_to(op.version);
                RemoteOutcome::Applied(applied)
            }
            Admission::Deferred => RemoteOutcome::Deferred,
        }
    }

    /// Remove the acknowledged operation from the pending queue
    pub fn acknowledge(&mut self, ack: Ack) -> AckOutcome {
        let matched = self.pending.acknowledge(ack.op_id, ack.shape.as_ref());
        if let Some(applied) = ack.shape.as_ref().or(matched.as_ref().map(|(op, _)| op)) {
            self.roll_held(applied, ack.version);
        }
        let Some((op, how)) = matched else {
            debug!(op_id = ?ack.op_id, version = ack.version, "acknowledgement matched nothing pending");
            return AckOutcome::Unknown;
        };

        self.version.advance_to(ack.version);
        let mut flushed = Vec::new();
        let mut resynced = false;
        if self.pending.is_empty() {
            match self.held.take() {
                Some(held) => {
                    debug!(version = held.version, "in-flight operations settled, adopting held snapshot");
                    self.fallback.reset(held.clone());
                    self.adopt(held);
                    resynced = true;
                }
                None => flushed = self.flush_deferred(),
            }
        }
        debug!(id = %op.id, ?how, version = ack.version, pending = self.pending.len(), "operation acknowledged");
        AckOutcome::Matched {
            op,
            how,
            flushed,
            resynced,
        }
    }

    /// Replay an operation the authority applied at `version` onto the held
    /// snapshot, if it postdates it
    fn roll_held(&mut self, op: &Operation, version: u64) {
        if let Some(held) = self.held.as_mut().filter(|held| version > held.version) {
            op.apply(&mut held.content);
            held.version = version;
        }
    }

    fn flush_deferred(&mut self) -> Vec<Operation> {
        let deferred = self.reconciler.drain();
        let mut applied = Vec::with_capacity(deferred.len());
        for op in deferred {
            applied.push(apply_to_buffer(&mut self.buffer, &op));
            self.version.advance_to(op.version);
        }
        applied
    }

    /// Reconcile a full snapshot from the store or the change feed.
    ///
    /// With operations flowing, a buffer whose edits are all acknowledged is
    /// already on the authority, so it follows newer snapshots silently. Edits
    /// still in the queue will be applied by the authority on top of the
    /// snapshot, so it is held and adopted once they are acknowledged. On the
    /// snapshot path any edit since the baseline conflicts.
    pub fn receive_snapshot(&mut self, snapshot: Snapshot, author: Option<UserId>) -> SnapshotOutcome {
        if snapshot.content == self.buffer && self.pending.is_empty() {
            self.confirm_saved(&snapshot);
            return SnapshotOutcome::Unchanged;
        }

        if self.mode == SyncMode::Operations {
            if snapshot.version <= self.version.get() {
                trace!(version = snapshot.version, "stale snapshot ignored");
                return SnapshotOutcome::Unchanged;
            }
            if self.pending.is_empty() {
                self.fallback.reset(snapshot.clone());
                self.adopt(snapshot);
                return SnapshotOutcome::Adopted;
            }
            if self.held.as_ref().is_none_or(|held| snapshot.version > held.version) {
                trace!(version = snapshot.version, pending = self.pending.len(), "holding snapshot");
                self.held = Some(snapshot);
            }
            return SnapshotOutcome::Held;
        }

        match self.fallback.observe(snapshot, author, self.dirty) {
            PollOutcome::Unchanged => SnapshotOutcome::Unchanged,
            PollOutcome::Adopted(snapshot) => {
                self.adopt(snapshot);
                SnapshotOutcome::Adopted
            }
            PollOutcome::Conflict(conflict) => SnapshotOutcome::Conflict(conflict),
        }
    }

    /// Our own save came back through the change feed
    pub fn confirm_saved(&mut self, snapshot: &Snapshot) {
        self.mark_saved(&snapshot.content, Some(snapshot.version));
    }

    /// Conflict resolution: discard local edits, take the remote content
    pub fn accept_remote(&mut self) -> Result<Snapshot> {
        let snapshot = self.fallback.accept_remote().ok_or(CollabError::NoConflict)?;
        self.adopt(snapshot.clone());
        Ok(snapshot)
    }

    /// Conflict resolution: keep local edits
    pub fn ignore_remote(&mut self) -> Result<()> {
        if self.fallback.ignore_remote() {
            Ok(())
        } else {
            Err(CollabError::NoConflict)
        }
    }

    fn adopt(&mut self, snapshot: Snapshot) {
        self.buffer = snapshot.content;
        self.version.advance_to(snapshot.version);
        self.pending.clear();
        self.reconciler.clear();
        self.held = None;
        self.dirty = false;
    }

    /// Content to send on an explicit save. Blank content is refused before
    /// anything reaches the network.
    pub fn prepare_save(&self) -> Result<String> {
        if self.buffer.trim().is_empty() {
            return Err(CollabError::EmptyContent);
        }
        Ok(self.buffer.clone())
    }

    /// `content` reached the store
    pub fn mark_saved(&mut self, content: &str, version: Option<u64>) {
        self.fallback.mark_saved(content, version);
        if let Some(version) = version {
            self.version.advance_to(version);
        }
        if content == self.buffer {
            self.dirty = false;
        }
    }

    /// Push channel is gone for good: stop producing operations. Unacknowledged
    /// operations are dropped but their effect stays in the buffer for the
    /// next save; anything deferred is applied now.
    pub fn degrade_to_snapshots(&mut self) -> Vec<Operation> {
        self.mode = SyncMode::Snapshots;
        self.pending.clear();
        self.held = None;
        let flushed = self.flush_deferred();
        if !flushed.is_empty() || self.buffer != self.fallback.baseline().content {
            self.dirty = true;
        }
        flushed
    }

    /// Session ended: drop queued state
    pub fn close(&mut self) {
        self.pending.clear();
        self.reconciler.clear();
        self.held = None;
    }

    pub fn content_len(&self) -> usize {
        char_len(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(content: &str) -> SyncEngine {
        SyncEngine::new(Snapshot::new(DocumentId::new(), content, 0))
    }

    fn ack_for(op: &Operation, version: u64) -> Ack {
        Ack {
            op_id: Some(op.id),
            version,
            shape: None,
        }
    }

    #[test]
    fn test_local_edit_queues_operations() {
        let mut engine = engine("hello");
        let ops = engine.local_edit("hello world");
        assert_eq!(ops.len(), 1);
        assert_eq!(engine.content(), "hello world");
        assert_eq!(engine.pending_len(), 1);
        assert!(engine.is_dirty());
    }

    #[test]
    fn test_typing_coalesces() {
        let mut engine = engine("");
        engine.local_edit("h");
        engine.local_edit("he");
        engine.local_edit("hey");
        assert_eq!(engine.pending_len(), 1);
        assert_eq!(engine.pending().next().unwrap().text(), Some("hey"));
    }

    #[test]
    fn test_remote_delete_deferred_until_ack() {
        let mut engine = engine("hello");
        let local = engine.local_insert(5, " world");
        assert_eq!(engine.content(), "hello world");
        engine.take_outbound();

        let remote = Operation::delete(0, 5, 1);
        assert_eq!(engine.receive_remote(remote), RemoteOutcome::Deferred);
        assert_eq!(engine.content(), "hello world");
        assert_eq!(engine.deferred_len(), 1);

        let outcome = engine.acknowledge(ack_for(&local, 2));
        let AckOutcome::Matched { flushed, .. } = outcome else {
            panic!("expected match");
        };
        assert_eq!(flushed.len(), 1);
        assert_eq!(engine.content(), " world");
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.deferred_len(), 0);
        assert_eq!(engine.version(), 2);
    }

    #[test]
    fn test_unknown_ack_is_ignored() {
        let mut engine = engine("abc");
        engine.local_insert(3, "d");
        let before: Vec<Operation> = engine.pending().cloned().collect();

        let outcome = engine.acknowledge(Ack {
            op_id: Some(OpId::new()),
            version: 7,
            shape: None,
        });
        assert_eq!(outcome, AckOutcome::Unknown);
        assert_eq!(engine.pending().cloned().collect::<Vec<_>>(), before);
        assert_eq!(engine.version(), 0);
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let mut engine = engine("abc");
        let op = engine.local_insert(0, "x");
        assert!(matches!(engine.acknowledge(ack_for(&op, 1)), AckOutcome::Matched { .. }));
        assert_eq!(engine.acknowledge(ack_for(&op, 1)), AckOutcome::Unknown);
        assert_eq!(engine.version(), 1);
    }

    #[test]
    fn test_ack_by_shape() {
        let mut engine = engine("abc");
        engine.local_insert(3, "!");
        let echo = Operation::insert(3, "!", 1);
        let outcome = engine.acknowledge(Ack {
            op_id: None,
            version: 1,
            shape: Some(echo),
        });
        assert!(matches!(outcome, AckOutcome::Matched { how: AckMatch::ByShape, .. }));
    }

    #[test]
    fn test_remote_insert_rebased_past_pending() {
        let mut engine = engine("abcdef");
        engine.local_insert(1, "XX");
        assert_eq!(engine.content(), "aXXbcdef");

        let outcome = engine.receive_remote(Operation::insert(4, "q", 1));
        assert!(matches!(outcome, RemoteOutcome::Applied(_)));
        assert_eq!(engine.content(), "aXXbcdqef");
        assert_eq!(engine.version(), 1);
    }

    #[test]
    fn test_duplicate_remote_applied_once() {
        let mut engine = engine("abc");
        let remote = Operation::insert(0, "z", 1);
        engine.receive_remote(remote.clone());
        assert_eq!(engine.receive_remote(remote), RemoteOutcome::Duplicate);
        assert_eq!(engine.content(), "zabc");
    }

    #[test]
    fn test_malformed_remote_is_clamped() {
        let mut engine = engine("abc");
        let outcome = engine.receive_remote(Operation::delete(1, 99, 1));
        let RemoteOutcome::Applied(applied) = outcome else {
            panic!("expected apply");
        };
        assert_eq!(applied.delete_len(), 2);
        assert_eq!(engine.content(), "a");
    }

    #[test]
    fn test_version_never_regresses() {
        let mut engine = engine("abc");
        engine.receive_remote(Operation::insert(0, "a", 5));
        engine.receive_remote(Operation::insert(0, "b", 3));
        assert_eq!(engine.version(), 5);
    }

    #[test]
    fn test_local_base_version_waits_for_deferred() {
        let mut engine = engine("hello");
        engine.local_insert(5, "!");
        engine.receive_remote(Operation::insert(0, ">", 4));
        assert_eq!(engine.local_base_version(), 4);

        engine.receive_remote(Operation::delete(0, 1, 5));
        assert_eq!(engine.deferred_len(), 1);
        assert_eq!(engine.local_base_version(), 4);
    }

    #[test]
    fn test_snapshot_conflict_and_resolution() {
        let mut engine = engine("shared").with_mode(SyncMode::Snapshots);
        engine.local_edit("shared plus mine");

        let remote = Snapshot::new(engine.document(), "shared plus theirs", 3);
        let outcome = engine.receive_snapshot(remote.clone(), None);
        let SnapshotOutcome::Conflict(conflict) = outcome else {
            panic!("expected conflict");
        };
        assert_eq!(conflict.remote.content, "shared plus theirs");
        assert_eq!(engine.content(), "shared plus mine");

        engine.ignore_remote().unwrap();
        assert_eq!(engine.content(), "shared plus mine");
        assert!(engine.conflict().is_none());
        assert!(engine.is_dirty());
        assert!(matches!(engine.ignore_remote(), Err(CollabError::NoConflict)));
    }

    #[test]
    fn test_accept_remote_replaces_exactly() {
        let mut engine = engine("shared").with_mode(SyncMode::Snapshots);
        engine.local_edit("mine");
        engine.receive_snapshot(Snapshot::new(engine.document(), "theirs\n", 2), None);

        let adopted = engine.accept_remote().unwrap();
        assert_eq!(adopted.content, "theirs\n");
        assert_eq!(engine.content(), "theirs\n");
        assert!(!engine.is_dirty());
        assert_eq!(engine.version(), 2);
    }

    #[test]
    fn test_clean_buffer_follows_snapshots() {
        let mut engine = engine("one").with_mode(SyncMode::Snapshots);
        let outcome = engine.receive_snapshot(Snapshot::new(engine.document(), "two", 1), None);
        assert_eq!(outcome, SnapshotOutcome::Adopted);
        assert_eq!(engine.content(), "two");
    }

    #[test]
    fn test_acknowledged_buffer_follows_pushed_snapshot() {
        let mut engine = engine("draft");
        let op = engine.local_insert(5, "!");
        engine.acknowledge(ack_for(&op, 1));

        let outcome = engine.receive_snapshot(Snapshot::new(engine.document(), "saved elsewhere", 2), None);
        assert_eq!(outcome, SnapshotOutcome::Adopted);
        assert_eq!(engine.content(), "saved elsewhere");
        assert_eq!(engine.version(), 2);

        let stale = engine.receive_snapshot(Snapshot::new(engine.document(), "older", 1), None);
        assert_eq!(stale, SnapshotOutcome::Unchanged);
        assert_eq!(engine.content(), "saved elsewhere");
    }

    #[test]
    fn test_pushed_snapshot_held_while_operations_in_flight() {
        let mut engine = engine("base");
        let local = engine.local_insert(0, "my ");
        engine.take_outbound();

        let outcome = engine.receive_snapshot(Snapshot::new(engine.document(), "theirs", 1), None);
        assert_eq!(outcome, SnapshotOutcome::Held);
        assert!(engine.conflict().is_none());
        assert!(matches!(engine.accept_remote(), Err(CollabError::NoConflict)));
        assert_eq!(engine.content(), "my base");

        // The authority applied our insert on top of the snapshot
        let outcome = engine.acknowledge(Ack {
            op_id: Some(local.id),
            version: 2,
            shape: Some(Operation {
                version: 2,
                ..local.clone()
            }),
        });
        assert!(matches!(outcome, AckOutcome::Matched { resynced: true, .. }));
        assert_eq!(engine.content(), "my theirs");
        assert_eq!(engine.version(), 2);
        assert_eq!(engine.baseline().content, "my theirs");
        assert!(!engine.is_dirty());
    }

    #[test]
    fn test_held_snapshot_follows_remote_operations() {
        let mut engine = engine("base");
        let local = engine.local_insert(0, "<");
        engine.take_outbound();

        engine.receive_snapshot(Snapshot::new(engine.document(), "other", 1), None);
        engine.receive_remote(Operation::insert(5, ">", 2));
        assert_eq!(engine.content(), "<base>");

        engine.acknowledge(Ack {
            op_id: Some(local.id),
            version: 3,
            shape: Some(Operation::insert(0, "<", 3)),
        });
        assert_eq!(engine.content(), "<other>");
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.deferred_len(), 0);
    }

    #[test]
    fn test_snapshot_mode_produces_no_operations() {
        let mut engine = engine("a").with_mode(SyncMode::Snapshots);
        assert!(engine.local_edit("ab").is_empty());
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.content(), "ab");
    }

    #[test]
    fn test_empty_save_refused() {
        let mut engine = engine("text");
        engine.local_edit("   \n");
        assert!(matches!(engine.prepare_save(), Err(CollabError::EmptyContent)));
        engine.local_edit("text again");
        assert_eq!(engine.prepare_save().unwrap(), "text again");
    }

    #[test]
    fn test_mark_saved_clears_dirty() {
        let mut engine = engine("a");
        engine.local_edit("ab");
        engine.mark_saved("ab", Some(3));
        assert!(!engine.is_dirty());
        assert_eq!(engine.version(), 3);
        assert_eq!(engine.baseline().content, "ab");
    }

    #[test]
    fn test_degrade_keeps_local_edits() {
        let mut engine = engine("hello");
        engine.local_insert(5, "!");
        engine.receive_remote(Operation::delete(0, 1, 1));
        assert_eq!(engine.deferred_len(), 1);

        let flushed = engine.degrade_to_snapshots();
        assert_eq!(flushed.len(), 1);
        assert_eq!(engine.content(), "ello!");
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.mode(), SyncMode::Snapshots);
        assert!(engine.is_dirty());
    }
}
