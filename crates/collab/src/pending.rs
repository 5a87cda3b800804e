//! Pending queue of local, unacknowledged operations

use std::collections::VecDeque;

use crate::coalesce::coalesce;
use crate::operation::{OpId, Operation};
use crate::transform::{transform, transform_all_with, Tie};

/// A queued local operation
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Current form, rebased against every remote operation seen since it
    /// was created. This is what the authority's echo will look like.
    pub op: Operation,
    /// Form handed to the transport, used on resend
    wire: Operation,
    /// Handed to the transport (or fixed for sending); no more coalescing
    sealed: bool,
}

impl PendingEntry {
    fn new(op: Operation) -> Self {
        Self {
            wire: op.clone(),
            op,
            sealed: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}

/// How an acknowledgement found its entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMatch {
    ById,
    ByShape,
}

/// Result of queueing a local operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queued {
    Appended,
    Merged,
}

/// FIFO of local operations the authority hasn't confirmed yet
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingEntry>,
    /// Sealed operations waiting to be handed to the transport
    outbox: Vec<Operation>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter().map(|entry| &entry.op)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.iter()
    }

    /// Anything waiting for transmission?
    pub fn has_outbound(&self) -> bool {
        !self.outbox.is_empty() || self.entries.iter().any(|entry| !entry.sealed)
    }

    /// Queue a local operation, merging it into the unsent tail when it
    /// continues that edit.
    pub fn push(&mut self, op: Operation) -> Queued {
        if let Some(tail) = self.entries.back_mut().filter(|tail| !tail.sealed) {
            if let Some(merged) = coalesce(&tail.op, &op) {
                tail.wire = merged.clone();
                tail.op = merged;
                return Queued::Merged;
            }
        }
        self.entries.push_back(PendingEntry::new(op));
        Queued::Appended
    }

    /// Fix every unsent entry for transmission in its current form
    pub fn seal(&mut self) {
        for entry in self.entries.iter_mut().filter(|entry| !entry.sealed) {
            entry.sealed = true;
            self.outbox.push(entry.wire.clone());
        }
    }

    /// Everything that should go out now, in queue order
    pub fn take_outbound(&mut self) -> Vec<Operation> {
        self.seal();
        std::mem::take(&mut self.outbox)
    }

    /// Wire forms of every unacknowledged entry, for a reconnected transport
    pub fn resend_all(&mut self) -> Vec<Operation> {
        self.outbox.clear();
        for entry in self.entries.iter_mut() {
            entry.sealed = true;
        }
        self.entries.iter().map(|entry| entry.wire.clone()).collect()
    }

    /// Rebase a remote operation through the queue.
    ///
    /// The remote operation is transformed against every queued operation in
    /// order; it yields on insert ties because the authority placed it first.
    /// Each queued operation is separately rebased against the original remote
    /// operation so later acknowledgements still match by shape.
    pub fn rebase_remote(&mut self, remote: &Operation) -> Operation {
        self.seal();
        let rebased = transform_all_with(remote, self.entries.iter().map(|entry| &entry.op), Tie::Shift);
        for entry in self.entries.iter_mut() {
            entry.op = transform(&entry.op, remote);
        }
        rebased
    }

    /// Remove the entry an acknowledgement refers to: by id first, then by shape.
    pub fn acknowledge(&mut self, id: Option<OpId>, shape: Option<&Operation>) -> Option<(Operation, AckMatch)> {
        let by_id = id.and_then(|id| self.entries.iter().position(|entry| entry.op.id == id));
        let (index, matched) = match by_id {
            Some(index) => (index, AckMatch::ById),
            None => {
                let shape = shape?;
                let index = self.entries.iter().position(|entry| entry.op.same_shape(shape))?;
                (index, AckMatch::ByShape)
            }
        };

        let entry = self.entries.remove(index)?;
        self.outbox.retain(|op| op.id != entry.op.id);
        Some((entry.op, matched))
    }

    /// Drop everything, e.g. when local edits are discarded
    pub fn clear(&mut self) {
        self.entries.clear();
        self.outbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_coalesces_into_one_entry() {
        let mut queue = PendingQueue::new();
        assert_eq!(queue.push(Operation::insert(0, "h", 0)), Queued::Appended);
        assert_eq!(queue.push(Operation::insert(1, "i", 0)), Queued::Merged);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.iter().next().unwrap().text(), Some("hi"));
    }

    #[test]
    fn test_sealed_tail_is_not_merged() {
        let mut queue = PendingQueue::new();
        queue.push(Operation::insert(0, "h", 0));
        let sent = queue.take_outbound();
        assert_eq!(sent.len(), 1);

        assert_eq!(queue.push(Operation::insert(1, "i", 0)), Queued::Appended);
        assert_eq!(queue.len(), 2);
        assert!(queue.has_outbound());
        assert_eq!(queue.take_outbound().len(), 1);
        assert!(!queue.has_outbound());
    }

    #[test]
    fn test_ack_by_id() {
        let mut queue = PendingQueue::new();
        let first = Operation::insert(0, "a", 0);
        let second = Operation::delete(5, 1, 0);
        let first_id = first.id;
        queue.push(first);
        queue.push(second);

        let (op, how) = queue.acknowledge(Some(first_id), None).unwrap();
        assert_eq!(op.id, first_id);
        assert_eq!(how, AckMatch::ById);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_ack_by_shape_when_id_unknown() {
        let mut queue = PendingQueue::new();
        queue.push(Operation::insert(4, "xy", 0));

        let echo = Operation::insert(4, "xy", 9);
        let (_, how) = queue.acknowledge(None, Some(&echo)).unwrap();
        assert_eq!(how, AckMatch::ByShape);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unknown_ack_leaves_queue_alone() {
        let mut queue = PendingQueue::new();
        queue.push(Operation::insert(4, "xy", 0));

        assert!(queue.acknowledge(Some(OpId::new()), None).is_none());
        assert!(queue.acknowledge(Some(OpId::new()), Some(&Operation::delete(0, 1, 0))).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_rebase_remote_moves_both_sides() {
        let mut queue = PendingQueue::new();
        queue.push(Operation::insert(2, "ab", 0));

        let remote = Operation::insert(6, "Z", 1);
        let rebased = queue.rebase_remote(&remote);
        assert_eq!(rebased.position, 8);
        assert_eq!(queue.iter().next().unwrap().position, 2);

        let remote = Operation::delete(0, 1, 2);
        let rebased = queue.rebase_remote(&remote);
        assert_eq!(rebased.position, 0);
        assert_eq!(queue.iter().next().unwrap().position, 1);
    }

    #[test]
    fn test_rebase_seals_unsent_entries_in_original_form() {
        let mut queue = PendingQueue::new();
        queue.push(Operation::insert(5, "!", 0));
        queue.rebase_remote(&Operation::insert(0, "abc", 1));

        // Rebased copy tracks the authority's view, the wire copy doesn't
        assert_eq!(queue.iter().next().unwrap().position, 8);
        let sent = queue.take_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].position, 5);
        assert_eq!(sent[0].version, 0);
    }

    #[test]
    fn test_resend_all_returns_wire_forms() {
        let mut queue = PendingQueue::new();
        queue.push(Operation::insert(0, "a", 0));
        queue.take_outbound();
        queue.push(Operation::delete(3, 1, 0));

        let resend = queue.resend_all();
        assert_eq!(resend.len(), 2);
        assert!(!queue.has_outbound());
    }
}
