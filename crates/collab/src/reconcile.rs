//! Applying remote operations to the local buffer
//!
//! A rebased remote delete is held back while local edits are still
//! unacknowledged: applying it against optimistic local state compounds
//! position errors. Once something is held back, later remote operations queue
//! behind it so they still land in the order the authority sent them.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, warn};

use crate::operation::{char_len, OpId, Operation};
use crate::transform::{transform_with, Tie};

/// How many remote operation ids to remember for duplicate detection
const SEEN_CAPACITY: usize = 1024;

/// What happened to an admitted remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Safe to apply now
    Apply(Operation),
    /// Parked in the deferred queue
    Deferred,
}

/// Deferred queue plus duplicate filter for remote operations
#[derive(Debug, Default)]
pub struct Reconciler {
    deferred: VecDeque<Operation>,
    seen: HashSet<OpId>,
    seen_order: VecDeque<OpId>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a remote id. Returns false if it was already delivered.
    pub fn first_delivery(&mut self, id: OpId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Decide whether a rebased remote operation may be applied now
    pub fn admit(&mut self, rebased: Operation, pending_empty: bool) -> Admission {
        let defer = !pending_empty && (rebased.is_delete() || !self.deferred.is_empty());
        if defer {
            debug!(op = %rebased, queued = self.deferred.len() + 1, "deferring remote operation");
            self.deferred.push_back(rebased);
            Admission::Deferred
        } else {
            Admission::Apply(rebased)
        }
    }

    /// A new local edit lands before anything deferred, so shift them past it
    pub fn rebase_deferred(&mut self, local: &Operation) {
        for op in self.deferred.iter_mut() {
            *op = transform_with(op, local, Tie::Shift);
        }
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn deferred(&self) -> impl Iterator<Item = &Operation> {
        self.deferred.iter()
    }

    /// Version of the oldest deferred operation
    pub fn oldest_deferred_version(&self) -> Option<u64> {
        self.deferred.front().map(|op| op.version)
    }

    /// Take every deferred operation in arrival order
    pub fn drain(&mut self) -> Vec<Operation> {
        self.deferred.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.deferred.clear();
    }
}

/// Apply `op` to `buffer`, clamping it into bounds first
pub fn apply_to_buffer(buffer: &mut String, op: &Operation) -> Operation {
    let len = char_len(buffer);
    if !op.fits(len) {
        warn!(op = %op, content_len = len, "remote operation out of bounds, clamping");
    }
    op.apply(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserts_apply_with_pending() {
        let mut reconciler = Reconciler::new();
        let op = Operation::insert(0, "x", 1);
        assert_eq!(reconciler.admit(op.clone(), false), Admission::Apply(op));
    }

    #[test]
    fn test_deletes_defer_only_with_pending() {
        let mut reconciler = Reconciler::new();
        let op = Operation::delete(0, 2, 1);
        assert_eq!(reconciler.admit(op.clone(), true), Admission::Apply(op.clone()));
        assert_eq!(reconciler.admit(op, false), Admission::Deferred);
        assert_eq!(reconciler.deferred_len(), 1);
    }

    #[test]
    fn test_later_ops_queue_behind_deferred() {
        let mut reconciler = Reconciler::new();
        reconciler.admit(Operation::delete(0, 2, 1), false);
        assert_eq!(reconciler.admit(Operation::insert(0, "y", 2), false), Admission::Deferred);

        let drained = reconciler.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].is_delete());
        assert!(drained[1].is_insert());
        assert_eq!(reconciler.deferred_len(), 0);
    }

    #[test]
    fn test_rebase_deferred_against_local_edit() {
        let mut reconciler = Reconciler::new();
        reconciler.admit(Operation::delete(4, 2, 1), false);
        reconciler.rebase_deferred(&Operation::insert(1, "abc", 0));
        assert_eq!(reconciler.deferred().next().unwrap().position, 7);
    }

    #[test]
    fn test_duplicate_delivery() {
        let mut reconciler = Reconciler::new();
        let id = OpId::new();
        assert!(reconciler.first_delivery(id));
        assert!(!reconciler.first_delivery(id));
    }

    #[test]
    fn test_apply_clamps_malformed() {
        let mut buffer = String::from("abc");
        let applied = apply_to_buffer(&mut buffer, &Operation::delete(2, 40, 1));
        assert_eq!(buffer, "ab");
        assert_eq!(applied.delete_len(), 1);
    }
}
