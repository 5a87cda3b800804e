//! Coalescing and debounced batching of outbound edits

use std::time::Duration;

use tokio::time::Instant;

use crate::operation::{OpKind, Operation};

/// Merge `next` into `prev` when `next` directly continues it.
///
/// - typing: insert right after the previous insert's text
/// - backspace: delete ending where the previous delete started
/// - forward delete: delete at the same position as the previous one
///
/// The merged operation keeps `prev`'s id and version.
pub fn coalesce(prev: &Operation, next: &Operation) -> Option<Operation> {
    match (&prev.kind, &next.kind) {
        (OpKind::Insert { text }, OpKind::Insert { text: more }) => {
            if next.position != prev.position + prev.insert_len() {
                return None;
            }
            let mut merged = prev.clone();
            merged.kind = OpKind::Insert { text: format!("{text}{more}") };
            Some(merged)
        }
        (OpKind::Delete { len }, OpKind::Delete { len: more }) => {
            let position = if next.position + more == prev.position {
                next.position
            } else if next.position == prev.position {
                prev.position
            } else {
                return None;
            };
            let mut merged = prev.clone();
            merged.position = position;
            merged.kind = OpKind::Delete { len: len + more };
            Some(merged)
        }
        _ => None,
    }
}

/// Debounce timer for outbound transmission.
///
/// Each edit pushes the deadline out by `window`, but never past `max_delay`
/// after the first edit of the batch.
#[derive(Debug, Clone)]
pub struct Batcher {
    window: Duration,
    max_delay: Duration,
    threshold: usize,
    first: Option<Instant>,
    last: Option<Instant>,
}

impl Batcher {
    pub fn new(window: Duration, max_delay: Duration, threshold: usize) -> Self {
        Self {
            window,
            max_delay,
            threshold,
            first: None,
            last: None,
        }
    }

    /// Note an edit made at `now`
    pub fn record(&mut self, now: Instant) {
        self.first.get_or_insert(now);
        self.last = Some(now);
    }

    /// When the current batch should go out, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first?;
        let last = self.last.unwrap_or(first);
        Some((last + self.window).min(first + self.max_delay))
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| deadline <= now)
    }

    /// Too many unacknowledged operations: skip the debounce
    pub fn over_threshold(&self, pending: usize) -> bool {
        pending > self.threshold
    }

    /// Batch sent
    pub fn reset(&mut self) {
        self.first = None;
        self.last = None;
    }
}
