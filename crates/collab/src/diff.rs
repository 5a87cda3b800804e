//! Local edit diffing
//!
//! Turns an old/new content pair into at most two operations by trimming the
//! common prefix and suffix. One edit burst between snapshots is the expected
//! input, so a multi-region paste comes out as a single replace spanning all
//! of it rather than a minimal edit script.

use crate::operation::Operation;

/// Span of the edit between two contents, in chars
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditSpan {
    /// Length of the common prefix
    pub prefix: usize,
    /// Chars removed from the old content after the prefix
    pub removed: usize,
    /// Chars added in the new content after the prefix
    pub added: usize,
}

impl EditSpan {
    /// Locate the changed middle. `prefix + suffix` never exceeds the shorter input.
    pub fn between(old: &[char], new: &[char]) -> Self {
        let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
        let suffix = old[prefix..]
            .iter()
            .rev()
            .zip(new[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        Self {
            prefix,
            removed: old.len() - prefix - suffix,
            added: new.len() - prefix - suffix,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed == 0 && self.added == 0
    }
}

/// Derive the operations that turn `old` into `new`, stamped with `version`.
///
/// A replacement yields the delete first, then the insert at the same position.
pub fn diff(old: &str, new: &str, version: u64) -> Vec<Operation> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();
    let span = EditSpan::between(&old_chars, &new_chars);

    let mut ops = Vec::with_capacity(2);
    if span.removed > 0 {
        ops.push(Operation::delete(span.prefix, span.removed, version));
    }
    if span.added > 0 {
        let text: String = new_chars[span.prefix..span.prefix + span.added].iter().collect();
        ops.push(Operation::insert(span.prefix, text, version));
    }
    ops
}
