//! Operational transformation
//!
//! `transform(a, b)` rewrites `a` so it has the same intent when applied after
//! `b`. Inputs are never modified.
//!
//! Ties between two inserts at the same position are where clients can drift
//! apart. [`transform`] always lets the operation being transformed keep its
//! position; [`transform_with`] lets the caller pick, which the rebase path
//! uses so that every replica orders same-position inserts the way the
//! authority did.

use crate::operation::{OpKind, Operation};

/// What an insert does when it meets another insert at the same position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    /// Keep the position, landing before the other insert's text
    Keep,
    /// Move past the other insert's text
    Shift,
}

/// Rebase `op` as if `against` had already been applied. Ties keep `op` in place.
pub fn transform(op: &Operation, against: &Operation) -> Operation {
    transform_with(op, against, Tie::Keep)
}

/// [`transform`] with an explicit insert/insert tie policy
pub fn transform_with(op: &Operation, against: &Operation, tie: Tie) -> Operation {
    let mut result = op.clone();

    match (&mut result.kind, &against.kind) {
        (OpKind::Insert { .. }, OpKind::Insert { text }) => {
            let shift = op.position > against.position
                || (op.position == against.position && tie == Tie::Shift);
            if shift {
                result.position += text.chars().count();
            }
        }
        (OpKind::Insert { .. }, OpKind::Delete { len }) => {
            if op.position > against.position {
                result.position = op.position.saturating_sub(*len);
            }
        }
        (OpKind::Delete { .. }, OpKind::Insert { text }) => {
            if op.position >= against.position {
                result.position += text.chars().count();
            }
        }
        (OpKind::Delete { len }, OpKind::Delete { len: other_len }) => {
            if op.position > against.position {
                result.position = op.position.saturating_sub(*other_len);
            } else if op.position == against.position {
                // Overlapping deletes collapse, never below zero
                *len -= (*len).min(*other_len);
            }
        }
    }

    result
}

/// Rebase `op` against each of `ops` in order
pub fn transform_all<'a>(op: &Operation, ops: impl IntoIterator<Item = &'a Operation>) -> Operation {
    transform_all_with(op, ops, Tie::Keep)
}

/// [`transform_all`] with an explicit tie policy
pub fn transform_all_with<'a>(
    op: &Operation,
    ops: impl IntoIterator<Item = &'a Operation>,
    tie: Tie,
) -> Operation {
    ops.into_iter()
        .fold(op.clone(), |acc, against| transform_with(&acc, against, tie))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::apply_all;

    fn ins(pos: usize, text: &str) -> Operation {
        Operation::insert(pos, text, 0)
    }

    fn del(pos: usize, len: usize) -> Operation {
        Operation::delete(pos, len, 0)
    }

    /// Applying `a` then `b'` must equal applying `b` then `a'`
    fn assert_converges(doc: &str, a: &Operation, b: &Operation) {
        let via_a = apply_all(doc, [a, &transform_with(b, a, Tie::Shift)]);
        let via_b = apply_all(doc, [b, &transform(a, b)]);
        assert_eq!(via_a, via_b, "a={a} b={b}");
    }

    #[test]
    fn test_insert_insert() {
        assert_eq!(transform(&ins(2, "x"), &ins(5, "abc")).position, 2);
        assert_eq!(transform(&ins(7, "x"), &ins(5, "abc")).position, 10);
        assert_eq!(transform(&ins(5, "x"), &ins(5, "abc")).position, 5);
        assert_eq!(transform_with(&ins(5, "x"), &ins(5, "abc"), Tie::Shift).position, 8);
    }

    #[test]
    fn test_insert_delete() {
        assert_eq!(transform(&ins(3, "x"), &del(3, 2)).position, 3);
        assert_eq!(transform(&ins(2, "x"), &del(3, 2)).position, 2);
        assert_eq!(transform(&ins(9, "x"), &del(3, 2)).position, 7);
    }

    #[test]
    fn test_delete_insert() {
        assert_eq!(transform(&del(2, 1), &ins(5, "ab")).position, 2);
        assert_eq!(transform(&del(5, 1), &ins(5, "ab")).position, 7);
        assert_eq!(transform(&del(8, 1), &ins(5, "ab")).position, 10);
    }

    #[test]
    fn test_delete_delete() {
        assert_eq!(transform(&del(1, 2), &del(5, 3)).position, 1);
        assert_eq!(transform(&del(9, 2), &del(5, 3)).position, 6);

        let collapsed = transform(&del(5, 4), &del(5, 3));
        assert_eq!(collapsed.position, 5);
        assert_eq!(collapsed.delete_len(), 1);
    }

    #[test]
    fn test_identical_deletes_collapse_to_zero() {
        let result = transform(&del(5, 10), &del(5, 10));
        assert_eq!(result.delete_len(), 0);
        assert!(result.is_noop());

        let result = transform(&del(5, 3), &del(5, 10));
        assert_eq!(result.delete_len(), 0);
    }

    #[test]
    fn test_inputs_untouched() {
        let a = ins(7, "x");
        let b = del(1, 3);
        let before = (a.clone(), b.clone());
        let out = transform(&a, &b);
        assert_eq!((a, b), before);
        assert_eq!(out.id, before.0.id);
    }

    #[test]
    fn test_ties_are_deterministic() {
        let a = ins(4, "left");
        let b = ins(4, "right");
        let first = transform(&a, &b);
        for _ in 0..100 {
            assert_eq!(transform(&a, &b), first);
        }

        let d1 = del(4, 6);
        let d2 = del(4, 2);
        let first = transform(&d1, &d2);
        for _ in 0..100 {
            assert_eq!(transform(&d1, &d2), first);
        }
    }

    #[test]
    fn test_convergence_insert_insert() {
        assert_converges("abcdefgh", &ins(2, "XY"), &ins(6, "Z"));
        assert_converges("abcdefgh", &ins(6, "XY"), &ins(2, "Z"));
        assert_converges("abcdefgh", &ins(3, "XY"), &ins(3, "Z"));
    }

    #[test]
    fn test_convergence_insert_delete() {
        assert_converges("abcdefgh", &ins(1, "XY"), &del(4, 3));
        assert_converges("abcdefgh", &ins(7, "XY"), &del(1, 3));
    }

    #[test]
    fn test_convergence_delete_insert() {
        assert_converges("abcdefgh", &del(0, 2), &ins(5, "Q"));
        assert_converges("abcdefgh", &del(5, 2), &ins(1, "Q"));
    }

    #[test]
    fn test_convergence_delete_delete() {
        assert_converges("abcdefgh", &del(0, 2), &del(5, 2));
        assert_converges("abcdefgh", &del(6, 2), &del(1, 3));
        assert_converges("abcdefgh", &del(3, 2), &del(3, 4));
    }

    #[test]
    fn test_transform_all_folds_in_order() {
        let op = ins(10, "!");
        let result = transform_all(&op, [&ins(0, "ab"), &del(0, 1)]);
        assert_eq!(result.position, 11);
    }
}
