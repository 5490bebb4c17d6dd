use std::cmp::Ordering;

use crate::types::{ItemId, Result};

/// Traversal order of an ordered scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum ScanDirection {
    /// Smallest key first.
    #[default]
    Ascending,
    /// Largest key first.
    Descending,
}

/// Streaming interface over item identifiers.
pub trait PostingStream {
    /// Pushes up to `max` identifiers into `out`, returning `true` when additional
    /// data remains and `false` once the stream is exhausted.
    fn next_batch(&mut self, out: &mut Vec<ItemId>, max: usize) -> Result<bool>;
}

/// Intersection of two ascending, duplicate-free id lists.
pub fn intersect_sorted(left: &[ItemId], right: &[ItemId]) -> Vec<ItemId> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(left.len().min(right.len()));
    while i < left.len() && j < right.len() {
        match left[i].cmp(&right[j]) {
            Ordering::Equal => {
                out.push(left[i]);
                i += 1;
                j += 1;
            }
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
        }
    }
    out
}

/// Union of two ascending, duplicate-free id lists.
pub fn union_sorted(left: &[ItemId], right: &[ItemId]) -> Vec<ItemId> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(left.len() + right.len());
    while i < left.len() && j < right.len() {
        match left[i].cmp(&right[j]) {
            Ordering::Equal => {
                out.push(left[i]);
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                out.push(left[i]);
                i += 1;
            }
            Ordering::Greater => {
                out.push(right[j]);
                j += 1;
            }
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
    out
}

/// Ids of `left` that are absent from `right`; both ascending and duplicate-free.
pub fn difference_sorted(left: &[ItemId], right: &[ItemId]) -> Vec<ItemId> {
    let mut j = 0;
    let mut out = Vec::with_capacity(left.len());
    for id in left {
        while j < right.len() && right[j] < *id {
            j += 1;
        }
        if j < right.len() && right[j] == *id {
            continue;
        }
        out.push(*id);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> Vec<ItemId> {
        raw.iter().copied().map(ItemId).collect()
    }

    #[test]
    fn set_operations_on_sorted_ids() {
        let a = ids(&[1, 3, 5, 7]);
        let b = ids(&[3, 4, 5, 8]);
        assert_eq!(intersect_sorted(&a, &b), ids(&[3, 5]));
        assert_eq!(union_sorted(&a, &b), ids(&[1, 3, 4, 5, 7, 8]));
        assert_eq!(difference_sorted(&a, &b), ids(&[1, 7]));
        assert_eq!(difference_sorted(&a, &[]), a);
        assert!(intersect_sorted(&a, &[]).is_empty());
    }
}
