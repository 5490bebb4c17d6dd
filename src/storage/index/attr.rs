use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::types::{AssocError, IndexKey, ItemId, Result, Value, ValueKind};

use super::types::ScanDirection;

/// A `(key, item)` posting, the unit of index change.
pub type Posting = (IndexKey, ItemId);

/// Forward index of one attribute: value -> owning items.
///
/// For reference-valued attributes the key is the target item, so the same map
/// answers reverse lookups (`"-attribute"` traversal): target -> referencing items.
#[derive(Debug)]
pub struct AttributeEntries {
    attribute: String,
    kind: Option<ValueKind>,
    forward: BTreeMap<IndexKey, BTreeSet<ItemId>>,
    postings: usize,
}

impl AttributeEntries {
    /// Empty index for `attribute`; its kind is fixed by the first insert.
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            kind: None,
            forward: BTreeMap::new(),
            postings: 0,
        }
    }

    /// Name of the indexed attribute.
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Kind of every value under this attribute; `None` while empty.
    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    /// Number of `(value, item)` postings.
    pub fn posting_count(&self) -> usize {
        self.postings
    }

    /// Number of distinct keys.
    pub fn distinct_values(&self) -> usize {
        self.forward.len()
    }

    /// Whether no item holds a value.
    pub fn is_empty(&self) -> bool {
        self.postings == 0
    }

    /// Returns `false` when the index is empty (nothing can match) and fails with
    /// `TypeMismatchInComparison` when `value` is of another kind.
    pub fn check_comparable(&self, value: &Value) -> Result<bool> {
        value.validate()?;
        match self.kind {
            None => Ok(false),
            Some(expected) if expected != value.kind() => {
                Err(AssocError::TypeMismatchInComparison {
                    attribute: self.attribute.clone(),
                    expected,
                    found: value.kind(),
                })
            }
            Some(_) => Ok(true),
        }
    }

    /// Items holding `value`, ascending by id.
    pub fn lookup(&self, value: &Value) -> Result<Vec<ItemId>> {
        if !self.check_comparable(value)? {
            return Ok(Vec::new());
        }
        Ok(self
            .forward
            .get(&IndexKey(value.clone()))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Items holding a value within the bounds, in value order. An item with
    /// several matching values is reported at its first (smallest) one.
    pub fn range(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Result<Vec<ItemId>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        self.for_each_in_range(lower, upper, |_, items| {
            for item in items {
                if seen.insert(*item) {
                    out.push(*item);
                }
            }
            true
        })?;
        Ok(out)
    }

    /// Items holding a value within the bounds, ascending by id.
    pub fn range_ids(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Result<Vec<ItemId>> {
        let mut set = BTreeSet::new();
        self.for_each_in_range(lower, upper, |_, items| {
            set.extend(items.iter().copied());
            true
        })?;
        Ok(set.into_iter().collect())
    }

    /// Items referencing `target` through this attribute, ascending by id.
    pub fn reverse_lookup(&self, target: ItemId) -> Vec<ItemId> {
        self.forward
            .get(&IndexKey(Value::Ref(target)))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Items with at least one value, ascending by id.
    pub fn all_items(&self) -> Vec<ItemId> {
        let mut set = BTreeSet::new();
        for items in self.forward.values() {
            set.extend(items.iter().copied());
        }
        set.into_iter().collect()
    }

    /// Exact posting count for `value`.
    pub fn estimate_eq(&self, value: &Value) -> usize {
        self.forward
            .get(&IndexKey(value.clone()))
            .map_or(0, BTreeSet::len)
    }

    /// Counts postings within the bounds, stopping once `cap` is reached.
    pub fn estimate_range(&self, lower: Bound<&Value>, upper: Bound<&Value>, cap: usize) -> usize {
        let mut total = 0usize;
        // Kind mismatches surface during evaluation, not estimation.
        let _ = self.for_each_in_range(lower, upper, |_, items| {
            total += items.len();
            total < cap
        });
        total.min(cap)
    }

    /// Up to `max_keys` keys strictly after `cursor` in scan order, with their items.
    pub fn keys_after(
        &self,
        cursor: Option<&IndexKey>,
        direction: ScanDirection,
        max_keys: usize,
    ) -> Vec<(IndexKey, Vec<ItemId>)> {
        let bounds: (Bound<&IndexKey>, Bound<&IndexKey>) = match (direction, cursor) {
            (_, None) => (Bound::Unbounded, Bound::Unbounded),
            (ScanDirection::Ascending, Some(key)) => (Bound::Excluded(key), Bound::Unbounded),
            (ScanDirection::Descending, Some(key)) => (Bound::Unbounded, Bound::Excluded(key)),
        };
        let collect = |(key, items): (&IndexKey, &BTreeSet<ItemId>)| {
            (key.clone(), items.iter().copied().collect::<Vec<_>>())
        };
        let range = self.forward.range::<IndexKey, _>(bounds);
        match direction {
            ScanDirection::Ascending => range.take(max_keys).map(collect).collect(),
            ScanDirection::Descending => range.rev().take(max_keys).map(collect).collect(),
        }
    }

    /// Validates that applying the batch keeps a single value kind.
    pub(crate) fn check_batch(&self, removed: &BTreeSet<Posting>, added: &BTreeSet<Posting>) -> Result<()> {
        let mut added_kind: Option<ValueKind> = None;
        for (key, _) in added {
            let kind = key.value().kind();
            match added_kind {
                None => added_kind = Some(kind),
                Some(expected) if expected != kind => {
                    return Err(AssocError::InvalidAttributeKind {
                        attribute: self.attribute.clone(),
                        expected,
                        found: kind,
                    })
                }
                Some(_) => {}
            }
        }
        let (Some(current), Some(incoming)) = (self.kind, added_kind) else {
            return Ok(());
        };
        if current == incoming {
            return Ok(());
        }
        let surviving = self.postings - removed.iter().filter(|p| self.contains(p)).count();
        if surviving == 0 {
            Ok(())
        } else {
            Err(AssocError::InvalidAttributeKind {
                attribute: self.attribute.clone(),
                expected: current,
                found: incoming,
            })
        }
    }

    /// Applies a validated batch: removals first, then additions.
    pub(crate) fn apply_batch(&mut self, removed: &BTreeSet<Posting>, added: &BTreeSet<Posting>) {
        for (key, item) in removed {
            self.remove(key, *item);
        }
        for (key, item) in added {
            self.insert(key.clone(), *item);
        }
    }

    pub(crate) fn insert(&mut self, key: IndexKey, item: ItemId) {
        if self.kind.is_none() {
            self.kind = Some(key.value().kind());
        }
        if self.forward.entry(key).or_default().insert(item) {
            self.postings += 1;
        }
    }

    pub(crate) fn remove(&mut self, key: &IndexKey, item: ItemId) {
        let Some(items) = self.forward.get_mut(key) else {
            return;
        };
        if items.remove(&item) {
            self.postings -= 1;
        }
        if items.is_empty() {
            self.forward.remove(key);
        }
        if self.forward.is_empty() {
            self.kind = None;
        }
    }

    fn contains(&self, (key, item): &Posting) -> bool {
        self.forward
            .get(key)
            .is_some_and(|items| items.contains(item))
    }

    fn for_each_in_range<F>(&self, lower: Bound<&Value>, upper: Bound<&Value>, mut visit: F) -> Result<()>
    where
        F: FnMut(&IndexKey, &BTreeSet<ItemId>) -> bool,
    {
        for bound in [lower, upper] {
            if let Bound::Included(v) | Bound::Excluded(v) = bound {
                if !self.check_comparable(v)? {
                    return Ok(());
                }
            }
        }
        let lower = owned_bound(lower);
        let upper = owned_bound(upper);
        if range_is_empty(&lower, &upper) {
            return Ok(());
        }
        for (key, items) in self.forward.range((lower, upper)) {
            if !visit(key, items) {
                break;
            }
        }
        Ok(())
    }
}

fn owned_bound(bound: Bound<&Value>) -> Bound<IndexKey> {
    match bound {
        Bound::Included(v) => Bound::Included(IndexKey(v.clone())),
        Bound::Excluded(v) => Bound::Excluded(IndexKey(v.clone())),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// `BTreeMap::range` panics on inverted bounds; those simply match nothing.
fn range_is_empty(lower: &Bound<IndexKey>, upper: &Bound<IndexKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
        (Bound::Included(lo), Bound::Excluded(hi))
        | (Bound::Excluded(lo), Bound::Included(hi))
        | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries_with(values: &[(i64, u64)]) -> AttributeEntries {
        let mut entries = AttributeEntries::new("age");
        for (value, item) in values {
            entries.insert(IndexKey(Value::Int(*value)), ItemId(*item));
        }
        entries
    }

    #[test]
    fn lookup_and_range_respect_bounds() -> Result<()> {
        let entries = entries_with(&[(30, 1), (55, 2), (55, 3), (70, 4), (41, 5)]);
        assert_eq!(entries.lookup(&Value::Int(55))?, vec![ItemId(2), ItemId(3)]);
        assert_eq!(
            entries.range(Bound::Excluded(&Value::Int(40)), Bound::Unbounded)?,
            vec![ItemId(5), ItemId(2), ItemId(3), ItemId(4)]
        );
        assert_eq!(
            entries.range_ids(Bound::Included(&Value::Int(41)), Bound::Included(&Value::Int(55)))?,
            vec![ItemId(2), ItemId(3), ItemId(5)]
        );
        assert!(entries
            .range(Bound::Included(&Value::Int(60)), Bound::Included(&Value::Int(50)))?
            .is_empty());
        assert!(entries
            .range(Bound::Excluded(&Value::Int(55)), Bound::Excluded(&Value::Int(55)))?
            .is_empty());
        Ok(())
    }

    #[test]
    fn comparing_across_kinds_fails_fast() {
        let entries = entries_with(&[(1, 1)]);
        let err = entries.lookup(&Value::from("1")).unwrap_err();
        assert!(matches!(err, AssocError::TypeMismatchInComparison { .. }));
        let empty = AttributeEntries::new("name");
        assert!(empty.lookup(&Value::Int(1)).unwrap().is_empty());
    }

    #[test]
    fn kind_resets_when_index_empties() -> Result<()> {
        let mut entries = entries_with(&[(1, 1)]);
        assert_eq!(entries.kind(), Some(ValueKind::Number));
        let keep = BTreeSet::new();
        let other = BTreeSet::from([(IndexKey(Value::from("one")), ItemId(2))]);
        assert!(entries.check_batch(&keep, &other).is_err());

        let removed = BTreeSet::from([(IndexKey(Value::Int(1)), ItemId(1))]);
        let added = BTreeSet::from([(IndexKey(Value::from("one")), ItemId(1))]);
        entries.check_batch(&removed, &added)?;
        entries.apply_batch(&removed, &added);
        assert_eq!(entries.kind(), Some(ValueKind::String));
        assert_eq!(entries.posting_count(), 1);
        Ok(())
    }

    #[test]
    fn batch_rejects_mixed_kinds_while_values_survive() {
        let entries = entries_with(&[(1, 1), (2, 2)]);
        let removed = BTreeSet::from([(IndexKey(Value::Int(1)), ItemId(1))]);
        let added = BTreeSet::from([(IndexKey(Value::Bool(true)), ItemId(1))]);
        assert!(matches!(
            entries.check_batch(&removed, &added),
            Err(AssocError::InvalidAttributeKind { .. })
        ));
    }

    #[test]
    fn keys_after_walks_both_directions() {
        let entries = entries_with(&[(1, 9), (2, 8), (3, 7)]);
        let first = entries.keys_after(None, ScanDirection::Ascending, 2);
        assert_eq!(first.len(), 2);
        let rest = entries.keys_after(Some(&first[1].0), ScanDirection::Ascending, 10);
        assert_eq!(rest, vec![(IndexKey(Value::Int(3)), vec![ItemId(7)])]);
        let desc = entries.keys_after(Some(&IndexKey(Value::Int(3))), ScanDirection::Descending, 10);
        assert_eq!(
            desc.into_iter().map(|(_, ids)| ids[0]).collect::<Vec<_>>(),
            vec![ItemId(8), ItemId(9)]
        );
    }

    #[test]
    fn estimates_cap_large_ranges() {
        let values: Vec<(i64, u64)> = (0..100).map(|i| (i, i as u64)).collect();
        let entries = entries_with(&values);
        assert_eq!(entries.estimate_eq(&Value::Int(5)), 1);
        assert_eq!(
            entries.estimate_range(Bound::Included(&Value::Int(10)), Bound::Unbounded, 16),
            16
        );
        assert_eq!(
            entries.estimate_range(Bound::Included(&Value::Int(95)), Bound::Unbounded, 16),
            5
        );
    }
}
