use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::types::{ItemId, Value};

use super::patch::{Mutation, TextFields};

/// Committed state of one item.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemRecord {
    /// Attribute name -> ordered value sequence. Absent names have no values.
    pub attributes: BTreeMap<String, Vec<Value>>,
    /// Full-text source fields, when the item was included in the full-text index.
    pub text_fields: Option<TextFields>,
}

/// `(source item, attribute)` holding a reference, with its link multiplicity.
pub type Referrer = (ItemId, String, usize);

#[derive(Default)]
struct ItemTable {
    records: BTreeMap<ItemId, ItemRecord>,
    // target -> (source, attribute) -> number of reference values
    referrers: FxHashMap<ItemId, BTreeMap<(ItemId, String), usize>>,
}

impl ItemTable {
    fn adjust_refs(&mut self, source: ItemId, attribute: &str, values: &[Value], add: bool) {
        for target in values.iter().filter_map(Value::as_ref_id) {
            let by_source = self.referrers.entry(target).or_default();
            let key = (source, attribute.to_owned());
            if add {
                *by_source.entry(key).or_insert(0) += 1;
            } else if let Some(count) = by_source.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    by_source.remove(&key);
                }
            }
            if by_source.is_empty() {
                self.referrers.remove(&target);
            }
        }
    }
}

/// Committed items and their attribute maps.
///
/// Only the commit path mutates the table, one resolved batch at a time.
pub struct ItemStore {
    next_id: AtomicU64,
    table: RwLock<ItemTable>,
}

impl Default for ItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemStore {
    /// Empty table; the first identity is 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: RwLock::new(ItemTable::default()),
        }
    }

    /// Reserves a fresh identity. Identities are never reused, even when the
    /// reserving transaction rolls back.
    pub fn allocate_id(&self) -> ItemId {
        ItemId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Keeps future allocations above an identity seen during replay.
    pub fn observe_id(&self, id: ItemId) {
        self.next_id.fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
    }

    /// Whether `id` is live.
    pub fn exists(&self, id: ItemId) -> bool {
        self.table.read().records.contains_key(&id)
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.table.read().records.len()
    }

    /// Whether no item is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values of `attribute` on `id`; `None` when the item does not exist.
    pub fn values(&self, id: ItemId, attribute: &str) -> Option<Vec<Value>> {
        let table = self.table.read();
        let record = table.records.get(&id)?;
        Some(record.attributes.get(attribute).cloned().unwrap_or_default())
    }

    /// Snapshot of `id`'s attributes and full-text settings.
    pub fn record(&self, id: ItemId) -> Option<ItemRecord> {
        self.table.read().records.get(&id).cloned()
    }

    /// Names of the attributes `id` holds values for.
    pub fn attribute_names(&self, id: ItemId) -> Vec<String> {
        self.table
            .read()
            .records
            .get(&id)
            .map(|r| r.attributes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Fields `id` contributes to the full-text index, if it is included.
    pub fn text_fields(&self, id: ItemId) -> Option<TextFields> {
        self.table
            .read()
            .records
            .get(&id)
            .and_then(|r| r.text_fields.clone())
    }

    /// Every live item, ascending.
    pub fn live_items(&self) -> Vec<ItemId> {
        self.table.read().records.keys().copied().collect()
    }

    /// Items holding a reference to `target`, by `(source, attribute)`.
    pub fn referrers(&self, target: ItemId) -> Vec<Referrer> {
        self.table
            .read()
            .referrers
            .get(&target)
            .map(|by_source| {
                by_source
                    .iter()
                    .map(|((source, attribute), count)| (*source, attribute.clone(), *count))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies a resolved batch. Callers validate the batch first; entries that
    /// name missing items are skipped so that replay stays idempotent.
    pub fn apply(&self, mutations: &[Mutation]) {
        let mut table = self.table.write();
        for mutation in mutations {
            match mutation {
                Mutation::CreateItem { item } => {
                    self.observe_id(*item);
                    table.records.entry(*item).or_default();
                }
                Mutation::SetAttribute {
                    item,
                    attribute,
                    values,
                } => {
                    let Some(record) = table.records.get_mut(item) else {
                        continue;
                    };
                    let old = if values.is_empty() {
                        record.attributes.remove(attribute)
                    } else {
                        record.attributes.insert(attribute.clone(), values.clone())
                    };
                    if let Some(old) = old {
                        table.adjust_refs(*item, attribute, &old, false);
                    }
                    table.adjust_refs(*item, attribute, values, true);
                }
                Mutation::Deallocate { item } => {
                    if let Some(record) = table.records.remove(item) {
                        for (attribute, values) in &record.attributes {
                            table.adjust_refs(*item, attribute, values, false);
                        }
                    }
                }
                Mutation::IndexText { item, fields } => {
                    if let Some(record) = table.records.get_mut(item) {
                        record.text_fields = Some(fields.clone());
                    }
                }
            }
        }
    }
}
