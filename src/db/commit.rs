//! Commit pipeline: resolve the write buffer, lock what it touches, validate,
//! persist, then apply to indexes, the item table and the full-text index.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{info, trace};

use crate::fulltext::{FullTextIndex, Tokenizer};
use crate::primitives::concurrency::LockLevel;
use crate::storage::index::Posting;
use crate::storage::{CommitRecord, Mutation, TextFields};
use crate::types::{AssocError, IndexKey, ItemId, Result, Value};

use super::database::DbInner;
use super::options::DeallocPolicy;
use super::transaction::{Transaction, WriteBuffer};

/// Postings removed from and added to one attribute index.
#[derive(Debug, Default)]
pub(crate) struct AttributeDelta {
    pub(crate) removed: BTreeSet<Posting>,
    pub(crate) added: BTreeSet<Posting>,
}

impl AttributeDelta {
    fn normalize(&mut self) {
        let both: Vec<Posting> = self.removed.intersection(&self.added).cloned().collect();
        for posting in &both {
            self.removed.remove(posting);
            self.added.remove(posting);
        }
    }

    fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

#[derive(Debug)]
pub(crate) enum TextChange {
    Reindex { item: ItemId, tokens: Vec<String> },
    Remove(ItemId),
}

/// Index and full-text changes implied by a batch of mutations, computed
/// against the committed state the batch will be applied to.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub(crate) index: BTreeMap<String, AttributeDelta>,
    pub(crate) text: Vec<TextChange>,
    /// Items are created or deallocated.
    pub(crate) items_changed: bool,
}

impl Effects {
    fn needs_fulltext(&self) -> bool {
        !self.text.is_empty()
    }
}

/// Turns a write buffer into mutations against the current committed state.
///
/// Fails when an item or reference target vanished underneath the buffer, or
/// when a deallocated item gained referrers and the policy forbids cascading.
pub(crate) fn resolve(db: &DbInner, buffer: &WriteBuffer) -> Result<Vec<Mutation>> {
    let live = |id: ItemId| {
        buffer.created.contains(&id) || (!buffer.deallocated.contains(&id) && db.store.exists(id))
    };
    for item in &buffer.deallocated {
        if !db.store.exists(*item) {
            return Err(AssocError::UnknownItem(*item));
        }
    }

    let mut sets: BTreeMap<(ItemId, String), Vec<Value>> = BTreeMap::new();
    for (attribute, items) in &buffer.overlay {
        for (item, values) in items {
            if !live(*item) {
                return Err(AssocError::UnknownItem(*item));
            }
            if let Some(target) = values
                .iter()
                .filter_map(Value::as_ref_id)
                .find(|target| !live(*target))
            {
                return Err(AssocError::UnknownItem(target));
            }
            sets.insert((*item, attribute.clone()), values.clone());
        }
    }

    for item in &buffer.deallocated {
        let mut dangling = 0usize;
        for (source, attribute, _) in db.store.referrers(*item) {
            if source == *item || buffer.deallocated.contains(&source) {
                continue;
            }
            let key = (source, attribute);
            let current = match sets.get(&key) {
                Some(values) => values.clone(),
                None => db.store.values(source, &key.1).unwrap_or_default(),
            };
            let links = current
                .iter()
                .filter(|v| v.as_ref_id() == Some(*item))
                .count();
            if links == 0 {
                continue;
            }
            dangling += links;
            if db.options.dealloc_policy == DeallocPolicy::Cascade {
                let kept = current
                    .into_iter()
                    .filter(|v| v.as_ref_id() != Some(*item))
                    .collect();
                sets.insert(key, kept);
            }
        }
        if dangling > 0 && db.options.dealloc_policy == DeallocPolicy::Fail {
            return Err(AssocError::DanglingReference {
                item: *item,
                referrers: dangling,
            });
        }
    }

    let mut mutations = Vec::new();
    for item in &buffer.created {
        mutations.push(Mutation::CreateItem { item: *item });
    }
    for ((item, attribute), values) in sets {
        let unchanged = if buffer.created.contains(&item) {
            values.is_empty()
        } else {
            db.store.values(item, &attribute).unwrap_or_default() == values
        };
        if !unchanged {
            mutations.push(Mutation::SetAttribute {
                item,
                attribute,
                values,
            });
        }
    }
    for item in &buffer.deallocated {
        mutations.push(Mutation::Deallocate { item: *item });
    }
    for (item, fields) in &buffer.fulltext {
        if live(*item) {
            mutations.push(Mutation::IndexText {
                item: *item,
                fields: fields.clone(),
            });
        }
    }
    Ok(mutations)
}

/// Computes index deltas and full-text changes for `mutations`.
pub(crate) fn derive_effects(db: &DbInner, mutations: &[Mutation]) -> Effects {
    let mut index: BTreeMap<String, AttributeDelta> = BTreeMap::new();
    let mut overrides: BTreeMap<ItemId, BTreeMap<String, Vec<Value>>> = BTreeMap::new();
    let mut requested: BTreeMap<ItemId, TextFields> = BTreeMap::new();
    let mut dropped_docs: BTreeSet<ItemId> = BTreeSet::new();
    let mut items_changed = false;

    for mutation in mutations {
        match mutation {
            Mutation::CreateItem { .. } => items_changed = true,
            Mutation::SetAttribute {
                item,
                attribute,
                values,
            } => {
                let delta = index.entry(attribute.clone()).or_default();
                for old in db.store.values(*item, attribute).unwrap_or_default() {
                    delta.removed.insert((IndexKey(old), *item));
                }
                for new in values {
                    delta.added.insert((IndexKey(new.clone()), *item));
                }
                overrides
                    .entry(*item)
                    .or_default()
                    .insert(attribute.clone(), values.clone());
            }
            Mutation::Deallocate { item } => {
                items_changed = true;
                let Some(record) = db.store.record(*item) else {
                    continue;
                };
                for (attribute, values) in record.attributes {
                    let delta = index.entry(attribute).or_default();
                    for old in values {
                        delta.removed.insert((IndexKey(old), *item));
                    }
                }
                if record.text_fields.is_some() {
                    dropped_docs.insert(*item);
                }
            }
            Mutation::IndexText { item, fields } => {
                requested.insert(*item, fields.clone());
            }
        }
    }
    for delta in index.values_mut() {
        delta.normalize();
    }
    index.retain(|_, delta| !delta.is_empty());

    let mut text = Vec::new();
    let candidates: BTreeSet<ItemId> = requested.keys().chain(overrides.keys()).copied().collect();
    for item in candidates {
        if dropped_docs.contains(&item) {
            continue;
        }
        let fields = match requested.get(&item) {
            Some(fields) => fields.clone(),
            None => match db.store.text_fields(item) {
                Some(fields) => fields,
                None => continue,
            },
        };
        let touched = overrides
            .get(&item)
            .is_some_and(|attrs| attrs.keys().any(|a| fields.covers(a)));
        if !requested.contains_key(&item) && !touched {
            continue;
        }
        let mut attributes = db
            .store
            .record(item)
            .map(|r| r.attributes)
            .unwrap_or_default();
        if let Some(attrs) = overrides.get(&item) {
            for (attribute, values) in attrs {
                if values.is_empty() {
                    attributes.remove(attribute);
                } else {
                    attributes.insert(attribute.clone(), values.clone());
                }
            }
        }
        let tokens = document_tokens(&db.tokenizer, &fields, &attributes);
        text.push(TextChange::Reindex { item, tokens });
    }
    text.extend(dropped_docs.into_iter().map(TextChange::Remove));
    Effects {
        index,
        text,
        items_changed,
    }
}

fn document_tokens(
    tokenizer: &Tokenizer,
    fields: &TextFields,
    attributes: &BTreeMap<String, Vec<Value>>,
) -> Vec<String> {
    let selected: Vec<&Vec<Value>> = match fields {
        TextFields::AllStrings => attributes.values().collect(),
        TextFields::Named(names) => names.iter().filter_map(|n| attributes.get(n)).collect(),
    };
    selected
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .flat_map(|text| tokenizer.tokenize(text))
        .collect()
}

fn apply_text(index: &mut FullTextIndex, changes: &[TextChange]) {
    for change in changes {
        match change {
            TextChange::Reindex { item, tokens } => index.index_document(*item, tokens),
            TextChange::Remove(item) => {
                index.remove_document(*item);
            }
        }
    }
}

/// Re-applies a persisted record while opening the database.
pub(crate) fn apply_record(db: &DbInner, record: &CommitRecord) -> Result<()> {
    let effects = derive_effects(db, &record.mutations);
    for (attribute, delta) in &effects.index {
        let guard = db.indexes.ladder(attribute).exclusive()?;
        let mut entries = guard.write()?;
        entries
            .check_batch(&delta.removed, &delta.added)
            .map_err(|err| {
                AssocError::Corruption(format!("replaying txn {}: {err}", record.txn))
            })?;
        entries.apply_batch(&delta.removed, &delta.added);
    }
    db.store.apply(&record.mutations);
    if effects.needs_fulltext() {
        let guard = db.fulltext.exclusive()?;
        let mut index = guard.write()?;
        apply_text(&mut index, &effects.text);
    }
    Ok(())
}

impl Transaction {
    /// Applies the write buffer atomically. On error nothing was applied.
    pub(crate) fn commit_buffer(&mut self) -> Result<()> {
        let db = Arc::clone(&self.db);
        loop {
            // Learn which indexes the commit touches and promote them before
            // serializing; promotions wait on readers, not on other committers.
            let mutations = resolve(&db, &self.buffer)?;
            let effects = derive_effects(&db, &mutations);
            self.promote_for(&effects)?;

            let _serial = db.commit_lock.lock();
            let mutations = resolve(&db, &self.buffer)?;
            let effects = derive_effects(&db, &mutations);
            if !self.holds_exclusive(&effects) {
                trace!(txn = %self.id, "txn.commit.relock");
                continue;
            }
            if mutations.is_empty() {
                return Ok(());
            }

            let locks = self.locks.get_mut();
            let mut writers = Vec::with_capacity(effects.index.len());
            for (attribute, delta) in &effects.index {
                let guard = locks
                    .attributes
                    .get(attribute)
                    .ok_or(AssocError::Invalid("commit touched an unlocked attribute"))?;
                let entries = guard.write()?;
                entries.check_batch(&delta.removed, &delta.added)?;
                writers.push((entries, delta));
            }
            let mut text_writer = match (effects.needs_fulltext(), locks.fulltext.as_ref()) {
                (true, Some(guard)) => Some(guard.write()?),
                (true, None) => return Err(AssocError::Invalid("full-text index is not locked")),
                (false, _) => None,
            };

            let record = CommitRecord {
                txn: self.id,
                mutations,
            };
            db.backend.append(&record)?;

            for (mut entries, delta) in writers {
                entries.apply_batch(&delta.removed, &delta.added);
            }
            db.store.apply(&record.mutations);
            if let Some(index) = text_writer.as_mut() {
                apply_text(index, &effects.text);
            }
            let commits = db.record_commit();
            info!(
                txn = %self.id,
                mutations = record.mutations.len(),
                indexes = effects.index.len(),
                text_changes = effects.text.len(),
                commits,
                "txn.commit.applied"
            );
            return Ok(());
        }
    }

    /// Takes and promotes every ladder the commit writes: attributes in name
    /// order, then the item set, then the full-text index.
    fn promote_for(&mut self, effects: &Effects) -> Result<()> {
        let names: Vec<&String> = effects.index.keys().collect();
        self.lock_attributes(&names)?;
        if effects.items_changed {
            self.lock_items()?;
        }
        if effects.needs_fulltext() {
            self.lock_fulltext()?;
        }
        let locks = self.locks.get_mut();
        for name in names {
            if let Some(guard) = locks.attributes.get_mut(name.as_str()) {
                guard.promote()?;
            }
        }
        if effects.items_changed {
            if let Some(guard) = locks.items.as_mut() {
                guard.promote()?;
            }
        }
        if effects.needs_fulltext() {
            if let Some(guard) = locks.fulltext.as_mut() {
                guard.promote()?;
            }
        }
        Ok(())
    }

    fn holds_exclusive(&mut self, effects: &Effects) -> bool {
        let locks = self.locks.get_mut();
        let attributes_ok = effects.index.keys().all(|name| {
            locks
                .attributes
                .get(name)
                .is_some_and(|g| g.level() == LockLevel::Exclusive)
        });
        let items_ok = !effects.items_changed
            || locks
                .items
                .as_ref()
                .is_some_and(|g| g.level() == LockLevel::Exclusive);
        let fulltext_ok = !effects.needs_fulltext()
            || locks
                .fulltext
                .as_ref()
                .is_some_and(|g| g.level() == LockLevel::Exclusive);
        attributes_ok && items_ok && fulltext_ok
    }
}
