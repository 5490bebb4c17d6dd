use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::fulltext::{self, FullTextIndex, SearchResult};
use crate::primitives::concurrency::{LadderGuard, LockLadder, LockLevel};
use crate::query::executor::{self, ResultSet};
use crate::query::planner::{self, PlanExplain, QueryContext};
use crate::query::{OrderBy, Predicate};
use crate::storage::index::{
    validate_attribute_name, AttributeGuard, AttributeLadder, OrderedScan, Posting, ScanDirection,
};
use crate::storage::TextFields;
use crate::types::{AssocError, IndexKey, ItemId, Result, TxnId, Value, ValueKind};

use super::database::DbInner;
use super::options::DeallocPolicy;

/// Whether a transaction may mutate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnMode {
    /// Queries only; takes shared locks.
    ReadOnly,
    /// Buffers mutations; takes update locks and promotes them at commit.
    ReadWrite,
}

/// Lifecycle of a transaction. `Committed` and `RolledBack` are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    /// Accepting operations.
    Open,
    /// Changes applied.
    Committed,
    /// Changes discarded.
    RolledBack,
}

/// Pending changes of a read-write transaction.
#[derive(Default, Debug)]
pub(crate) struct WriteBuffer {
    pub(crate) created: BTreeSet<ItemId>,
    pub(crate) deallocated: BTreeSet<ItemId>,
    /// attribute -> item -> complete new sequence (empty removes the attribute)
    pub(crate) overlay: BTreeMap<String, BTreeMap<ItemId, Vec<Value>>>,
    pub(crate) fulltext: BTreeMap<ItemId, TextFields>,
    /// Kind of the values this transaction staged per attribute.
    staged_kinds: BTreeMap<String, ValueKind>,
}

impl WriteBuffer {
    pub(crate) fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.deallocated.is_empty()
            && self.overlay.is_empty()
            && self.fulltext.is_empty()
    }

    pub(crate) fn staged(&self, item: ItemId, attribute: &str) -> Option<&Vec<Value>> {
        self.overlay.get(attribute).and_then(|items| items.get(&item))
    }

    fn staged_attributes(&self, item: ItemId) -> Vec<String> {
        self.overlay
            .iter()
            .filter(|(_, items)| items.contains_key(&item))
            .map(|(attribute, _)| attribute.clone())
            .collect()
    }

    fn forget_item(&mut self, item: ItemId) {
        self.overlay.retain(|_, items| {
            items.remove(&item);
            !items.is_empty()
        });
        self.fulltext.remove(&item);
    }
}

#[derive(Default)]
pub(crate) struct HeldLocks {
    pub(crate) attributes: BTreeMap<String, AttributeGuard>,
    /// Guards which items exist; taken by queries that enumerate every item.
    pub(crate) items: Option<LadderGuard<()>>,
    pub(crate) fulltext: Option<LadderGuard<FullTextIndex>>,
}

/// A read-only or read-write session.
///
/// Locks are taken lazily on first touch and held until the transaction ends.
/// Queries (`find`, the index accessors, full-text search) see committed state;
/// `values`, `item` and `exists` also see this transaction's own pending writes.
/// Dropping an open transaction rolls it back.
pub struct Transaction {
    pub(crate) db: Arc<DbInner>,
    pub(crate) id: TxnId,
    mode: TxnMode,
    state: TxnState,
    pub(crate) locks: Mutex<HeldLocks>,
    pub(crate) buffer: WriteBuffer,
}

impl Transaction {
    pub(crate) fn new(db: Arc<DbInner>, id: TxnId, mode: TxnMode) -> Self {
        Self {
            db,
            id,
            mode,
            state: TxnState::Open,
            locks: Mutex::new(HeldLocks::default()),
            buffer: WriteBuffer::default(),
        }
    }

    /// Identifier assigned when the transaction started.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Read-only or read-write.
    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// `true` until the transaction commits or rolls back.
    pub fn is_open(&self) -> bool {
        self.state == TxnState::Open
    }

    fn lock_level(&self) -> LockLevel {
        match self.mode {
            TxnMode::ReadOnly => LockLevel::Shared,
            TxnMode::ReadWrite => LockLevel::Update,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(AssocError::TransactionClosed);
        }
        self.db.ensure_open()
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.mode != TxnMode::ReadWrite {
            return Err(AssocError::ReadOnlyTransaction);
        }
        Ok(())
    }

    /// Locks each attribute at this transaction's level, in ascending name
    /// order, and returns their ladders.
    pub(crate) fn lock_attributes<I, S>(&self, names: I) -> Result<BTreeMap<String, AttributeLadder>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sorted: BTreeSet<String> = names
            .into_iter()
            .map(|n| {
                let n = n.as_ref();
                n.strip_prefix('-').unwrap_or(n).to_owned()
            })
            .collect();
        let mut locks = self.locks.lock();
        let mut out = BTreeMap::new();
        for name in sorted {
            if let Some(guard) = locks.attributes.get(&name) {
                out.insert(name, Arc::clone(guard.ladder()));
                continue;
            }
            let ladder = self.db.indexes.ladder(&name);
            let guard = match self.lock_level() {
                LockLevel::Shared => ladder.shared()?,
                _ => ladder.update()?,
            };
            trace!(txn = %self.id, attribute = %name, level = ?guard.level(), "txn.lock.acquired");
            locks.attributes.insert(name.clone(), guard);
            out.insert(name, ladder);
        }
        Ok(out)
    }

    fn lock_attribute(&self, name: &str) -> Result<AttributeLadder> {
        let mut ladders = self.lock_attributes([name])?;
        ladders
            .remove(name)
            .ok_or(AssocError::Invalid("attribute lock was not recorded"))
    }

    pub(crate) fn lock_items(&self) -> Result<()> {
        let mut locks = self.locks.lock();
        if locks.items.is_none() {
            let guard = match self.lock_level() {
                LockLevel::Shared => self.db.items.shared()?,
                _ => self.db.items.update()?,
            };
            trace!(txn = %self.id, level = ?guard.level(), "txn.lock.items");
            locks.items = Some(guard);
        }
        Ok(())
    }

    pub(crate) fn lock_fulltext(&self) -> Result<Arc<LockLadder<FullTextIndex>>> {
        let mut locks = self.locks.lock();
        if locks.fulltext.is_none() {
            let guard = match self.lock_level() {
                LockLevel::Shared => self.db.fulltext.shared()?,
                _ => self.db.fulltext.update()?,
            };
            locks.fulltext = Some(guard);
        }
        Ok(Arc::clone(&self.db.fulltext))
    }

    /// Whether `item` exists from this transaction's point of view.
    pub(crate) fn is_visible(&self, item: ItemId) -> bool {
        if self.buffer.created.contains(&item) {
            return true;
        }
        !self.buffer.deallocated.contains(&item) && self.db.store.exists(item)
    }

    fn current_values(&self, item: ItemId, attribute: &str) -> Vec<Value> {
        if let Some(staged) = self.buffer.staged(item, attribute) {
            return staged.clone();
        }
        if self.buffer.created.contains(&item) {
            return Vec::new();
        }
        self.db.store.values(item, attribute).unwrap_or_default()
    }

    fn attribute_names(&self, item: ItemId) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.db.store.attribute_names(item).into_iter().collect();
        names.extend(self.buffer.staged_attributes(item));
        names
    }

    // ---- reads ----

    /// Whether `item` exists (including items created by this transaction).
    pub fn exists(&self, item: ItemId) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.is_visible(item))
    }

    /// The ordered value sequence of `attribute` on `item`; empty when unset.
    pub fn values(&self, item: ItemId, attribute: &str) -> Result<Vec<Value>> {
        self.ensure_open()?;
        validate_attribute_name(attribute)?;
        self.lock_attribute(attribute)?;
        if !self.is_visible(item) {
            return Err(AssocError::UnknownItem(item));
        }
        Ok(self.current_values(item, attribute))
    }

    /// Every attribute of `item` with its values.
    pub fn item(&self, item: ItemId) -> Result<BTreeMap<String, Vec<Value>>> {
        self.ensure_open()?;
        if !self.is_visible(item) {
            return Err(AssocError::UnknownItem(item));
        }
        let names = self.attribute_names(item);
        self.lock_attributes(&names)?;
        Ok(names
            .into_iter()
            .map(|name| {
                let values = self.current_values(item, &name);
                (name, values)
            })
            .filter(|(_, values)| !values.is_empty())
            .collect())
    }

    /// Streams the committed items matching `predicate`, optionally ordered.
    ///
    /// Without an ordering, items come in ascending id order. With one, they
    /// follow the ordering attribute's values (ties by ascending id); matching
    /// items without that attribute come last.
    pub fn find(&self, predicate: &Predicate, order_by: Option<&OrderBy>) -> Result<ResultSet<'_>> {
        self.ensure_open()?;
        let mut names = predicate.attributes();
        if let Some(order) = order_by {
            validate_attribute_name(&order.attribute)?;
            names.push(order.attribute.clone());
        }
        let ladders = self.lock_attributes(&names)?;
        let order_ladder = order_by.and_then(|o| ladders.get(&o.attribute).cloned());
        let ctx = QueryContext::new(&self.db.store, ladders);
        let plan = planner::plan(&ctx, predicate)?;
        if plan.reads_item_set() {
            self.lock_items()?;
        }
        let ids = executor::evaluate(&ctx, &plan)?;
        debug!(txn = %self.id, %predicate, estimate = plan.estimate, matched = ids.len(), "query.find");
        Ok(match (order_by, order_ladder) {
            (Some(order), Some(ladder)) => {
                ResultSet::ordered(OrderedScan::new(ladder, order.direction), ids)
            }
            _ => ResultSet::unordered(ids),
        })
    }

    /// The plan `find` would use for `predicate`.
    pub fn explain(&self, predicate: &Predicate) -> Result<PlanExplain> {
        self.ensure_open()?;
        let ladders = self.lock_attributes(predicate.attributes())?;
        let ctx = QueryContext::new(&self.db.store, ladders);
        Ok(planner::explain(&planner::plan(&ctx, predicate)?))
    }

    /// `Lookup`: committed items whose `attribute` holds `value`, ascending.
    pub fn lookup(&self, attribute: &str, value: impl Into<Value>) -> Result<Vec<ItemId>> {
        self.ensure_open()?;
        validate_attribute_name(attribute)?;
        let ladder = self.lock_attribute(attribute)?;
        let entries = ladder.read_held();
        entries.lookup(&value.into())
    }

    /// `Range`: committed items with a value in `[lo, hi]`, in value order.
    pub fn range(&self, attribute: &str, lo: impl Into<Value>, hi: impl Into<Value>) -> Result<Vec<ItemId>> {
        let (lo, hi) = (lo.into(), hi.into());
        self.range_bounds(attribute, Bound::Included(&lo), Bound::Included(&hi))
    }

    /// Range with arbitrary bounds, in value order.
    pub fn range_bounds(
        &self,
        attribute: &str,
        lower: Bound<&Value>,
        upper: Bound<&Value>,
    ) -> Result<Vec<ItemId>> {
        self.ensure_open()?;
        validate_attribute_name(attribute)?;
        let ladder = self.lock_attribute(attribute)?;
        let entries = ladder.read_held();
        entries.range(lower, upper)
    }

    /// `ReverseLookup`: committed items referencing `target` through `attribute`.
    /// A leading `-` on the name is accepted.
    pub fn reverse_lookup(&self, attribute: &str, target: ItemId) -> Result<Vec<ItemId>> {
        self.ensure_open()?;
        let name = attribute.strip_prefix('-').unwrap_or(attribute);
        validate_attribute_name(name)?;
        let ladder = self.lock_attribute(name)?;
        let entries = ladder.read_held();
        Ok(entries.reverse_lookup(target))
    }

    /// `OrderedScan`: every committed item holding `attribute`, lazily, in value order.
    pub fn ordered_scan(&self, attribute: &str, direction: ScanDirection) -> Result<ResultSet<'_>> {
        self.ensure_open()?;
        validate_attribute_name(attribute)?;
        let ladder = self.lock_attribute(attribute)?;
        let holders = ladder.read_held().all_items();
        Ok(ResultSet::ordered(OrderedScan::new(ladder, direction), holders))
    }

    /// `FullTextSearch` over committed documents.
    pub fn full_text_search(
        &self,
        query: &str,
        max_results: usize,
        max_time_millis: u64,
    ) -> Result<SearchResult> {
        self.ensure_open()?;
        let ladder = self.lock_fulltext()?;
        let index = ladder.read_held();
        Ok(fulltext::search(
            &index,
            &self.db.tokenizer,
            &self.db.options.fulltext,
            query,
            max_results,
            Duration::from_millis(max_time_millis),
        ))
    }

    // ---- writes ----

    /// `CreateItem`: reserves a new, empty item, visible to others after commit.
    pub fn create_item(&mut self) -> Result<ItemId> {
        self.ensure_writable()?;
        let id = self.db.store.allocate_id();
        self.buffer.created.insert(id);
        trace!(txn = %self.id, item = %id, "txn.create_item");
        Ok(id)
    }

    /// `Link`: appends `value` to `item.attribute`.
    pub fn link(&mut self, item: ItemId, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.prepare_write(item, attribute, &value)?;
        let mut values = self.current_values(item, attribute);
        values.push(value);
        self.stage(item, attribute, values)
    }

    /// `Update`: replaces `item.attribute` with the single `value`.
    pub fn update(&mut self, item: ItemId, attribute: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.prepare_write(item, attribute, &value)?;
        self.stage(item, attribute, vec![value])
    }

    /// Removes every value of `item.attribute`.
    pub fn unset(&mut self, item: ItemId, attribute: &str) -> Result<()> {
        self.ensure_writable()?;
        validate_attribute_name(attribute)?;
        if !self.is_visible(item) {
            return Err(AssocError::UnknownItem(item));
        }
        self.lock_attribute(attribute)?;
        self.stage(item, attribute, Vec::new())
    }

    /// `Deallocate`: removes `item`. Items still referencing it make this fail
    /// with `DanglingReference`, or lose those references under
    /// [`DeallocPolicy::Cascade`].
    pub fn deallocate(&mut self, item: ItemId) -> Result<()> {
        self.ensure_writable()?;
        if !self.is_visible(item) {
            return Err(AssocError::UnknownItem(item));
        }
        self.lock_attributes(self.attribute_names(item))?;

        let referrers = self.pending_referrers(item);
        let count: usize = referrers.iter().map(|(_, _, n)| n).sum();
        if count > 0 {
            if self.db.options.dealloc_policy == DeallocPolicy::Fail {
                return Err(AssocError::DanglingReference {
                    item,
                    referrers: count,
                });
            }
            self.lock_attributes(referrers.iter().map(|(_, attribute, _)| attribute.as_str()))?;
            for (source, attribute, _) in &referrers {
                let remaining: Vec<Value> = self
                    .current_values(*source, attribute)
                    .into_iter()
                    .filter(|v| v.as_ref_id() != Some(item))
                    .collect();
                self.buffer
                    .overlay
                    .entry(attribute.clone())
                    .or_default()
                    .insert(*source, remaining);
            }
            debug!(txn = %self.id, item = %item, links = count, "txn.deallocate.cascade");
        }

        self.buffer.forget_item(item);
        if !self.buffer.created.remove(&item) {
            self.buffer.deallocated.insert(item);
        }
        Ok(())
    }

    /// `IncludeInFullTextIndex`: indexes the named attributes of `item`, or all
    /// of its string attributes when `fields` is `None`. The document follows
    /// later changes to those attributes.
    pub fn include_in_fulltext_index(&mut self, item: ItemId, fields: Option<&[&str]>) -> Result<()> {
        self.ensure_writable()?;
        if !self.is_visible(item) {
            return Err(AssocError::UnknownItem(item));
        }
        let fields = match fields {
            None => TextFields::AllStrings,
            Some(names) => {
                for name in names {
                    validate_attribute_name(name)?;
                }
                TextFields::Named(names.iter().map(|n| (*n).to_owned()).collect())
            }
        };
        self.lock_fulltext()?;
        self.buffer.fulltext.insert(item, fields);
        Ok(())
    }

    /// Items holding references to `target` once this transaction's pending
    /// writes apply, as `(source, attribute, count)`.
    fn pending_referrers(&self, target: ItemId) -> Vec<(ItemId, String, usize)> {
        let mut keys: BTreeSet<(ItemId, String)> = self
            .db
            .store
            .referrers(target)
            .into_iter()
            .map(|(source, attribute, _)| (source, attribute))
            .collect();
        for (attribute, items) in &self.buffer.overlay {
            for (source, values) in items {
                if values.iter().any(|v| v.as_ref_id() == Some(target)) {
                    keys.insert((*source, attribute.clone()));
                }
            }
        }
        keys.into_iter()
            .filter(|(source, _)| *source != target && self.is_visible(*source))
            .filter_map(|(source, attribute)| {
                let count = self
                    .current_values(source, &attribute)
                    .iter()
                    .filter(|v| v.as_ref_id() == Some(target))
                    .count();
                (count > 0).then_some((source, attribute, count))
            })
            .collect()
    }

    fn prepare_write(&mut self, item: ItemId, attribute: &str, value: &Value) -> Result<()> {
        self.ensure_writable()?;
        validate_attribute_name(attribute)?;
        value.validate()?;
        if !self.is_visible(item) {
            return Err(AssocError::UnknownItem(item));
        }
        if let Some(target) = value.as_ref_id() {
            if !self.is_visible(target) {
                return Err(AssocError::UnknownItem(target));
            }
        }
        self.lock_attribute(attribute)?;
        Ok(())
    }

    /// Buffers the new sequence, undoing it if the attribute would end up
    /// holding values of more than one kind.
    fn stage(&mut self, item: ItemId, attribute: &str, values: Vec<Value>) -> Result<()> {
        let kind = values.last().map(Value::kind);
        let previous = self
            .buffer
            .overlay
            .entry(attribute.to_owned())
            .or_default()
            .insert(item, values);
        if let Some(kind) = kind {
            if let Err(err) = self.check_kinds(attribute, kind) {
                let items = self.buffer.overlay.entry(attribute.to_owned()).or_default();
                match previous {
                    Some(previous) => {
                        items.insert(item, previous);
                    }
                    None => {
                        items.remove(&item);
                        if items.is_empty() {
                            self.buffer.overlay.remove(attribute);
                        }
                    }
                }
                return Err(err);
            }
            self.buffer.staged_kinds.insert(attribute.to_owned(), kind);
        }
        trace!(txn = %self.id, item = %item, attribute, "txn.stage");
        Ok(())
    }

    fn check_kinds(&self, attribute: &str, kind: ValueKind) -> Result<()> {
        let ladder = self.lock_attribute(attribute)?;
        let entries = ladder.read_held();
        let committed_ok = entries.kind().map_or(true, |k| k == kind);
        let staged_ok = self.buffer.staged_kinds.get(attribute).map_or(true, |k| *k == kind);
        if committed_ok && staged_ok {
            return Ok(());
        }
        let (removed, added) = self.attribute_delta(attribute);
        entries.check_batch(&removed, &added)
    }

    /// Postings this transaction would remove from and add to `attribute`.
    pub(crate) fn attribute_delta(&self, attribute: &str) -> (BTreeSet<Posting>, BTreeSet<Posting>) {
        let mut removed = BTreeSet::new();
        let mut added = BTreeSet::new();
        if let Some(items) = self.buffer.overlay.get(attribute) {
            for (item, values) in items {
                for old in self.db.store.values(*item, attribute).unwrap_or_default() {
                    removed.insert((IndexKey(old), *item));
                }
                for new in values {
                    added.insert((IndexKey(new.clone()), *item));
                }
            }
        }
        for item in &self.buffer.deallocated {
            for old in self.db.store.values(*item, attribute).unwrap_or_default() {
                removed.insert((IndexKey(old), *item));
            }
        }
        (removed, added)
    }

    // ---- termination ----

    /// `Commit`: applies every buffered change atomically, then releases all
    /// locks. Any failure rolls the whole transaction back.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.mode == TxnMode::ReadWrite && !self.buffer.is_empty() {
            if let Err(err) = self.commit_buffer() {
                debug!(txn = %self.id, error = %err, "txn.commit.failed");
                self.finish(TxnState::RolledBack);
                return Err(err);
            }
        }
        self.finish(TxnState::Committed);
        Ok(())
    }

    /// `Rollback`: discards buffered changes and releases all locks.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state != TxnState::Open {
            return Err(AssocError::TransactionClosed);
        }
        self.finish(TxnState::RolledBack);
        Ok(())
    }

    fn finish(&mut self, state: TxnState) {
        self.buffer = WriteBuffer::default();
        let released = {
            let locks = self.locks.get_mut();
            let count = locks.attributes.len()
                + usize::from(locks.items.is_some())
                + usize::from(locks.fulltext.is_some());
            *locks = HeldLocks::default();
            count
        };
        self.state = state;
        debug!(txn = %self.id, ?state, released, "txn.finish");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Open {
            self.finish(TxnState::RolledBack);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .finish()
    }
}
