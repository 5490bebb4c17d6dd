//! Plan evaluation and lazy result streaming.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Bound;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::storage::index::{
    difference_sorted, intersect_sorted, union_sorted, OrderedScan, PostingStream,
};
use crate::types::{ItemId, Result, Value};

use super::ast::Direction;
use super::planner::{PlanNode, PlanOp, QueryContext};

/// Once the running candidate set is this many times smaller than a child's
/// estimate, the child is checked per candidate instead of being materialized.
const RESIDUAL_RATIO: usize = 4;

const ORDERED_BATCH: usize = 128;

/// Materializes the items matching `node`, ascending by id.
pub(crate) fn evaluate(ctx: &QueryContext<'_>, node: &PlanNode) -> Result<Vec<ItemId>> {
    match &node.op {
        PlanOp::Empty => Ok(Vec::new()),
        PlanOp::All => Ok(ctx.store().live_items()),
        PlanOp::Lookup { attribute, value } => match ctx.entries(attribute) {
            Some(entries) => entries.lookup(value),
            None => Ok(Vec::new()),
        },
        PlanOp::Range {
            attribute,
            lower,
            upper,
        } => match ctx.entries(attribute) {
            Some(entries) => entries.range_ids(lower.as_ref(), upper.as_ref()),
            None => Ok(Vec::new()),
        },
        PlanOp::Exists { attribute } => {
            Ok(ctx.entries(attribute).map(|e| e.all_items()).unwrap_or_default())
        }
        PlanOp::Traverse {
            attribute,
            direction,
            sub,
        } => {
            let reached = evaluate(ctx, sub)?;
            let mut out = Vec::new();
            match direction {
                Direction::Forward => {
                    let Some(entries) = ctx.entries(attribute) else {
                        return Ok(Vec::new());
                    };
                    for target in reached {
                        out.extend(entries.reverse_lookup(target));
                    }
                }
                Direction::Reverse => {
                    for source in reached {
                        let values = ctx.store().values(source, attribute).unwrap_or_default();
                        out.extend(values.iter().filter_map(Value::as_ref_id));
                    }
                }
            }
            out.sort_unstable();
            out.dedup();
            Ok(out)
        }
        PlanOp::Intersect(children) => {
            let mut iter = children.iter();
            let mut candidates = match iter.next() {
                Some(first) => evaluate(ctx, first)?,
                None => return Ok(ctx.store().live_items()),
            };
            for child in iter {
                if candidates.is_empty() {
                    break;
                }
                if candidates.len().saturating_mul(RESIDUAL_RATIO) <= child.estimate {
                    trace!(candidates = candidates.len(), estimate = child.estimate, "query.and.residual");
                    let mut kept = Vec::with_capacity(candidates.len());
                    for id in candidates {
                        if matches(ctx, child, id)? {
                            kept.push(id);
                        }
                    }
                    candidates = kept;
                } else {
                    let other = evaluate(ctx, child)?;
                    candidates = intersect_sorted(&candidates, &other);
                }
            }
            Ok(candidates)
        }
        PlanOp::Union(children) => {
            let mut out = Vec::new();
            for child in children {
                let next = evaluate(ctx, child)?;
                out = union_sorted(&out, &next);
            }
            Ok(out)
        }
        PlanOp::Complement(child) => {
            let excluded = evaluate(ctx, child)?;
            Ok(difference_sorted(&ctx.store().live_items(), &excluded))
        }
    }
}

/// Tests a single live item against `node` without touching other candidates.
pub(crate) fn matches(ctx: &QueryContext<'_>, node: &PlanNode, id: ItemId) -> Result<bool> {
    let values_of = |attribute: &str| ctx.store().values(id, attribute).unwrap_or_default();
    match &node.op {
        PlanOp::Empty => Ok(false),
        PlanOp::All => Ok(ctx.store().exists(id)),
        PlanOp::Lookup { attribute, value } => Ok(values_of(attribute)
            .iter()
            .any(|v| v.compare(value) == Some(std::cmp::Ordering::Equal))),
        PlanOp::Range {
            attribute,
            lower,
            upper,
        } => Ok(values_of(attribute)
            .iter()
            .any(|v| within(v, lower.as_ref(), upper.as_ref()))),
        PlanOp::Exists { attribute } => Ok(!values_of(attribute).is_empty()),
        PlanOp::Traverse {
            attribute,
            direction,
            sub,
        } => {
            let reached: Vec<ItemId> = match direction {
                Direction::Forward => values_of(attribute)
                    .iter()
                    .filter_map(Value::as_ref_id)
                    .collect(),
                Direction::Reverse => ctx
                    .entries(attribute)
                    .map(|entries| entries.reverse_lookup(id))
                    .unwrap_or_default(),
            };
            for next in reached {
                if matches(ctx, sub, next)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        PlanOp::Intersect(children) => {
            for child in children {
                if !matches(ctx, child, id)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        PlanOp::Union(children) => {
            for child in children {
                if matches(ctx, child, id)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        PlanOp::Complement(child) => Ok(ctx.store().exists(id) && !matches(ctx, child, id)?),
    }
}

fn within(value: &Value, lower: Bound<&Value>, upper: Bound<&Value>) -> bool {
    use std::cmp::Ordering::{Equal, Greater, Less};
    let above = match lower {
        Bound::Included(lo) => matches!(value.compare(lo), Some(Greater | Equal)),
        Bound::Excluded(lo) => matches!(value.compare(lo), Some(Greater)),
        Bound::Unbounded => true,
    };
    let below = match upper {
        Bound::Included(hi) => matches!(value.compare(hi), Some(Less | Equal)),
        Bound::Excluded(hi) => matches!(value.compare(hi), Some(Less)),
        Bound::Unbounded => true,
    };
    above && below
}

enum Source {
    Ids {
        ids: Vec<ItemId>,
        pos: usize,
    },
    Ordered {
        scan: OrderedScan,
        candidates: Vec<ItemId>,
        emitted: FxHashSet<ItemId>,
        batch: Vec<ItemId>,
        batch_pos: usize,
        scan_done: bool,
        tail_pos: usize,
    },
}

/// Lazy, single-pass sequence of matching items.
///
/// Borrows the transaction that produced it, so it cannot outlive the locks
/// that keep its indexes stable.
pub struct ResultSet<'t> {
    source: Source,
    _txn: PhantomData<&'t ()>,
}

impl<'t> ResultSet<'t> {
    pub(crate) fn unordered(ids: Vec<ItemId>) -> Self {
        Self {
            source: Source::Ids { ids, pos: 0 },
            _txn: PhantomData,
        }
    }

    /// Streams `candidates` (ascending ids) in the order of `scan`. Items with
    /// several values appear at their first position; items without any value
    /// for the ordering attribute follow, ascending by id.
    pub(crate) fn ordered(scan: OrderedScan, candidates: Vec<ItemId>) -> Self {
        Self {
            source: Source::Ordered {
                scan,
                candidates,
                emitted: FxHashSet::default(),
                batch: Vec::with_capacity(ORDERED_BATCH),
                batch_pos: 0,
                scan_done: false,
                tail_pos: 0,
            },
            _txn: PhantomData,
        }
    }

    /// Number of items the query matched; known before iteration begins.
    pub fn candidate_count(&self) -> usize {
        match &self.source {
            Source::Ids { ids, .. } => ids.len(),
            Source::Ordered { candidates, .. } => candidates.len(),
        }
    }

    /// Drains the remaining items.
    pub fn collect_ids(self) -> Result<Vec<ItemId>> {
        self.collect()
    }
}

impl fmt::Debug for ResultSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ordered = matches!(self.source, Source::Ordered { .. });
        f.debug_struct("ResultSet")
            .field("candidates", &self.candidate_count())
            .field("ordered", &ordered)
            .finish()
    }
}

impl Iterator for ResultSet<'_> {
    type Item = Result<ItemId>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Ids { ids, pos } => {
                let id = ids.get(*pos).copied()?;
                *pos += 1;
                Some(Ok(id))
            }
            Source::Ordered {
                scan,
                candidates,
                emitted,
                batch,
                batch_pos,
                scan_done,
                tail_pos,
            } => {
                while !*scan_done {
                    if *batch_pos >= batch.len() {
                        batch.clear();
                        *batch_pos = 0;
                        match scan.next_batch(batch, ORDERED_BATCH) {
                            Ok(more) if batch.is_empty() && !more => {
                                *scan_done = true;
                                break;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                *scan_done = true;
                                return Some(Err(err));
                            }
                        }
                    }
                    while *batch_pos < batch.len() {
                        let id = batch[*batch_pos];
                        *batch_pos += 1;
                        if candidates.binary_search(&id).is_ok() && emitted.insert(id) {
                            return Some(Ok(id));
                        }
                    }
                }
                while *tail_pos < candidates.len() {
                    let id = candidates[*tail_pos];
                    *tail_pos += 1;
                    if !emitted.contains(&id) {
                        return Some(Ok(id));
                    }
                }
                None
            }
        }
    }
}
