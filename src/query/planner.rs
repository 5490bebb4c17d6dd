//! Turns predicate trees into estimated evaluation plans.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

use parking_lot::RwLockReadGuard;

use crate::storage::index::{AttributeEntries, AttributeLadder};
use crate::storage::ItemStore;
use crate::types::{AssocError, Result, Value, ValueKind};

use super::ast::{Direction, Predicate};

/// Read access for one query: the committed item table plus the attribute
/// indexes the query touches, each already locked by the calling transaction.
pub(crate) struct QueryContext<'a> {
    store: &'a ItemStore,
    ladders: BTreeMap<String, AttributeLadder>,
}

impl<'a> QueryContext<'a> {
    pub(crate) fn new(store: &'a ItemStore, ladders: BTreeMap<String, AttributeLadder>) -> Self {
        Self { store, ladders }
    }

    pub(crate) fn store(&self) -> &'a ItemStore {
        self.store
    }

    /// Index contents for `attribute`; `None` when the index was never created.
    pub(crate) fn entries(&self, attribute: &str) -> Option<RwLockReadGuard<'_, AttributeEntries>> {
        self.ladders.get(attribute).map(|ladder| ladder.read_held())
    }

    fn live_count(&self) -> usize {
        self.store.len()
    }
}

/// Evaluation step chosen by the planner.
#[derive(Clone, Debug)]
pub(crate) enum PlanOp {
    /// Nothing can match.
    Empty,
    /// Every live item.
    All,
    /// Equality lookup.
    Lookup { attribute: String, value: Value },
    /// Range scan.
    Range {
        attribute: String,
        lower: Bound<Value>,
        upper: Bound<Value>,
    },
    /// Items holding any value.
    Exists { attribute: String },
    /// Reference traversal.
    Traverse {
        attribute: String,
        direction: Direction,
        sub: Box<PlanNode>,
    },
    /// Children in ascending estimate order.
    Intersect(Vec<PlanNode>),
    Union(Vec<PlanNode>),
    Complement(Box<PlanNode>),
}

#[derive(Clone, Debug)]
pub(crate) struct PlanNode {
    pub(crate) op: PlanOp,
    pub(crate) estimate: usize,
}

impl PlanNode {
    fn new(op: PlanOp, estimate: usize) -> Self {
        Self { op, estimate }
    }

    fn empty() -> Self {
        Self::new(PlanOp::Empty, 0)
    }

    fn is_empty(&self) -> bool {
        matches!(self.op, PlanOp::Empty)
    }

    /// Whether evaluation enumerates the live-item set rather than an index.
    pub(crate) fn reads_item_set(&self) -> bool {
        match &self.op {
            PlanOp::All | PlanOp::Complement(_) => true,
            PlanOp::Traverse { sub, .. } => sub.reads_item_set(),
            PlanOp::Intersect(children) | PlanOp::Union(children) => {
                children.iter().any(PlanNode::reads_item_set)
            }
            PlanOp::Empty | PlanOp::Lookup { .. } | PlanOp::Range { .. } | PlanOp::Exists { .. } => {
                false
            }
        }
    }
}

/// Builds a plan for `predicate`, validating comparisons against index kinds.
pub(crate) fn plan(ctx: &QueryContext<'_>, predicate: &Predicate) -> Result<PlanNode> {
    let live = ctx.live_count();
    match predicate {
        Predicate::All => Ok(PlanNode::new(PlanOp::All, live)),
        Predicate::Eq { attribute, value } => {
            reject_reverse_comparison(attribute)?;
            let Some(entries) = ctx.entries(attribute) else {
                return Ok(PlanNode::empty());
            };
            if !entries.check_comparable(value)? {
                return Ok(PlanNode::empty());
            }
            let estimate = entries.estimate_eq(value);
            Ok(PlanNode::new(
                PlanOp::Lookup {
                    attribute: attribute.clone(),
                    value: value.clone(),
                },
                estimate,
            ))
        }
        Predicate::Range {
            attribute,
            lower,
            upper,
        } => {
            reject_reverse_comparison(attribute)?;
            let Some(entries) = ctx.entries(attribute) else {
                return Ok(PlanNode::empty());
            };
            for bound in [lower, upper] {
                if let Bound::Included(v) | Bound::Excluded(v) = bound {
                    if !entries.check_comparable(v)? {
                        return Ok(PlanNode::empty());
                    }
                }
            }
            let estimate = entries.estimate_range(lower.as_ref(), upper.as_ref(), live);
            Ok(PlanNode::new(
                PlanOp::Range {
                    attribute: attribute.clone(),
                    lower: lower.clone(),
                    upper: upper.clone(),
                },
                estimate,
            ))
        }
        Predicate::Exists { attribute } => {
            reject_reverse_comparison(attribute)?;
            let Some(entries) = ctx.entries(attribute) else {
                return Ok(PlanNode::empty());
            };
            if entries.is_empty() {
                return Ok(PlanNode::empty());
            }
            let estimate = entries.posting_count().min(live);
            Ok(PlanNode::new(
                PlanOp::Exists {
                    attribute: attribute.clone(),
                },
                estimate,
            ))
        }
        Predicate::In {
            attribute,
            direction,
            sub,
        } => {
            let sub = plan(ctx, sub)?;
            let estimate = {
                let Some(entries) = ctx.entries(attribute) else {
                    return Ok(PlanNode::empty());
                };
                if entries.kind() != Some(ValueKind::Reference) || sub.is_empty() {
                    return Ok(PlanNode::empty());
                }
                let postings = entries.posting_count();
                let fan_out = postings.div_ceil(entries.distinct_values().max(1)).max(1);
                let reach = sub.estimate.saturating_mul(fan_out);
                match direction {
                    Direction::Forward => reach.min(postings),
                    Direction::Reverse => reach.min(entries.distinct_values()),
                }
            };
            Ok(PlanNode::new(
                PlanOp::Traverse {
                    attribute: attribute.clone(),
                    direction: *direction,
                    sub: Box::new(sub),
                },
                estimate,
            ))
        }
        Predicate::And(children) => {
            if children.is_empty() {
                return Ok(PlanNode::new(PlanOp::All, live));
            }
            let mut planned = Vec::with_capacity(children.len());
            for child in children {
                let node = plan(ctx, child)?;
                if node.is_empty() {
                    return Ok(PlanNode::empty());
                }
                planned.push(node);
            }
            planned.sort_by_key(|node| node.estimate);
            if planned.len() == 1 {
                return Ok(planned.remove(0));
            }
            let estimate = planned[0].estimate;
            Ok(PlanNode::new(PlanOp::Intersect(planned), estimate))
        }
        Predicate::Or(children) => {
            let mut planned = Vec::with_capacity(children.len());
            for child in children {
                let node = plan(ctx, child)?;
                if !node.is_empty() {
                    planned.push(node);
                }
            }
            match planned.len() {
                0 => Ok(PlanNode::empty()),
                1 => Ok(planned.remove(0)),
                _ => {
                    let estimate = planned
                        .iter()
                        .fold(0usize, |acc, n| acc.saturating_add(n.estimate))
                        .min(live);
                    Ok(PlanNode::new(PlanOp::Union(planned), estimate))
                }
            }
        }
        Predicate::Not(child) => {
            let child = plan(ctx, child)?;
            let estimate = live.saturating_sub(child.estimate);
            Ok(PlanNode::new(PlanOp::Complement(Box::new(child)), estimate))
        }
    }
}

fn reject_reverse_comparison(attribute: &str) -> Result<()> {
    if attribute.starts_with('-') {
        return Err(AssocError::InvalidOwned(format!(
            "'{attribute}' is a reverse traversal; use it with `in`, not a comparison"
        )));
    }
    Ok(())
}

/// Human-readable plan tree with per-node estimates.
#[derive(Clone, Debug)]
pub struct PlanExplain {
    /// Root of the explain tree.
    pub root: ExplainNode,
}

/// One operator of a [`PlanExplain`] tree.
#[derive(Clone, Debug)]
pub struct ExplainNode {
    /// Operator name.
    pub op: String,
    /// Operator properties, in display order.
    pub props: Vec<ExplainProp>,
    /// Estimated number of matching items.
    pub estimate: usize,
    /// Inputs, in evaluation order.
    pub inputs: Vec<ExplainNode>,
}

/// Key/value property of an [`ExplainNode`].
#[derive(Clone, Debug)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
}

impl ExplainNode {
    fn new(op: impl Into<String>, estimate: usize) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            estimate,
            inputs: Vec::new(),
        }
    }

    fn prop(mut self, key: &str, value: impl Into<String>) -> Self {
        self.props.push(ExplainProp {
            key: key.to_owned(),
            value: value.into(),
        });
        self
    }

    fn render(&self, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:indent$}{}", "", self.op, indent = depth * 2)?;
        for prop in &self.props {
            write!(f, " {}={}", prop.key, prop.value)?;
        }
        writeln!(f, " (est={})", self.estimate)?;
        for input in &self.inputs {
            input.render(depth + 1, f)?;
        }
        Ok(())
    }
}

impl fmt::Display for PlanExplain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.render(0, f)
    }
}

pub(crate) fn explain(node: &PlanNode) -> PlanExplain {
    PlanExplain {
        root: explain_node(node),
    }
}

fn explain_node(node: &PlanNode) -> ExplainNode {
    let est = node.estimate;
    match &node.op {
        PlanOp::Empty => ExplainNode::new("Empty", est),
        PlanOp::All => ExplainNode::new("AllItems", est),
        PlanOp::Lookup { attribute, value } => ExplainNode::new("IndexLookup", est)
            .prop("attr", attribute.as_str())
            .prop("value", value.to_string()),
        PlanOp::Range {
            attribute,
            lower,
            upper,
        } => ExplainNode::new("IndexRange", est)
            .prop("attr", attribute.as_str())
            .prop("lower", bound_label(lower))
            .prop("upper", bound_label(upper)),
        PlanOp::Exists { attribute } => {
            ExplainNode::new("IndexExists", est).prop("attr", attribute.as_str())
        }
        PlanOp::Traverse {
            attribute,
            direction,
            sub,
        } => {
            let op = match direction {
                Direction::Forward => "TraverseForward",
                Direction::Reverse => "TraverseReverse",
            };
            let mut out = ExplainNode::new(op, est).prop("attr", attribute.as_str());
            out.inputs.push(explain_node(sub));
            out
        }
        PlanOp::Intersect(children) => {
            let mut out = ExplainNode::new("Intersect", est);
            out.inputs = children.iter().map(explain_node).collect();
            out
        }
        PlanOp::Union(children) => {
            let mut out = ExplainNode::new("Union", est);
            out.inputs = children.iter().map(explain_node).collect();
            out
        }
        PlanOp::Complement(child) => {
            let mut out = ExplainNode::new("Complement", est);
            out.inputs.push(explain_node(child));
            out
        }
    }
}

fn bound_label(bound: &Bound<Value>) -> String {
    match bound {
        Bound::Included(v) => format!("[{v}"),
        Bound::Excluded(v) => format!("({v}"),
        Bound::Unbounded => "*".to_owned(),
    }
}
