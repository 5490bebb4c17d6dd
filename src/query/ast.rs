//! Predicate trees evaluated by [`crate::db::Transaction::find`].
//!
//! Predicates form a closed set of variants interpreted by one recursive
//! planner. They are usually assembled with [`super::builder::attr`] and the
//! `&`, `|` and `!` operators rather than spelled out by hand.

use std::fmt;
use std::ops::{BitAnd, BitOr, Bound, Not};

use crate::storage::index::ScanDirection;
use crate::types::Value;

/// Direction of an `In` traversal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Direction {
    /// `I` matches when a reference stored in `I.attribute` points at a match.
    #[default]
    Forward,
    /// `I` matches when a matching item stores a reference to `I` in `attribute`.
    Reverse,
}

/// Boolean predicate over items.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    /// Every live item.
    All,
    /// `attribute` holds `value`.
    Eq {
        /// Attribute name.
        attribute: String,
        /// Compared value.
        value: Value,
    },
    /// `attribute` holds a value within the bounds.
    Range {
        /// Attribute name.
        attribute: String,
        /// Lower bound.
        lower: Bound<Value>,
        /// Upper bound.
        upper: Bound<Value>,
    },
    /// `attribute` holds at least one value.
    Exists {
        /// Attribute name.
        attribute: String,
    },
    /// Graph traversal through a reference-valued attribute.
    In {
        /// Attribute name, without any `-` prefix.
        attribute: String,
        /// Traversal direction.
        direction: Direction,
        /// Predicate the reached items must satisfy.
        sub: Box<Predicate>,
    },
    /// All children hold.
    And(Vec<Predicate>),
    /// At least one child holds.
    Or(Vec<Predicate>),
    /// The child does not hold.
    Not(Box<Predicate>),
}

impl Predicate {
    /// Conjunction of `children`, flattening nested conjunctions.
    pub fn and(children: impl IntoIterator<Item = Predicate>) -> Predicate {
        let mut flat = Vec::new();
        for child in children {
            match child {
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Predicate::All)
        } else {
            Predicate::And(flat)
        }
    }

    /// Disjunction of `children`, flattening nested disjunctions.
    pub fn or(children: impl IntoIterator<Item = Predicate>) -> Predicate {
        let mut flat = Vec::new();
        for child in children {
            match child {
                Predicate::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Predicate::All)
        } else {
            Predicate::Or(flat)
        }
    }

    /// Attribute names the predicate reads, sorted and deduplicated.
    pub fn attributes(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_attributes(&mut out);
        out.sort();
        out.dedup();
        out
    }

    fn collect_attributes(&self, out: &mut Vec<String>) {
        match self {
            Predicate::All => {}
            Predicate::Eq { attribute, .. }
            | Predicate::Range { attribute, .. }
            | Predicate::Exists { attribute } => out.push(attribute.clone()),
            Predicate::In { attribute, sub, .. } => {
                out.push(attribute.clone());
                sub.collect_attributes(out);
            }
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.collect_attributes(out);
                }
            }
            Predicate::Not(child) => child.collect_attributes(out),
        }
    }
}

impl BitAnd for Predicate {
    type Output = Predicate;

    fn bitand(self, rhs: Predicate) -> Predicate {
        Predicate::and([self, rhs])
    }
}

impl BitOr for Predicate {
    type Output = Predicate;

    fn bitor(self, rhs: Predicate) -> Predicate {
        Predicate::or([self, rhs])
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        match self {
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => f.write_str("all"),
            Predicate::Eq { attribute, value } => write!(f, "{attribute} == {value}"),
            Predicate::Range {
                attribute,
                lower,
                upper,
            } => {
                match lower {
                    Bound::Included(v) => write!(f, "{v} <= ")?,
                    Bound::Excluded(v) => write!(f, "{v} < ")?,
                    Bound::Unbounded => {}
                }
                f.write_str(attribute)?;
                match upper {
                    Bound::Included(v) => write!(f, " <= {v}"),
                    Bound::Excluded(v) => write!(f, " < {v}"),
                    Bound::Unbounded => Ok(()),
                }
            }
            Predicate::Exists { attribute } => write!(f, "exists({attribute})"),
            Predicate::In {
                attribute,
                direction,
                sub,
            } => {
                let prefix = match direction {
                    Direction::Forward => "",
                    Direction::Reverse => "-",
                };
                write!(f, "{prefix}{attribute} in ({sub})")
            }
            Predicate::And(children) => write_joined(f, children, " & "),
            Predicate::Or(children) => write_joined(f, children, " | "),
            Predicate::Not(child) => write!(f, "!({child})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, children: &[Predicate], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{child}")?;
    }
    f.write_str(")")
}

/// Result ordering for `find`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    /// Attribute whose values order the results.
    pub attribute: String,
    /// Scan direction.
    pub direction: ScanDirection,
}

impl OrderBy {
    /// Smallest value first.
    pub fn asc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            direction: ScanDirection::Ascending,
        }
    }

    /// Largest value first.
    pub fn desc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            direction: ScanDirection::Descending,
        }
    }
}
