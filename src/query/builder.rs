//! Fluent construction of predicates.
//!
//! ```
//! use assocdb::query::builder::attr;
//!
//! let older_flu_patients = attr("age").gt(50)
//!     & attr("diagnosis").r#in(attr("disease").r#in(attr("name").eq("flu")));
//! let doctors_with_patients = attr("-PatientDoctor").r#in(attr("age").exists());
//! # let _ = (older_flu_patients, doctors_with_patients);
//! ```

use std::ops::Bound;

use crate::types::Value;

use super::ast::{Direction, Predicate};

/// Starts a predicate on `name`. A leading `-` selects reverse traversal for
/// [`Attr::r#in`].
pub fn attr(name: impl Into<String>) -> Attr {
    let name = name.into();
    match name.strip_prefix('-') {
        Some(stripped) => Attr {
            name: stripped.to_owned(),
            direction: Direction::Reverse,
        },
        None => Attr {
            name,
            direction: Direction::Forward,
        },
    }
}

/// Attribute reference awaiting a comparison or traversal.
#[derive(Clone, Debug)]
pub struct Attr {
    name: String,
    direction: Direction,
}

impl Attr {
    /// Requests reverse traversal, same as a `-` prefix.
    pub fn reverse(mut self) -> Self {
        self.direction = Direction::Reverse;
        self
    }

    /// Attribute name without any `-` prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward, or reverse when built from a `-` name.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// `attribute == value`.
    pub fn eq(self, value: impl Into<Value>) -> Predicate {
        Predicate::Eq {
            attribute: self.comparable_name(),
            value: value.into(),
        }
    }

    /// Items that have the attribute but none of its values equals `value`.
    pub fn ne(self, value: impl Into<Value>) -> Predicate {
        let name = self.comparable_name();
        Predicate::and([
            Predicate::Exists {
                attribute: name.clone(),
            },
            !Predicate::Eq {
                attribute: name,
                value: value.into(),
            },
        ])
    }

    /// `attribute > value`.
    pub fn gt(self, value: impl Into<Value>) -> Predicate {
        self.range(Bound::Excluded(value.into()), Bound::Unbounded)
    }

    /// `attribute >= value`.
    pub fn ge(self, value: impl Into<Value>) -> Predicate {
        self.range(Bound::Included(value.into()), Bound::Unbounded)
    }

    /// `attribute < value`.
    pub fn lt(self, value: impl Into<Value>) -> Predicate {
        self.range(Bound::Unbounded, Bound::Excluded(value.into()))
    }

    /// `attribute <= value`.
    pub fn le(self, value: impl Into<Value>) -> Predicate {
        self.range(Bound::Unbounded, Bound::Included(value.into()))
    }

    /// `lo <= attribute <= hi`.
    pub fn between(self, lo: impl Into<Value>, hi: impl Into<Value>) -> Predicate {
        self.range(Bound::Included(lo.into()), Bound::Included(hi.into()))
    }

    /// Arbitrary bounds.
    pub fn range(self, lower: Bound<Value>, upper: Bound<Value>) -> Predicate {
        Predicate::Range {
            attribute: self.comparable_name(),
            lower,
            upper,
        }
    }

    /// `attribute` has at least one value.
    pub fn exists(self) -> Predicate {
        Predicate::Exists {
            attribute: self.comparable_name(),
        }
    }

    /// Traversal: reached items must satisfy `sub`.
    pub fn r#in(self, sub: Predicate) -> Predicate {
        Predicate::In {
            attribute: self.name,
            direction: self.direction,
            sub: Box::new(sub),
        }
    }

    // Comparisons on a reverse reference keep the `-` so the planner can reject them.
    fn comparable_name(self) -> String {
        match self.direction {
            Direction::Forward => self.name,
            Direction::Reverse => format!("-{}", self.name),
        }
    }
}
