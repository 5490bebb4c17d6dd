#![forbid(unsafe_code)]

//! Declarative predicates, planning and evaluation.

/// Predicate tree and result ordering.
pub mod ast;

/// Fluent predicate construction (`attr("age").gt(50) & ...`).
pub mod builder;

/// Plan evaluation and the lazy [`executor::ResultSet`].
pub mod executor;

/// Selectivity estimates, evaluation order and explain output.
pub mod planner;

pub use ast::{Direction, OrderBy, Predicate};
pub use builder::{attr, Attr};
pub use executor::ResultSet;
pub use planner::{ExplainNode, ExplainProp, PlanExplain};
