//! AssocDB: an embeddable associative database.
//!
//! Items carry dynamically named, multi-valued attributes whose values are
//! scalars or references to other items. Every attribute is indexed, so
//! predicates (equality, ranges, forward and reverse graph traversal, boolean
//! combinations) are answered from indexes, and selected attributes can feed a
//! ranked full-text index. All access goes through read-only or read-write
//! transactions guarded by per-index upgradeable locks.
//!
//! ```
//! use assocdb::{attr, Database, Value};
//!
//! # fn main() -> assocdb::Result<()> {
//! let db = Database::open_in_memory()?;
//! let mut tx = db.start_read_write()?;
//! let patient = tx.create_item()?;
//! tx.link(patient, "age", 55)?;
//! tx.commit()?;
//!
//! let tx = db.start_read_only()?;
//! let found = tx.find(&attr("age").gt(50), None)?.collect_ids()?;
//! assert_eq!(found, vec![patient]);
//! assert_eq!(tx.values(patient, "age")?, vec![Value::Int(55)]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod fulltext;
pub mod logging;
pub mod primitives;
pub mod query;
pub mod storage;
pub mod types;

pub use db::{Database, DbOptions, DbStats, DeallocPolicy, Transaction, TxnMode, TxnState};
pub use fulltext::{FullTextOptions, SearchHit, SearchResult};
pub use primitives::concurrency::{LadderGuard, LockLadder, LockLevel};
pub use query::{attr, Direction, OrderBy, PlanExplain, Predicate, ResultSet};
pub use storage::index::ScanDirection;
pub use types::{AssocError, ItemId, Result, TxnId, Value, ValueKind};
