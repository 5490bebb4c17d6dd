//! Database handle, transactions and the commit pipeline.

mod commit;
mod database;
mod options;
mod transaction;

pub use database::{Database, DbStats};
pub use options::{DbOptions, DeallocPolicy};
pub use transaction::{Transaction, TxnMode, TxnState};
