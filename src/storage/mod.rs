//! Item storage, attribute indexes and the durable commit boundary.

/// Forward/reverse attribute indexes and ordered scans.
pub mod index;

mod backend;
mod item;
mod patch;

/// Durable commit log backends.
pub use backend::{LogFileStore, MemoryStore, ObjectStore};

/// Committed item table.
pub use item::{ItemRecord, ItemStore, Referrer};

/// Resolved commit batches.
pub use patch::{CommitRecord, Mutation, TextFields};
