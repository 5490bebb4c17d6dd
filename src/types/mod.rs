#![forbid(unsafe_code)]

//! Identifiers, values and the crate-wide error type.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::primitives::concurrency::LockLevel;

pub mod checksum;
mod value;

pub use value::{IndexKey, Value, ValueKind};

/// Stable identity of an item.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ItemId {
    fn from(value: u64) -> Self {
        ItemId(value)
    }
}

impl From<ItemId> for u64 {
    fn from(value: ItemId) -> Self {
        value.0
    }
}

/// Monotonic transaction identifier, used for logging and commit records.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the associative store.
#[derive(thiserror::Error, Debug)]
pub enum AssocError {
    /// A value of another kind was linked under an attribute whose index is already typed.
    #[error("attribute '{attribute}' holds {expected} values, cannot link a {found} value")]
    InvalidAttributeKind {
        /// Attribute receiving the value.
        attribute: String,
        /// Kind already stored under the attribute.
        expected: ValueKind,
        /// Kind of the rejected value.
        found: ValueKind,
    },
    /// Deallocation of an item that other items still reference.
    #[error("item {item} is still referenced by {referrers} link(s)")]
    DanglingReference {
        /// Item that was to be deallocated.
        item: ItemId,
        /// Number of remaining referencing links.
        referrers: usize,
    },
    /// Operation on a committed or rolled back transaction.
    #[error("transaction is closed")]
    TransactionClosed,
    /// Bounded wait on a lock ladder expired.
    #[error("timed out waiting for {level:?} lock on '{resource}'")]
    LockTimeout {
        /// Name of the guarded resource.
        resource: String,
        /// Level that was requested.
        level: LockLevel,
    },
    /// Predicate compares an attribute against a value of an incompatible kind.
    #[error("cannot compare attribute '{attribute}' ({expected}) with a {found} value")]
    TypeMismatchInComparison {
        /// Attribute referenced by the predicate.
        attribute: String,
        /// Kind stored under the attribute.
        expected: ValueKind,
        /// Kind of the literal in the predicate.
        found: ValueKind,
    },
    /// Item identity does not exist (never created, rolled back or deallocated).
    #[error("item {0} does not exist")]
    UnknownItem(ItemId),
    /// Mutation attempted inside a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnlyTransaction,
    /// The database handle was closed.
    #[error("database is closed")]
    DatabaseClosed,
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Commit record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Durable state failed an integrity check.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a formatted message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
}

impl AssocError {
    /// Returns a machine-readable code for the error variant.
    pub fn code(&self) -> &'static str {
        match self {
            AssocError::InvalidAttributeKind { .. } => "InvalidAttributeKind",
            AssocError::DanglingReference { .. } => "DanglingReference",
            AssocError::TransactionClosed => "TransactionClosed",
            AssocError::LockTimeout { .. } => "LockTimeout",
            AssocError::TypeMismatchInComparison { .. } => "TypeMismatchInComparison",
            AssocError::UnknownItem(_) => "UnknownItem",
            AssocError::ReadOnlyTransaction => "ReadOnlyTransaction",
            AssocError::DatabaseClosed => "DatabaseClosed",
            AssocError::Io(_) => "Io",
            AssocError::Serialization(_) => "Serialization",
            AssocError::Corruption(_) => "Corruption",
            AssocError::Invalid(_) | AssocError::InvalidOwned(_) => "Invalid",
        }
    }

    /// Whether retrying the same operation later can succeed without rolling back first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AssocError::LockTimeout { .. })
    }
}

impl From<serde_json::Error> for AssocError {
    fn from(err: serde_json::Error) -> Self {
        AssocError::Serialization(err.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, AssocError>;
