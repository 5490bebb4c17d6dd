use serde::{Deserialize, Serialize};

use crate::types::{ItemId, TxnId, Value};

/// Which attributes of an item feed its full-text document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextFields {
    /// Every string-valued attribute, re-evaluated whenever the item changes.
    AllStrings,
    /// Only the named attributes.
    Named(Vec<String>),
}

impl TextFields {
    /// Whether a change to `attribute` can alter the document.
    pub fn covers(&self, attribute: &str) -> bool {
        match self {
            TextFields::AllStrings => true,
            TextFields::Named(names) => names.iter().any(|n| n == attribute),
        }
    }
}

/// One resolved change of a commit.
///
/// Attribute changes carry the complete resulting sequence so that applying a
/// record twice leaves the same state as applying it once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// A new, empty item.
    CreateItem {
        /// Allocated identity.
        item: ItemId,
    },
    /// Replaces an attribute's sequence; an empty sequence removes the attribute.
    SetAttribute {
        /// Owning item.
        item: ItemId,
        /// Attribute name.
        attribute: String,
        /// Final value sequence.
        values: Vec<Value>,
    },
    /// Removes an item and all of its attributes.
    Deallocate {
        /// Removed item.
        item: ItemId,
    },
    /// Marks an item for full-text indexing.
    IndexText {
        /// Indexed item.
        item: ItemId,
        /// Source attributes.
        fields: TextFields,
    },
}

impl Mutation {
    /// Item the mutation applies to.
    pub fn item(&self) -> ItemId {
        match self {
            Mutation::CreateItem { item }
            | Mutation::SetAttribute { item, .. }
            | Mutation::Deallocate { item }
            | Mutation::IndexText { item, .. } => *item,
        }
    }
}

/// Everything one committed transaction changed, in application order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Committing transaction.
    pub txn: TxnId,
    /// Resolved mutations.
    pub mutations: Vec<Mutation>,
}

impl CommitRecord {
    /// Returns true if the record carries no mutations.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}
