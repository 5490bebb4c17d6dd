use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::trace;

use crate::primitives::concurrency::{LadderGuard, LockLadder};
use crate::types::{AssocError, Result};

use super::attr::AttributeEntries;

/// Shared handle to one attribute index and its lock ladder.
pub type AttributeLadder = Arc<LockLadder<AttributeEntries>>;

/// Guard over one attribute index.
pub type AttributeGuard = LadderGuard<AttributeEntries>;

/// Registry of per-attribute indexes, created on first use.
///
/// The registry map itself is only held for the lookup; all reads and writes of
/// index contents go through the attribute's ladder.
pub struct IndexManager {
    ladders: RwLock<BTreeMap<String, AttributeLadder>>,
    lock_timeout: Option<Duration>,
}

impl IndexManager {
    /// Creates an empty registry whose ladders time out after `lock_timeout`.
    pub fn new(lock_timeout: Option<Duration>) -> Self {
        Self {
            ladders: RwLock::new(BTreeMap::new()),
            lock_timeout,
        }
    }

    /// Returns the ladder for `attribute`, registering an empty index if needed.
    ///
    /// Index contents are only written by the commit path while it holds the
    /// exclusive level, so the handle never leaves the crate.
    pub(crate) fn ladder(&self, attribute: &str) -> AttributeLadder {
        if let Some(ladder) = self.ladders.read().get(attribute) {
            return Arc::clone(ladder);
        }
        let mut ladders = self.ladders.write();
        let ladder = ladders.entry(attribute.to_owned()).or_insert_with(|| {
            trace!(attribute, "index.attribute.register");
            Arc::new(LockLadder::new(
                attribute,
                AttributeEntries::new(attribute),
                self.lock_timeout,
            ))
        });
        Arc::clone(ladder)
    }

    /// Number of attributes with a registered index.
    pub fn attribute_count(&self) -> usize {
        self.ladders.read().len()
    }
}

/// Rejects attribute names that cannot be told apart from reverse traversal.
pub fn validate_attribute_name(attribute: &str) -> Result<()> {
    if attribute.is_empty() {
        return Err(AssocError::Invalid("attribute name must not be empty"));
    }
    if attribute.starts_with('-') {
        return Err(AssocError::InvalidOwned(format!(
            "attribute name '{attribute}' must not start with '-'"
        )));
    }
    Ok(())
}
