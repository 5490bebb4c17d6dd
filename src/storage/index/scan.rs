use std::collections::VecDeque;
use std::sync::Arc;

use crate::primitives::concurrency::LockLadder;
use crate::types::{IndexKey, ItemId, Result};

use super::attr::AttributeEntries;
use super::types::{PostingStream, ScanDirection};

const KEYS_PER_REFILL: usize = 64;

/// Lazy walk over an attribute index in value order.
///
/// Keys are fetched in small batches, so a consumer that stops early never pays
/// for the rest of the index. Items with several values under the attribute are
/// yielded once per value; callers that need set semantics dedupe. The caller
/// must hold a guard on the ladder for as long as the scan is alive.
pub struct OrderedScan {
    ladder: Arc<LockLadder<AttributeEntries>>,
    direction: ScanDirection,
    cursor: Option<IndexKey>,
    pending: VecDeque<ItemId>,
    exhausted: bool,
}

impl OrderedScan {
    /// Scan over `ladder`'s keys; the caller keeps a lock on the ladder for the scan's lifetime.
    pub fn new(ladder: Arc<LockLadder<AttributeEntries>>, direction: ScanDirection) -> Self {
        Self {
            ladder,
            direction,
            cursor: None,
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    fn refill(&mut self) {
        let entries = self.ladder.read_held();
        let batch = entries.keys_after(self.cursor.as_ref(), self.direction, KEYS_PER_REFILL);
        drop(entries);
        if batch.len() < KEYS_PER_REFILL {
            self.exhausted = true;
        }
        for (key, items) in batch {
            self.pending.extend(items);
            self.cursor = Some(key);
        }
    }
}

impl PostingStream for OrderedScan {
    fn next_batch(&mut self, out: &mut Vec<ItemId>, max: usize) -> Result<bool> {
        let mut produced = 0;
        while produced < max {
            if self.pending.is_empty() {
                if self.exhausted {
                    break;
                }
                self.refill();
                continue;
            }
            if let Some(item) = self.pending.pop_front() {
                out.push(item);
                produced += 1;
            }
        }
        Ok(!(self.pending.is_empty() && self.exhausted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn ladder_with(count: i64) -> Arc<LockLadder<AttributeEntries>> {
        let mut entries = AttributeEntries::new("rank");
        for i in 0..count {
            entries.insert(IndexKey(Value::Int(i % 97)), ItemId(i as u64));
        }
        Arc::new(LockLadder::new("rank", entries, None))
    }

    #[test]
    fn ascending_scan_is_non_decreasing() -> Result<()> {
        let ladder = ladder_with(300);
        let guard = ladder.shared()?;
        let mut scan = OrderedScan::new(Arc::clone(&ladder), ScanDirection::Ascending);
        let mut ids = Vec::new();
        while scan.next_batch(&mut ids, 64)? {}
        assert_eq!(ids.len(), 300);
        let ranks: Vec<u64> = ids.iter().map(|id| id.0 % 97).collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
        drop(guard);
        Ok(())
    }

    #[test]
    fn descending_scan_stops_early() -> Result<()> {
        let ladder = ladder_with(300);
        let _guard = ladder.shared()?;
        let mut scan = OrderedScan::new(Arc::clone(&ladder), ScanDirection::Descending);
        let mut first = Vec::new();
        assert!(scan.next_batch(&mut first, 3)?);
        assert!(first.iter().all(|id| id.0 % 97 == 96));
        Ok(())
    }
}
