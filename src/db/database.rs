use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::fulltext::{FullTextIndex, Tokenizer, FULLTEXT_RESOURCE};
use crate::primitives::concurrency::LockLadder;
use crate::storage::index::IndexManager;
use crate::storage::{ItemStore, LogFileStore, MemoryStore, ObjectStore};
use crate::types::{AssocError, Result, TxnId};

use super::commit;
use super::options::DbOptions;
use super::transaction::{Transaction, TxnMode};

/// Lock resource name of the live-item set.
pub(crate) const ITEMS_RESOURCE: &str = "$items";

pub(crate) struct DbInner {
    pub(crate) options: DbOptions,
    pub(crate) store: ItemStore,
    pub(crate) indexes: IndexManager,
    /// Ladder over item existence. Commits that create or deallocate items
    /// hold it exclusively while they apply.
    pub(crate) items: Arc<LockLadder<()>>,
    pub(crate) fulltext: Arc<LockLadder<FullTextIndex>>,
    pub(crate) tokenizer: Tokenizer,
    pub(crate) backend: Box<dyn ObjectStore>,
    /// Serializes final validation, persistence and application of commits.
    pub(crate) commit_lock: Mutex<()>,
    next_txn: AtomicU64,
    commits: AtomicU64,
    closed: AtomicBool,
}

impl DbInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AssocError::DatabaseClosed);
        }
        Ok(())
    }

    pub(crate) fn record_commit(&self) -> u64 {
        self.commits.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Counters describing a database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Committed, non-deallocated items.
    pub live_items: usize,
    /// Attribute indexes created so far.
    pub attribute_indexes: usize,
    /// Items in the full-text index.
    pub fulltext_documents: usize,
    /// Distinct full-text terms.
    pub fulltext_terms: usize,
    /// Read-write commits applied since open, replayed ones included.
    pub commits: u64,
}

/// Handle to an associative database. Cloning shares the same database.
///
/// Indexes are only reachable through transactions, which hold the lock
/// ladders their reads and writes depend on:
///
/// ```compile_fail
/// let db = assocdb::Database::open_in_memory().unwrap();
/// let _ = db.index_manager();
/// ```
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.options.path)
            .field("live_items", &self.inner.store.len())
            .field("attribute_indexes", &self.inner.indexes.attribute_count())
            .field("commits", &self.inner.commits.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Database {
    /// Opens a database, replaying the commit log when `options.path` is set.
    pub fn open(options: DbOptions) -> Result<Self> {
        let backend: Box<dyn ObjectStore> = match &options.path {
            Some(path) => Box::new(LogFileStore::open(path, options.sync_on_commit)?),
            None => Box::new(MemoryStore::new()),
        };
        Self::open_with_store(options, backend)
    }

    /// Opens a purely in-memory database with default options.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(DbOptions::default())
    }

    /// Opens a database over a caller-supplied durable backend.
    pub fn open_with_store(options: DbOptions, backend: Box<dyn ObjectStore>) -> Result<Self> {
        options.validate()?;
        let timeout = options.lock_timeout_duration();
        let inner = Arc::new(DbInner {
            tokenizer: options.fulltext.tokenizer(),
            store: ItemStore::new(),
            indexes: IndexManager::new(timeout),
            items: Arc::new(LockLadder::new(ITEMS_RESOURCE, (), timeout)),
            fulltext: Arc::new(LockLadder::new(
                FULLTEXT_RESOURCE,
                FullTextIndex::new(),
                timeout,
            )),
            backend,
            commit_lock: Mutex::new(()),
            next_txn: AtomicU64::new(1),
            commits: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            options,
        });
        let records = inner.backend.replay()?;
        for record in &records {
            inner.next_txn.fetch_max(record.txn.0 + 1, Ordering::Relaxed);
            commit::apply_record(&inner, record)?;
            inner.record_commit();
        }
        info!(
            replayed = records.len(),
            items = inner.store.len(),
            path = ?inner.options.path,
            "db.open"
        );
        Ok(Self { inner })
    }

    /// Begins a read-only transaction (`StartReadOnlyTransaction`).
    pub fn start_read_only(&self) -> Result<Transaction> {
        self.begin(TxnMode::ReadOnly)
    }

    /// Begins a read-write transaction (`StartReadWriteTransaction`).
    pub fn start_read_write(&self) -> Result<Transaction> {
        self.begin(TxnMode::ReadWrite)
    }

    fn begin(&self, mode: TxnMode) -> Result<Transaction> {
        self.inner.ensure_open()?;
        let id = TxnId(self.inner.next_txn.fetch_add(1, Ordering::Relaxed));
        debug!(txn = %id, ?mode, "txn.begin");
        Ok(Transaction::new(Arc::clone(&self.inner), id, mode))
    }

    /// Flushes the commit log and refuses further transactions.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.backend.sync()?;
        info!(commits = self.inner.commits.load(Ordering::Relaxed), "db.close");
        Ok(())
    }

    /// Whether [`Database::close`] has been called on any handle.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Options the database was opened with.
    pub fn options(&self) -> &DbOptions {
        &self.inner.options
    }

    /// Current counters. Takes a short shared lock on the full-text index.
    pub fn stats(&self) -> Result<DbStats> {
        let guard = self.inner.fulltext.shared()?;
        let fulltext = guard.read();
        Ok(DbStats {
            live_items: self.inner.store.len(),
            attribute_indexes: self.inner.indexes.attribute_count(),
            fulltext_documents: fulltext.doc_count(),
            fulltext_terms: fulltext.term_count(),
            commits: self.inner.commits.load(Ordering::Relaxed),
        })
    }
}
