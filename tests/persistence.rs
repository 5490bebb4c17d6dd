#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use assocdb::storage::{CommitRecord, MemoryStore, ObjectStore};
use assocdb::{
    attr, AssocError, Database, DbOptions, DeallocPolicy, ItemId, Result, TxnState, Value,
};
use tempfile::tempdir;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn populate(path: &Path) -> Result<(ItemId, ItemId)> {
    let db = Database::open(DbOptions::new().with_path(path))?;
    let mut tx = db.start_read_write()?;
    let disease = tx.create_item()?;
    tx.link(disease, "name", "flu")?;
    let patient = tx.create_item()?;
    tx.link(patient, "age", 55)?;
    tx.link(patient, "disease", disease)?;
    tx.link(patient, "note", "persistent cough")?;
    tx.include_in_fulltext_index(patient, Some(&["note"][..]))?;
    tx.commit()?;

    let mut tx = db.start_read_write()?;
    tx.update(patient, "age", 56)?;
    tx.commit()?;
    db.close()?;
    Ok((disease, patient))
}

#[test]
fn reopen_replays_every_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("assoc.log");
    let (disease, patient) = populate(&path)?;

    let db = Database::open(DbOptions::new().with_path(&path))?;
    assert_eq!(db.stats()?.commits, 2);
    let tx = db.start_read_only()?;
    assert_eq!(tx.values(patient, "age")?, vec![Value::Int(56)]);
    assert_eq!(tx.reverse_lookup("disease", disease)?, vec![patient]);
    let found = tx
        .find(&attr("disease").r#in(attr("name").eq("flu")), None)?
        .collect_ids()?;
    assert_eq!(found, vec![patient]);
    let hits = tx.full_text_search("cough", 10, 1_000)?;
    assert_eq!(hits.hits.len(), 1);
    drop(tx);

    // Identities are never reused after a restart.
    let mut tx = db.start_read_write()?;
    let fresh = tx.create_item()?;
    assert!(fresh > patient && fresh > disease);
    tx.commit()?;
    Ok(())
}

#[test]
fn torn_tail_is_discarded_on_open() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("assoc.log");
    let (_, patient) = populate(&path)?;
    let intact_len = std::fs::metadata(&path)?.len();

    let mut file = OpenOptions::new().append(true).open(&path)?;
    file.write_all(&[64, 0, 0, 0, 1, 2, 3, 4, b'{', b'"'])?;
    drop(file);

    let db = Database::open(DbOptions::new().with_path(&path))?;
    assert_eq!(std::fs::metadata(&path)?.len(), intact_len);
    let tx = db.start_read_only()?;
    assert_eq!(tx.values(patient, "age")?, vec![Value::Int(56)]);
    Ok(())
}

#[test]
fn damaged_frame_before_the_tail_is_corruption() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("assoc.log");
    populate(&path)?;

    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(10))?;
    file.read_exact(&mut byte)?;
    file.seek(SeekFrom::Start(10))?;
    file.write_all(&[byte[0] ^ 0x20])?;
    drop(file);

    let err = Database::open(DbOptions::new().with_path(&path)).unwrap_err();
    assert_eq!(err.code(), "Corruption");
    Ok(())
}

#[test]
fn closed_database_refuses_new_transactions() -> Result<()> {
    init_tracing();
    let db = Database::open_in_memory()?;
    let mut tx = db.start_read_write()?;
    db.close()?;
    assert!(db.is_closed());
    assert!(format!("{db:?}").contains("closed: true"));
    assert!(matches!(db.start_read_only(), Err(AssocError::DatabaseClosed)));
    assert!(matches!(tx.create_item(), Err(AssocError::DatabaseClosed)));
    // Closing twice is harmless.
    db.close()?;
    Ok(())
}

struct FlakyStore {
    inner: MemoryStore,
    failing: Arc<AtomicBool>,
}

impl ObjectStore for FlakyStore {
    fn replay(&self) -> Result<Vec<CommitRecord>> {
        self.inner.replay()
    }

    fn append(&self, record: &CommitRecord) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AssocError::Io(std::io::Error::other("disk full")));
        }
        self.inner.append(record)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[test]
fn failed_append_rolls_the_transaction_back() -> Result<()> {
    init_tracing();
    let failing = Arc::new(AtomicBool::new(false));
    let store = FlakyStore {
        inner: MemoryStore::new(),
        failing: Arc::clone(&failing),
    };
    let db = Database::open_with_store(DbOptions::new(), Box::new(store))?;

    let mut tx = db.start_read_write()?;
    let item = tx.create_item()?;
    tx.link(item, "status", "admitted")?;
    tx.commit()?;

    failing.store(true, Ordering::SeqCst);
    let mut tx = db.start_read_write()?;
    tx.update(item, "status", "discharged")?;
    let other = tx.create_item()?;
    tx.link(other, "status", "admitted")?;
    let err = tx.commit().unwrap_err();
    assert_eq!(err.code(), "Io");
    assert_eq!(tx.state(), TxnState::RolledBack);

    failing.store(false, Ordering::SeqCst);
    let tx = db.start_read_only()?;
    assert_eq!(tx.lookup("status", "admitted")?, vec![item]);
    assert!(tx.lookup("status", "discharged")?.is_empty());
    assert!(!tx.exists(other)?);
    assert_eq!(db.stats()?.commits, 1);
    Ok(())
}

#[test]
fn options_load_from_toml() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = dir.path().join("assoc.toml");
    std::fs::write(
        &config,
        "dealloc_policy = \"cascade\"\nlock_timeout_ms = 250\n\n[fulltext]\nprefix_weight = 0.25\n",
    )?;
    let options = DbOptions::load(&config)?;
    assert_eq!(options.dealloc_policy, DeallocPolicy::Cascade);
    assert_eq!(options.lock_timeout_ms, Some(250));
    assert_eq!(options.fulltext.prefix_weight, 0.25);
    assert!(options.sync_on_commit);
    assert!(options.path.is_none());
    Database::open(options)?.close()?;
    Ok(())
}

#[test]
fn infinite_floats_are_refused_and_the_log_stays_readable() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("assoc.log");
    let db = Database::open(DbOptions::new().with_path(&path))?;
    let mut tx = db.start_read_write()?;
    let item = tx.create_item()?;
    for float in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
        let err = tx.link(item, "dose", float).unwrap_err();
        assert_eq!(err.code(), "Invalid");
        let err = tx.update(item, "dose", float).unwrap_err();
        assert_eq!(err.code(), "Invalid");
    }
    tx.link(item, "dose", 2.5)?;
    tx.commit()?;
    db.close()?;

    let db = Database::open(DbOptions::new().with_path(&path))?;
    let tx = db.start_read_only()?;
    assert_eq!(tx.values(item, "dose")?, vec![Value::Float(2.5)]);
    Ok(())
}
