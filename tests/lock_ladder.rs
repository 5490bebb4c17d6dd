#![allow(missing_docs)]

//! Concurrency behavior of the per-index lock ladders, directly and through
//! transactions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use assocdb::{
    attr, AssocError, Database, DbOptions, LockLadder, LockLevel, Predicate, Result, TxnState,
};

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

fn short_timeouts() -> DbOptions {
    DbOptions::new().lock_timeout(Some(Duration::from_millis(100)))
}

#[test]
fn competing_upgraders_do_not_deadlock() {
    init_tracing();
    let ladder = Arc::new(LockLadder::new("counter", 0u64, Some(Duration::from_secs(10))));
    let inside = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ladder = Arc::clone(&ladder);
            let inside = Arc::clone(&inside);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for _ in 0..50 {
                    let mut guard = ladder.update()?;
                    let seen = *guard.read();
                    guard.promote()?;
                    assert!(!inside.swap(true, Ordering::SeqCst), "two exclusive holders");
                    *guard.write()? = seen + 1;
                    inside.store(false, Ordering::SeqCst);
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked").expect("worker failed");
    }
    let guard = ladder.shared().expect("shared");
    assert_eq!(*guard.read(), 200);
}

#[test]
fn readers_share_while_a_writer_waits_for_update() -> Result<()> {
    init_tracing();
    let ladder = Arc::new(LockLadder::new("attr", (), Some(Duration::from_millis(50))));
    let first = ladder.shared()?;
    let second = ladder.shared()?;
    let upgrader = ladder.update()?;
    assert_eq!(upgrader.level(), LockLevel::Update);
    assert_eq!(ladder.snapshot().shared, 2);

    let err = ladder.update().unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), "LockTimeout");

    drop((first, second));
    let mut upgrader = upgrader;
    upgrader.promote()?;
    assert_eq!(upgrader.level(), LockLevel::Exclusive);
    assert!(matches!(ladder.shared(), Err(AssocError::LockTimeout { .. })));
    drop(upgrader);
    assert_eq!(ladder.shared()?.level(), LockLevel::Shared);
    Ok(())
}

#[test]
fn concurrent_writers_on_one_attribute_both_commit() -> Result<()> {
    init_tracing();
    let db = Database::open_in_memory()?;
    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2i64)
        .map(|n| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                let mut tx = db.start_read_write()?;
                let item = tx.create_item()?;
                tx.link(item, "counter", n)?;
                // Reading before writing is the upgrade pattern the ladder serializes.
                tx.values(item, "counter")?;
                tx.commit()
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }
    let tx = db.start_read_only()?;
    assert_eq!(tx.find(&attr("counter").exists(), None)?.collect_ids()?.len(), 2);
    Ok(())
}

#[test]
fn many_writers_serialize_without_lost_updates() -> Result<()> {
    init_tracing();
    let db = Database::open_in_memory()?;
    let mut tx = db.start_read_write()?;
    let counter = tx.create_item()?;
    tx.link(counter, "hits", 0)?;
    tx.commit()?;

    let committed = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let db = db.clone();
            let committed = Arc::clone(&committed);
            thread::spawn(move || -> Result<()> {
                for _ in 0..10 {
                    let mut tx = db.start_read_write()?;
                    let current = match tx.values(counter, "hits")?.first() {
                        Some(assocdb::Value::Int(n)) => *n,
                        _ => 0,
                    };
                    tx.update(counter, "hits", current + 1)?;
                    tx.commit()?;
                    committed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }
    assert_eq!(committed.load(Ordering::Relaxed), 40);
    let tx = db.start_read_only()?;
    assert_eq!(tx.values(counter, "hits")?, vec![assocdb::Value::Int(40)]);
    Ok(())
}

#[test]
fn open_reader_makes_commit_time_out_and_roll_back() -> Result<()> {
    init_tracing();
    let db = Database::open(short_timeouts())?;
    let mut tx = db.start_read_write()?;
    let item = tx.create_item()?;
    tx.link(item, "age", 30)?;
    tx.commit()?;

    let reader = db.start_read_only()?;
    assert_eq!(reader.lookup("age", 30)?, vec![item]);

    let mut writer = db.start_read_write()?;
    writer.update(item, "age", 31)?;
    let err = writer.commit().unwrap_err();
    assert!(matches!(err, AssocError::LockTimeout { .. }), "{err}");
    assert_eq!(writer.state(), TxnState::RolledBack);
    assert_eq!(reader.lookup("age", 30)?, vec![item]);
    drop(reader);

    let mut writer = db.start_read_write()?;
    writer.update(item, "age", 31)?;
    writer.commit()?;
    let reader = db.start_read_only()?;
    assert_eq!(reader.lookup("age", 31)?, vec![item]);
    Ok(())
}

#[test]
fn writers_on_disjoint_attributes_run_in_parallel() -> Result<()> {
    init_tracing();
    let db = Database::open(short_timeouts())?;
    let mut first = db.start_read_write()?;
    let mut second = db.start_read_write()?;
    let a = first.create_item()?;
    let b = second.create_item()?;
    first.link(a, "left", 1)?;
    second.link(b, "right", 2)?;
    second.commit()?;
    first.commit()?;

    let tx = db.start_read_only()?;
    assert_eq!(tx.lookup("left", 1)?, vec![a]);
    assert_eq!(tx.lookup("right", 2)?, vec![b]);
    Ok(())
}

#[test]
fn second_writer_waits_for_update_slot() -> Result<()> {
    init_tracing();
    let db = Database::open(short_timeouts())?;
    let mut first = db.start_read_write()?;
    let item = first.create_item()?;
    first.link(item, "shared", 1)?;

    let mut second = db.start_read_write()?;
    let other = second.create_item()?;
    let err = second.link(other, "shared", 2).unwrap_err();
    assert!(err.is_retryable());
    // The failed lock attempt leaves the transaction open.
    assert!(second.is_open());
    first.commit()?;
    second.link(other, "shared", 2)?;
    second.commit()?;
    Ok(())
}

#[test]
fn complement_query_repeats_while_a_writer_creates_items() -> Result<()> {
    init_tracing();
    let db = Database::open(short_timeouts())?;
    let mut tx = db.start_read_write()?;
    let aged = tx.create_item()?;
    tx.link(aged, "age", 1)?;
    tx.commit()?;

    let reader = db.start_read_only()?;
    let first = reader.find(&!attr("age").eq(1), None)?.collect_ids()?;
    assert!(first.is_empty());

    // The writer never touches `age`, only the set of live items.
    let writer_db = db.clone();
    let outcome = thread::spawn(move || -> Result<()> {
        let mut writer = writer_db.start_read_write()?;
        let fresh = writer.create_item()?;
        writer.link(fresh, "name", "newcomer")?;
        writer.commit()
    })
    .join()
    .expect("writer panicked");
    let err = outcome.unwrap_err();
    assert!(matches!(err, AssocError::LockTimeout { .. }), "{err}");

    let second = reader.find(&!attr("age").eq(1), None)?.collect_ids()?;
    assert_eq!(second, first);
    assert_eq!(reader.find(&Predicate::All, None)?.collect_ids()?, vec![aged]);
    drop(reader);

    let mut writer = db.start_read_write()?;
    let fresh = writer.create_item()?;
    writer.link(fresh, "name", "newcomer")?;
    writer.commit()?;
    let reader = db.start_read_only()?;
    assert_eq!(reader.find(&!attr("age").eq(1), None)?.collect_ids()?, vec![fresh]);
    Ok(())
}

#[test]
fn index_only_queries_leave_item_creation_unblocked() -> Result<()> {
    init_tracing();
    let db = Database::open(short_timeouts())?;
    let reader = db.start_read_only()?;
    assert!(reader.find(&attr("age").eq(1), None)?.collect_ids()?.is_empty());

    let mut writer = db.start_read_write()?;
    let item = writer.create_item()?;
    writer.link(item, "name", "walk-in")?;
    writer.commit()?;
    assert_eq!(reader.lookup("name", "walk-in")?, vec![item]);
    Ok(())
}

#[test]
fn cross_ladder_wait_cycle_ends_in_a_timeout() -> Result<()> {
    init_tracing();
    let db = Database::open(short_timeouts())?;
    let mut tx = db.start_read_write()?;
    let item = tx.create_item()?;
    tx.link(item, "a", 1)?;
    tx.link(item, "b", 1)?;
    tx.commit()?;

    let reader = db.start_read_only()?;
    assert_eq!(reader.lookup("b", 1)?, vec![item]);

    let writer_db = db.clone();
    let writer = thread::spawn(move || -> Result<()> {
        let mut writer = writer_db.start_read_write()?;
        writer.update(item, "a", 2)?;
        writer.update(item, "b", 2)?;
        writer.commit()
    });
    thread::sleep(Duration::from_millis(30));
    // Depending on timing the writer already holds `a` exclusively; either way
    // the bounded wait ends the cycle instead of hanging.
    match reader.lookup("a", 1) {
        Ok(found) => assert_eq!(found, vec![item]),
        Err(err) => assert!(matches!(err, AssocError::LockTimeout { .. }), "{err}"),
    }
    let err = writer.join().expect("writer panicked").unwrap_err();
    assert!(matches!(err, AssocError::LockTimeout { .. }), "{err}");
    drop(reader);

    let tx = db.start_read_only()?;
    assert_eq!(tx.lookup("a", 1)?, vec![item]);
    Ok(())
}
