#![allow(missing_docs)]

//! Patients, diagnoses and diseases linked by references, queried through
//! nested traversals.

use std::sync::Once;

use assocdb::{attr, Database, ItemId, OrderBy, Predicate, Result, Transaction, Value};

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

struct Ward {
    flu: ItemId,
    measles: ItemId,
    older_flu: ItemId,
    younger_flu: ItemId,
    older_measles: ItemId,
    older_flu_in_october: ItemId,
}

fn diagnose(tx: &mut Transaction, patient: ItemId, disease: ItemId, date: &str) -> Result<ItemId> {
    let diagnosis = tx.create_item()?;
    tx.link(diagnosis, "date", Value::date(date)?)?;
    tx.link(diagnosis, "disease", disease)?;
    tx.link(patient, "diagnosis", diagnosis)?;
    Ok(diagnosis)
}

fn admit(tx: &mut Transaction, name: &str, age: i64) -> Result<ItemId> {
    let patient = tx.create_item()?;
    tx.link(patient, "name", name)?;
    tx.link(patient, "age", age)?;
    Ok(patient)
}

fn ward(db: &Database) -> Result<Ward> {
    let mut tx = db.start_read_write()?;
    let flu = tx.create_item()?;
    tx.link(flu, "name", "flu")?;
    let measles = tx.create_item()?;
    tx.link(measles, "name", "measles")?;

    let older_flu = admit(&mut tx, "alma", 55)?;
    diagnose(&mut tx, older_flu, flu, "2010-09-14")?;

    let younger_flu = admit(&mut tx, "bert", 34)?;
    diagnose(&mut tx, younger_flu, flu, "2010-09-20")?;

    let older_measles = admit(&mut tx, "cleo", 71)?;
    diagnose(&mut tx, older_measles, measles, "2010-09-02")?;

    let older_flu_in_october = admit(&mut tx, "dev", 60)?;
    diagnose(&mut tx, older_flu_in_october, flu, "2010-10-03")?;
    tx.commit()?;

    Ok(Ward {
        flu,
        measles,
        older_flu,
        younger_flu,
        older_measles,
        older_flu_in_october,
    })
}

fn september_flu_over_50() -> Result<Predicate> {
    Ok(attr("age").gt(50)
        & attr("diagnosis").r#in(
            attr("date").between(Value::date("2010-09-01")?, Value::date("2010-09-30")?)
                & attr("disease").r#in(attr("name").eq("flu")),
        ))
}

#[test]
fn nested_traversal_finds_matching_patients() -> Result<()> {
    init_tracing();
    let db = Database::open_in_memory()?;
    let ward = ward(&db)?;
    let tx = db.start_read_only()?;
    let found = tx.find(&september_flu_over_50()?, None)?.collect_ids()?;
    assert_eq!(found, vec![ward.older_flu]);
    Ok(())
}

#[test]
fn update_moves_patient_between_age_buckets() -> Result<()> {
    init_tracing();
    let db = Database::open_in_memory()?;
    let ward = ward(&db)?;

    let mut tx = db.start_read_write()?;
    tx.update(ward.older_flu, "age", 56)?;
    tx.commit()?;

    let tx = db.start_read_only()?;
    assert_eq!(tx.find(&attr("age").eq(56), None)?.collect_ids()?, vec![ward.older_flu]);
    assert!(tx.find(&attr("age").eq(55), None)?.collect_ids()?.is_empty());
    assert_eq!(tx.values(ward.older_flu, "age")?, vec![Value::Int(56)]);
    let found = tx.find(&september_flu_over_50()?, None)?.collect_ids()?;
    assert_eq!(found, vec![ward.older_flu]);
    Ok(())
}

#[test]
fn reverse_traversal_reaches_patients_from_diseases() -> Result<()> {
    init_tracing();
    let db = Database::open_in_memory()?;
    let ward = ward(&db)?;
    let tx = db.start_read_only()?;

    // Diseases diagnosed at least once on a patient older than 65.
    let diseases = tx
        .find(
            &attr("-disease").r#in(attr("-diagnosis").r#in(attr("age").gt(65))),
            None,
        )?
        .collect_ids()?;
    assert_eq!(diseases, vec![ward.measles]);

    // Every flu patient, youngest first.
    let flu_patients = tx
        .find(
            &attr("diagnosis").r#in(attr("disease").r#in(attr("name").eq("flu"))),
            Some(&OrderBy::asc("age")),
        )?
        .collect_ids()?;
    assert_eq!(
        flu_patients,
        vec![ward.younger_flu, ward.older_flu, ward.older_flu_in_october]
    );
    assert!(!flu_patients.contains(&ward.older_measles));
    assert_eq!(tx.reverse_lookup("disease", ward.flu)?.len(), 3);
    Ok(())
}

#[test]
fn date_ranges_respect_bounds() -> Result<()> {
    init_tracing();
    let db = Database::open_in_memory()?;
    ward(&db)?;
    let tx = db.start_read_only()?;
    let september = tx.range(
        "date",
        Value::date("2010-09-01")?,
        Value::date("2010-09-30")?,
    )?;
    assert_eq!(september.len(), 3);
    let after = tx
        .find(&attr("date").gt(Value::date("2010-09-30")?), None)?
        .collect_ids()?;
    assert_eq!(after.len(), 1);
    Ok(())
}
