//! Catalog visibility scenarios.
//!
//! Covers duplicate detection and write-write conflicts on create, snapshot
//! stability across a committed drop, and the parent/child commit rule.

#![allow(missing_docs)]

use basalt::storage::NameScope;
use basalt::{BasaltError, Engine, EngineOptions, Result, TxnState};

fn engine() -> Result<Engine> {
    Engine::open(EngineOptions::default())
}

#[test]
fn create_conflicts_and_duplicates() -> Result<()> {
    let engine = engine()?;
    let catalog = engine.catalog();

    let txn1 = engine.begin(b"txn1")?;
    catalog.create_database("d1", &txn1)?;
    assert!(matches!(
        catalog.create_database("d1", &txn1),
        Err(BasaltError::Duplicate)
    ));

    let txn2 = engine.begin(b"txn2")?;
    assert!(matches!(
        catalog.create_database("d1", &txn2),
        Err(BasaltError::WWConflict)
    ));
    txn2.rollback()?;

    txn1.commit()?;
    assert_eq!(txn1.state(), TxnState::Committed);

    let txn3 = engine.begin(b"txn3")?;
    assert!(matches!(
        catalog.create_database("d1", &txn3),
        Err(BasaltError::Duplicate)
    ));
    Ok(())
}

#[test]
fn create_after_concurrent_commit_conflicts() -> Result<()> {
    let engine = engine()?;
    let catalog = engine.catalog();

    let early = engine.begin(b"early")?;
    let writer = engine.begin(b"writer")?;
    catalog.create_database("shared", &writer)?;
    writer.commit()?;

    // The committed entry is newer than `early`'s snapshot.
    assert!(matches!(
        catalog.resolve(NameScope::Databases, "shared", &early),
        Err(BasaltError::NotFound)
    ));
    assert!(matches!(
        catalog.create_database("shared", &early),
        Err(BasaltError::WWConflict)
    ));
    Ok(())
}

#[test]
fn drop_keeps_older_snapshots_stable() -> Result<()> {
    let engine = engine()?;
    let catalog = engine.catalog();

    let txn1 = engine.begin(b"create")?;
    let db = catalog.create_database("d1", &txn1)?;
    txn1.commit()?;

    let txn2 = engine.begin(b"drop")?;
    catalog.drop_database("d1", &txn2)?;
    assert!(matches!(
        catalog.get_database("d1", &txn2),
        Err(BasaltError::NotFound)
    ));

    let txn3 = engine.begin(b"old reader")?;
    assert_eq!(catalog.get_database("d1", &txn3)?.id(), db.id());

    txn2.commit()?;

    let txn4 = engine.begin(b"new reader")?;
    assert!(matches!(
        catalog.get_database("d1", &txn4),
        Err(BasaltError::NotFound)
    ));
    assert_eq!(catalog.get_database("d1", &txn3)?.id(), db.id());
    Ok(())
}

#[test]
fn recreate_after_drop_resolves_by_snapshot() -> Result<()> {
    let engine = engine()?;
    let catalog = engine.catalog();

    let setup = engine.begin(b"")?;
    let first = catalog.create_database("d", &setup)?;
    setup.commit()?;

    let before = engine.begin(b"before")?;

    let swap = engine.begin(b"swap")?;
    catalog.drop_database("d", &swap)?;
    let second = catalog.create_database("d", &swap)?;
    assert_ne!(first.id(), second.id());
    swap.commit()?;

    let after = engine.begin(b"after")?;
    assert_eq!(catalog.get_database("d", &before)?.id(), first.id());
    assert_eq!(catalog.get_database("d", &after)?.id(), second.id());
    Ok(())
}

#[test]
fn child_commit_after_parent_drop_fails() -> Result<()> {
    let engine = engine()?;
    let catalog = engine.catalog();

    let setup = engine.begin(b"")?;
    let db = catalog.create_database("d", &setup)?;
    setup.commit()?;

    let child = engine.begin(b"child")?;
    catalog.create_table(db.id(), "t", &child)?;

    let dropper = engine.begin(b"dropper")?;
    catalog.drop_database("d", &dropper)?;
    dropper.commit()?;

    assert!(matches!(child.commit(), Err(BasaltError::RWConflict)));
    assert_eq!(child.state(), TxnState::Rollbacked);

    let reader = engine.begin(b"")?;
    assert!(catalog.databases(&reader)?.is_empty());
    Ok(())
}

#[test]
fn hierarchy_lists_visible_children() -> Result<()> {
    let engine = engine()?;
    let catalog = engine.catalog();

    let txn = engine.begin(b"")?;
    let db = catalog.create_database("d", &txn)?;
    let table = catalog.create_table(db.id(), "t", &txn)?;
    let segment = catalog.create_segment(table.id(), &txn)?;
    let blocks = [
        catalog.create_block(segment.id(), &txn)?,
        catalog.create_block(segment.id(), &txn)?,
    ];
    txn.commit()?;

    let dropper = engine.begin(b"")?;
    catalog.drop_block(blocks[0].id(), &dropper)?;
    dropper.commit()?;

    let reader = engine.begin(b"")?;
    let visible = catalog.children(segment.id(), &reader)?;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id(), blocks[1].id());
    assert_eq!(
        catalog.get_table(db.id(), "t", &reader)?.id(),
        table.id()
    );
    Ok(())
}
