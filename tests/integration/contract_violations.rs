//! Bookkeeping misuse panics instead of corrupting version state.

#![allow(missing_docs)]

use basalt::storage::VersionedEntry;
use basalt::{BasaltError, Engine, EngineOptions, ObjectId, Result, TxnState};

#[test]
#[should_panic(expected = "prepare_commit without owning txn")]
fn committing_a_settled_entry_panics() {
    let mut entry = VersionedEntry::new_committed(ObjectId(1), 5);
    entry.prepare_commit();
}

#[test]
#[should_panic(expected = "finalize without owning txn")]
fn double_finalize_panics() {
    let mut entry = VersionedEntry::new_committed(ObjectId(1), 5);
    entry.finalize();
}

#[test]
fn finished_transaction_rejects_further_use() -> Result<()> {
    let engine = Engine::open(EngineOptions::default())?;
    let txn = engine.begin(b"")?;
    txn.commit()?;
    assert_eq!(txn.state(), TxnState::Committed);
    assert!(matches!(
        txn.commit(),
        Err(BasaltError::IllegalStateTransition { .. })
    ));
    assert!(matches!(
        txn.rollback(),
        Err(BasaltError::IllegalStateTransition { .. })
    ));
    assert!(matches!(
        engine.catalog().create_database("late", &txn),
        Err(BasaltError::Invalid(_))
    ));
    Ok(())
}
