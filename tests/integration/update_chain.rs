//! Block update chain behavior through the public transaction API.

#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use bytes::Bytes;

use basalt::storage::UpdateChain;
use basalt::{BasaltError, Engine, EngineOptions, ObjectId, Result, Transaction};

fn engine_with_block() -> Result<(Engine, ObjectId)> {
    let engine = Engine::open(EngineOptions::default())?;
    let txn = engine.begin(b"setup")?;
    let catalog = engine.catalog();
    let db = catalog.create_database("db", &txn)?;
    let table = catalog.create_table(db.id(), "t", &txn)?;
    let segment = catalog.create_segment(table.id(), &txn)?;
    let block = catalog.create_block(segment.id(), &txn)?;
    txn.commit()?;
    Ok((engine, block.id()))
}

fn write_node(txn: &Transaction, chain: &Arc<UpdateChain>, i: u32) -> Result<()> {
    let base = i * 10;
    txn.delete_rows(chain, base, base + 9)?;
    txn.update_cell(chain, 10_000 + i, 3, Bytes::from(i.to_be_bytes().to_vec()))
}

#[test]
fn compaction_merges_only_committed_prefix() -> Result<()> {
    let (engine, block) = engine_with_block()?;
    let chain = engine.catalog().block_updates(block)?;

    for i in 0..50 {
        let txn = engine.begin(b"committed")?;
        write_node(&txn, &chain, i)?;
        txn.commit()?;
    }
    let mut pending = Vec::new();
    for i in 50..100 {
        let txn = engine.begin(b"pending")?;
        write_node(&txn, &chain, i)?;
        pending.push(txn);
    }
    assert_eq!(chain.len(), 100);

    assert_eq!(chain.compact()?, 50);
    assert_eq!(chain.len(), 51);
    let merged = chain.nodes().pop().expect("merged node");
    assert!(merged.is_committed());
    let (deletes, cells) =
        chain.read_node(&merged, |u| (u.local_deletes().len(), u.update_count()))?;
    assert_eq!(deletes, 500);
    assert_eq!(cells, 50);

    let reader = engine.begin(b"reader")?;
    let view = chain.view(reader.ctx())?;
    assert_eq!(view.deletes().len(), 500);
    assert_eq!(view.update_count(), 50);
    assert!(!view.is_deleted(500));

    for txn in pending {
        txn.rollback()?;
    }
    assert_eq!(chain.len(), 1);
    Ok(())
}

#[test]
fn concurrent_delete_on_same_node_conflicts_once() -> Result<()> {
    let (engine, block) = engine_with_block()?;
    let chain = engine.catalog().block_updates(block)?;
    let txn = engine.begin(b"writer")?;
    let node = txn.update_node(&chain)?;

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let chain = Arc::clone(&chain);
            let node = Arc::clone(&node);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                chain.delete_rows(&node, 5, 5)
            })
        })
        .collect();
    let results: Vec<Result<()>> = handles
        .into_iter()
        .map(|h| h.join().expect("delete thread"))
        .collect();

    let ok = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(BasaltError::WWConflict)))
        .count();
    assert_eq!((ok, conflicts), (1, 1));
    chain.read_node(&node, |u| assert_eq!(u.local_deletes().len(), 1))?;
    txn.commit()?;
    Ok(())
}

#[test]
fn concurrent_delete_across_transactions_conflicts() -> Result<()> {
    let (engine, block) = engine_with_block()?;
    let chain = engine.catalog().block_updates(block)?;
    let first = engine.begin(b"first")?;
    let second = engine.begin(b"second")?;

    first.delete_rows(&chain, 5, 5)?;
    assert!(matches!(
        second.delete_rows(&chain, 5, 5),
        Err(BasaltError::WWConflict)
    ));
    first.commit()?;

    let third = engine.begin(b"third")?;
    assert!(matches!(
        third.delete_rows(&chain, 5, 5),
        Err(BasaltError::WWConflict)
    ));
    assert!(chain.is_deleted(5, third.ctx())?);
    assert!(!chain.is_deleted(5, second.ctx())?);
    Ok(())
}

#[test]
fn snapshot_sees_only_earlier_commits() -> Result<()> {
    let (engine, block) = engine_with_block()?;
    let chain = engine.catalog().block_updates(block)?;

    let writer = engine.begin(b"writer")?;
    writer.update_cell(&chain, 1, 0, Bytes::from_static(b"v1"))?;
    let before = engine.begin(b"before")?;
    writer.commit()?;
    let after = engine.begin(b"after")?;

    assert_eq!(chain.value(0, 1, before.ctx())?, None);
    assert_eq!(chain.value(0, 1, after.ctx())?.as_deref(), Some(&b"v1"[..]));

    let rewriter = engine.begin(b"rewriter")?;
    rewriter.update_cell(&chain, 1, 0, Bytes::from_static(b"v2"))?;
    assert_eq!(chain.value(0, 1, rewriter.ctx())?.as_deref(), Some(&b"v2"[..]));
    assert_eq!(chain.value(0, 1, after.ctx())?.as_deref(), Some(&b"v1"[..]));
    rewriter.rollback()?;

    let last = engine.begin(b"last")?;
    assert_eq!(chain.value(0, 1, last.ctx())?.as_deref(), Some(&b"v1"[..]));
    Ok(())
}

#[test]
fn block_updates_requires_block() -> Result<()> {
    let (engine, _) = engine_with_block()?;
    let txn = engine.begin(b"")?;
    let db = engine.catalog().get_database("db", &txn)?;
    assert!(matches!(
        engine.catalog().block_updates(db.id()),
        Err(BasaltError::Invalid(_))
    ));
    assert!(matches!(
        engine.catalog().block_updates(ObjectId(9_999)),
        Err(BasaltError::NotFound)
    ));
    Ok(())
}
