//! Compaction nodes evicted to a file-backed log and read back.

#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use basalt::engine::UPDATE_LOG_FILE;
use basalt::metrics::CounterMetrics;
use basalt::primitives::wal::{FileLog, LogDevice, UPDATE_GROUP};
use basalt::storage::updates::decode_block_updates;
use basalt::{BufferOptions, Engine, EngineOptions, ObjectId, Result};

fn engine_with_block(dir: &std::path::Path, metrics: Arc<CounterMetrics>) -> Result<(Engine, ObjectId)> {
    let opts = EngineOptions::default()
        .buffer(BufferOptions::default().capacity_bytes(1))
        .log_dir(dir)
        .metrics(metrics);
    let engine = Engine::open(opts)?;
    let txn = engine.begin(b"setup")?;
    let catalog = engine.catalog();
    let db = catalog.create_database("db", &txn)?;
    let table = catalog.create_table(db.id(), "t", &txn)?;
    let segment = catalog.create_segment(table.id(), &txn)?;
    let block = catalog.create_block(segment.id(), &txn)?;
    txn.commit()?;
    Ok((engine, block.id()))
}

#[test]
fn evicted_compaction_node_reloads_from_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let (engine, block) = engine_with_block(dir.path(), Arc::clone(&metrics))?;
    let chain = engine.catalog().block_updates(block)?;

    for row in 0..20u32 {
        let txn = engine.begin(b"")?;
        txn.delete_rows(&chain, row * 2, row * 2)?;
        txn.update_cell(&chain, 1_000 + row, 1, Bytes::from(vec![row as u8; 32]))?;
        txn.commit()?;
    }
    assert_eq!(engine.compact(block)?, 20);
    let merged = chain.nodes().pop().expect("merged node");
    assert!(!merged.is_resident(), "tiny pool evicts the merged node");
    assert!(metrics.spilled_bytes.load(Ordering::Relaxed) > 0);

    let reader = engine.begin(b"reader")?;
    let view = chain.view(reader.ctx())?;
    assert_eq!(view.deletes().len(), 20);
    assert!(view.is_deleted(38));
    assert!(!view.is_deleted(39));
    assert_eq!(view.value(1, 1_007).map(|v| v.len()), Some(32));
    assert!(metrics.reloaded_bytes.load(Ordering::Relaxed) > 0);
    assert!(engine.buffer_pool().stats().loads >= 1);
    drop(reader);
    drop(chain);
    drop(engine);

    let log = FileLog::open(dir.path().join(UPDATE_LOG_FILE))?;
    assert_eq!(log.frame_count(), 1);
    let payload = log.load(UPDATE_GROUP, 1)?;
    let decoded = decode_block_updates(&payload)?;
    assert_eq!(decoded.block_id(), block);
    assert_eq!(decoded.local_deletes().len(), 20);
    assert_eq!(decoded.update_count(), 20);
    Ok(())
}

#[test]
fn uncommitted_nodes_are_never_spilled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let metrics = Arc::new(CounterMetrics::default());
    let (engine, block) = engine_with_block(dir.path(), Arc::clone(&metrics))?;
    let chain = engine.catalog().block_updates(block)?;

    let pending = engine.begin(b"pending")?;
    pending.delete_rows(&chain, 0, 99)?;
    engine.buffer_pool().shrink();
    assert_eq!(engine.compact(block)?, 0);
    assert!(chain.nodes().iter().all(|node| node.is_resident()));
    assert_eq!(metrics.spilled_bytes.load(Ordering::Relaxed), 0);
    pending.rollback()?;
    assert!(chain.is_empty());
    Ok(())
}
