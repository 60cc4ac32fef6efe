//! Concurrent writers and readers over one catalog and one update chain.
//!
//! Writers race to delete disjoint and overlapping rows and to create and drop
//! databases; readers check that each snapshot stays stable while they hold
//! it.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use rand::{rngs::StdRng, Rng, SeedableRng};

use basalt::{BasaltError, Engine, EngineOptions, ObjectId, Result};

const WRITERS: usize = 4;
const READERS: usize = 3;
const ROUNDS: usize = 200;
const ROWS: u32 = 256;

fn setup() -> Result<(Arc<Engine>, ObjectId)> {
    let engine = Arc::new(Engine::open(EngineOptions::default())?);
    let txn = engine.begin(b"setup")?;
    let catalog = engine.catalog();
    let db = catalog.create_database("stress", &txn)?;
    let table = catalog.create_table(db.id(), "rows", &txn)?;
    let segment = catalog.create_segment(table.id(), &txn)?;
    let block = catalog.create_block(segment.id(), &txn)?;
    txn.commit()?;
    Ok((engine, block.id()))
}

#[test]
fn each_row_is_deleted_at_most_once() -> Result<()> {
    let (engine, block) = setup()?;
    let chain = engine.catalog().block_updates(block)?;
    let committed_rows = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let conflicts = Arc::new(AtomicU64::new(0));

    let writers: Vec<_> = (0..WRITERS)
        .map(|seed| {
            let engine = Arc::clone(&engine);
            let chain = Arc::clone(&chain);
            let committed_rows = Arc::clone(&committed_rows);
            let conflicts = Arc::clone(&conflicts);
            thread::spawn(move || -> Result<()> {
                let mut rng = StdRng::seed_from_u64(seed as u64);
                for _ in 0..ROUNDS {
                    let row = rng.gen_range(0..ROWS);
                    let txn = engine.begin(b"writer")?;
                    match txn.delete_rows(&chain, row, row) {
                        Ok(()) => match txn.commit() {
                            Ok(()) => committed_rows.lock().push(row),
                            Err(BasaltError::WWConflict | BasaltError::RWConflict) => {
                                conflicts.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => return Err(err),
                        },
                        Err(BasaltError::WWConflict) => {
                            conflicts.fetch_add(1, Ordering::Relaxed);
                            txn.rollback()?;
                        }
                        Err(err) => return Err(err),
                    }
                    if rng.gen_bool(0.05) {
                        chain.compact_below(engine.txn_manager().gc_horizon())?;
                    }
                }
                Ok(())
            })
        })
        .collect();

    for writer in writers {
        writer.join().expect("writer thread")?;
    }

    let rows = committed_rows.lock().clone();
    let unique: BTreeSet<u32> = rows.iter().copied().collect();
    assert_eq!(unique.len(), rows.len(), "a row was deleted twice");

    let reader = engine.begin(b"final")?;
    let view = chain.view(reader.ctx())?;
    assert_eq!(view.deletes().len(), rows.len() as u64);
    assert_eq!(
        rows.len() as u64 + conflicts.load(Ordering::Relaxed),
        (WRITERS * ROUNDS) as u64
    );
    Ok(())
}

#[test]
fn snapshots_stay_stable_under_catalog_churn() -> Result<()> {
    let (engine, _) = setup()?;
    let stop = Arc::new(AtomicBool::new(false));

    let churn = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || -> Result<()> {
            let mut round = 0u64;
            while !stop.load(Ordering::Acquire) {
                let txn = engine.begin(b"churn")?;
                let name = format!("db{}", round % 8);
                let outcome = match engine.catalog().get_database(&name, &txn) {
                    Ok(_) => engine.catalog().drop_database(&name, &txn).map(|_| ()),
                    Err(BasaltError::NotFound) => {
                        engine.catalog().create_database(&name, &txn).map(|_| ())
                    }
                    Err(err) => Err(err),
                };
                match outcome.and_then(|()| txn.commit()) {
                    Ok(()) | Err(BasaltError::WWConflict | BasaltError::Duplicate) => {}
                    Err(err) => return Err(err),
                }
                round += 1;
            }
            Ok(())
        })
    };

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || -> Result<()> {
                for _ in 0..50 {
                    let txn = engine.begin(b"reader")?;
                    let first: Vec<ObjectId> = engine
                        .catalog()
                        .databases(&txn)?
                        .iter()
                        .map(|db| db.id())
                        .collect();
                    thread::yield_now();
                    let second: Vec<ObjectId> = engine
                        .catalog()
                        .databases(&txn)?
                        .iter()
                        .map(|db| db.id())
                        .collect();
                    assert_eq!(first, second, "snapshot changed under a reader");
                    txn.commit()?;
                }
                Ok(())
            })
        })
        .collect();

    for reader in readers {
        reader.join().expect("reader thread")?;
    }
    stop.store(true, Ordering::Release);
    churn.join().expect("churn thread")?;
    Ok(())
}
