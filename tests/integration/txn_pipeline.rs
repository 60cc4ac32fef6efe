//! Two-stage commit pipeline: hooks, timestamps, shutdown and waits.

#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use basalt::metrics::CounterMetrics;
use basalt::txn::TxnCtx;
use basalt::{
    BasaltError, Engine, EngineOptions, Result, TxnManager, TxnOptions, TxnState, UNCOMMIT_TS,
};

#[test]
fn failing_hook_rolls_back_and_consumes_commit_ts() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let manager = TxnManager::with_metrics(TxnOptions::default(), metrics.clone())?;

    let failing = manager.start_txn(b"failing")?;
    failing.set_pre_commit_hook(|_: &TxnCtx| -> Result<()> {
        Err(BasaltError::Hook("rejected".into()))
    });
    assert!(matches!(failing.commit(), Err(BasaltError::Hook(_))));
    assert_eq!(failing.state(), TxnState::Rollbacked);
    let consumed = failing.commit_ts();
    assert_ne!(consumed, UNCOMMIT_TS);

    let next = manager.start_txn(b"next")?;
    assert!(next.start_ts() > consumed);
    next.commit()?;
    assert!(next.commit_ts() > consumed);
    assert_eq!(manager.last_commit_ts(), next.commit_ts());

    assert_eq!(metrics.committed.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.rolled_back.load(Ordering::Relaxed), 1);
    Ok(())
}

#[test]
fn many_committers_get_distinct_increasing_timestamps() -> Result<()> {
    let manager = Arc::new(TxnManager::new(
        TxnOptions::default().batch_size(8).commit_queue_capacity(4),
    )?);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || -> Result<Vec<(u64, u64)>> {
                let mut stamps = Vec::new();
                for _ in 0..50 {
                    let txn = manager.start_txn(b"")?;
                    txn.commit()?;
                    stamps.push((txn.start_ts(), txn.commit_ts()));
                }
                Ok(stamps)
            })
        })
        .collect();
    let mut commits = Vec::new();
    for handle in handles {
        for (start, commit) in handle.join().expect("committer")? {
            assert!(commit > start);
            commits.push(commit);
        }
    }
    let total = commits.len();
    commits.sort_unstable();
    commits.dedup();
    assert_eq!(commits.len(), total);
    assert_eq!(manager.active_count(), 0);
    Ok(())
}

#[test]
fn waits_are_bounded_by_timeout() -> Result<()> {
    let engine = Engine::open(
        EngineOptions::default()
            .txn(TxnOptions::default().commit_wait_timeout(Duration::from_millis(50))),
    )?;
    let setup = engine.begin(b"")?;
    engine.catalog().create_database("d", &setup)?;

    // Hold the writer inside the preparing stage with a slow hook.
    let started = Arc::new(std::sync::Barrier::new(2));
    let hook_started = Arc::clone(&started);
    setup.set_pre_commit_hook(move |_: &TxnCtx| -> Result<()> {
        hook_started.wait();
        thread::sleep(Duration::from_millis(300));
        Ok(())
    });
    let setup = Arc::new(setup);
    let committer = {
        let setup = Arc::clone(&setup);
        thread::spawn(move || setup.commit())
    };
    started.wait();
    let reader = engine.begin(b"reader")?;
    let outcome = engine.catalog().get_database("d", &reader);
    assert!(
        matches!(outcome, Err(BasaltError::WaitTimeout(id)) if id == setup.id()),
        "unexpected outcome {outcome:?}"
    );
    committer.join().expect("committer")?;
    assert!(engine.catalog().get_database("d", &reader).is_ok());
    Ok(())
}

#[test]
fn shutdown_drains_and_rejects() -> Result<()> {
    let manager = TxnManager::new(TxnOptions::default())?;
    let open = manager.start_txn(b"open")?;
    manager.shutdown();
    assert!(matches!(manager.start_txn(b"late"), Err(BasaltError::Stopped)));
    assert!(matches!(open.commit(), Err(BasaltError::Stopped)));
    assert_eq!(open.state(), TxnState::Rollbacked);
    Ok(())
}
