use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::metrics::{default_metrics, TxnMetrics};
use crate::options::TxnOptions;
use crate::txn::{Transaction, TxnCtx, TxnInner};
use crate::types::{BasaltError, Result, Timestamp, TxnId, TxnState, UNCOMMIT_TS};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpKind {
    Commit,
    Rollback,
}

struct PipelineOp {
    txn: Arc<TxnInner>,
    kind: OpKind,
}

struct Clock {
    next_txn_id: TxnId,
    // Last timestamp handed out; start and commit timestamps share it.
    ts: Timestamp,
    last_commit_ts: Timestamp,
}

pub(crate) struct ManagerShared {
    clock: Mutex<Clock>,
    active: Mutex<BTreeMap<TxnId, Arc<TxnCtx>>>,
    preparing: Mutex<Option<SyncSender<PipelineOp>>>,
    opts: TxnOptions,
    metrics: Arc<dyn TxnMetrics>,
}

impl ManagerShared {
    // Allocates the commit timestamp and moves `ctx` to `next` under the
    // clock lock, so no snapshot can be taken between the two.
    fn stamp(&self, ctx: &TxnCtx, next: TxnState) -> Timestamp {
        let mut clock = self.clock.lock();
        clock.ts += 1;
        ctx.transition(next, clock.ts);
        clock.ts
    }

    pub(crate) fn submit(&self, txn: Arc<TxnInner>, kind: OpKind) -> Result<()> {
        let sender = self.preparing.lock().clone();
        let Some(sender) = sender else {
            self.abort_inline(&txn);
            return Err(BasaltError::Stopped);
        };
        debug!(txn_id = txn.ctx.id(), ?kind, "submitting to preparing queue");
        if let Err(mpsc::SendError(op)) = sender.send(PipelineOp { txn, kind }) {
            self.abort_inline(&op.txn);
            return Err(BasaltError::Stopped);
        }
        Ok(())
    }

    // Discards a transaction's writes without a commit timestamp once the
    // pipeline is gone.
    fn abort_inline(&self, txn: &TxnInner) {
        let ctx = &txn.ctx;
        if ctx.state() != TxnState::Active {
            return;
        }
        warn!(txn_id = ctx.id(), "pipeline stopped, aborting transaction inline");
        ctx.transition(TxnState::Rollbacking, UNCOMMIT_TS);
        {
            let store = txn.store.lock();
            if let Err(err) = store.prepare_rollback(ctx) {
                error!(txn_id = ctx.id(), error = %err, "inline prepare rollback failed");
            }
            if let Err(err) = store.apply_rollback(ctx) {
                error!(txn_id = ctx.id(), error = %err, "inline apply rollback failed");
            }
        }
        self.active.lock().remove(&ctx.id());
        self.metrics.txn_rolled_back();
        ctx.finish(TxnState::Rollbacked);
    }

    fn prepare(&self, op: &mut PipelineOp) {
        let ctx = Arc::clone(&op.txn.ctx);
        let store = op.txn.store.lock();
        match op.kind {
            OpKind::Commit => {
                let commit_ts = self.stamp(&ctx, TxnState::Committing);
                let prepared = self
                    .run_hook(&op.txn)
                    .and_then(|()| store.prepare_commit(&ctx));
                match prepared {
                    Ok(()) => {
                        debug!(txn_id = ctx.id(), commit_ts, "prepared commit");
                    }
                    Err(err) => {
                        warn!(
                            txn_id = ctx.id(),
                            commit_ts,
                            error = %err,
                            "prepare failed, converting to rollback"
                        );
                        if let Some(kind) = err.conflict_kind() {
                            self.metrics.conflict(kind);
                        }
                        ctx.set_err(err);
                        op.kind = OpKind::Rollback;
                        ctx.transition(TxnState::Rollbacking, commit_ts);
                        if let Err(err) = store.prepare_rollback(&ctx) {
                            error!(txn_id = ctx.id(), error = %err, "prepare rollback failed");
                        }
                    }
                }
            }
            OpKind::Rollback => {
                let commit_ts = self.stamp(&ctx, TxnState::Rollbacking);
                if let Err(err) = store.prepare_rollback(&ctx) {
                    error!(txn_id = ctx.id(), error = %err, "prepare rollback failed");
                }
                debug!(txn_id = ctx.id(), commit_ts, "prepared rollback");
            }
        }
    }

    fn run_hook(&self, txn: &TxnInner) -> Result<()> {
        let mut hook = txn.hook.lock();
        match hook.as_mut() {
            Some(hook) => hook.before_commit(&txn.ctx),
            None => Ok(()),
        }
    }

    fn apply(&self, op: PipelineOp) {
        let ctx = &op.txn.ctx;
        {
            let store = op.txn.store.lock();
            let applied = match op.kind {
                OpKind::Commit => store.apply_commit(ctx),
                OpKind::Rollback => store.apply_rollback(ctx),
            };
            if let Err(err) = applied {
                error!(txn_id = ctx.id(), kind = ?op.kind, error = %err, "apply failed");
            }
        }
        self.active.lock().remove(&ctx.id());
        let terminal = match op.kind {
            OpKind::Commit => {
                let commit_ts = ctx.commit_ts();
                let mut clock = self.clock.lock();
                clock.last_commit_ts = clock.last_commit_ts.max(commit_ts);
                drop(clock);
                self.metrics.txn_committed();
                TxnState::Committed
            }
            OpKind::Rollback => {
                self.metrics.txn_rolled_back();
                TxnState::Rollbacked
            }
        };
        debug!(txn_id = ctx.id(), commit_ts = ctx.commit_ts(), state = ?terminal, "txn done");
        ctx.finish(terminal);
    }
}

/// Allocates transaction ids and timestamps and drives the two-stage
/// commit pipeline.
///
/// Stage 1 (preparing) assigns each operation its commit timestamp, the single
/// linearization point of all commits, and runs prepare. Stage 2 (commit)
/// applies the effects and releases waiters. Each stage is one worker thread
/// draining a bounded queue in batches.
pub struct TxnManager {
    shared: Arc<ManagerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TxnManager {
    /// Starts a manager with default metrics.
    pub fn new(opts: TxnOptions) -> Result<Self> {
        Self::with_metrics(opts, default_metrics())
    }

    /// Starts a manager reporting to `metrics`.
    pub fn with_metrics(opts: TxnOptions, metrics: Arc<dyn TxnMetrics>) -> Result<Self> {
        let (prep_tx, prep_rx) = mpsc::sync_channel(opts.preparing_queue_capacity.max(1));
        let (commit_tx, commit_rx) = mpsc::sync_channel(opts.commit_queue_capacity.max(1));
        let shared = Arc::new(ManagerShared {
            clock: Mutex::new(Clock {
                next_txn_id: 1,
                ts: 0,
                last_commit_ts: 0,
            }),
            active: Mutex::new(BTreeMap::new()),
            preparing: Mutex::new(Some(prep_tx)),
            opts,
            metrics,
        });

        let prepare_shared = Arc::clone(&shared);
        let preparer = thread::Builder::new()
            .name("basalt-txn-prepare".into())
            .spawn(move || preparing_loop(prepare_shared, prep_rx, commit_tx))?;
        let commit_shared = Arc::clone(&shared);
        let committer = thread::Builder::new()
            .name("basalt-txn-commit".into())
            .spawn(move || commit_loop(commit_shared, commit_rx))?;
        info!("transaction manager started");
        Ok(Self {
            shared,
            workers: Mutex::new(vec![preparer, committer]),
        })
    }

    /// Starts a transaction with a fresh id and snapshot timestamp.
    pub fn start_txn(&self, info: &[u8]) -> Result<Transaction> {
        if self.shared.preparing.lock().is_none() {
            return Err(BasaltError::Stopped);
        }
        let ctx = {
            let mut clock = self.shared.clock.lock();
            let id = clock.next_txn_id;
            clock.next_txn_id += 1;
            clock.ts += 1;
            let ctx = Arc::new(TxnCtx::new(
                id,
                clock.ts,
                Bytes::copy_from_slice(info),
                self.shared.opts.commit_wait_timeout,
                Arc::clone(&self.shared.metrics),
            ));
            // Registered under the clock lock so the active set stays ordered
            // by start timestamp.
            self.shared.active.lock().insert(id, Arc::clone(&ctx));
            ctx
        };
        self.shared.metrics.txn_started();
        debug!(txn_id = ctx.id(), start_ts = ctx.start_ts(), "txn started");
        Ok(Transaction::new(ctx, Arc::clone(&self.shared)))
    }

    /// Number of transactions not yet terminal.
    pub fn active_count(&self) -> usize {
        self.shared.active.lock().len()
    }

    /// Oldest snapshot still in use, if any transaction is active.
    pub fn min_active_start_ts(&self) -> Option<Timestamp> {
        self.shared
            .active
            .lock()
            .values()
            .next()
            .map(|ctx| ctx.start_ts())
    }

    /// Largest commit timestamp that reached `Committed`.
    pub fn last_commit_ts(&self) -> Timestamp {
        self.shared.clock.lock().last_commit_ts
    }

    /// Every live and future snapshot starts at or after this timestamp, so
    /// committed history below it can be compacted.
    pub fn gc_horizon(&self) -> Timestamp {
        match self.min_active_start_ts() {
            Some(ts) => ts,
            None => self.shared.clock.lock().ts + 1,
        }
    }

    /// Options the manager was started with.
    pub fn options(&self) -> &TxnOptions {
        &self.shared.opts
    }

    /// Stops accepting work, drains both queues and joins the workers.
    pub fn shutdown(&self) {
        let sender = self.shared.preparing.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("transaction pipeline worker panicked");
            }
        }
        info!("transaction manager stopped");
    }
}

impl Drop for TxnManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain_batch<T>(rx: &Receiver<T>, batch_size: usize) -> Option<Vec<T>> {
    let first = rx.recv().ok()?;
    let mut batch = Vec::with_capacity(batch_size.min(64));
    batch.push(first);
    while batch.len() < batch_size {
        match rx.try_recv() {
            Ok(next) => batch.push(next),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
    Some(batch)
}

fn preparing_loop(
    shared: Arc<ManagerShared>,
    rx: Receiver<PipelineOp>,
    commit_tx: SyncSender<PipelineOp>,
) {
    let batch_size = shared.opts.batch_size.max(1);
    while let Some(batch) = drain_batch(&rx, batch_size) {
        for mut op in batch {
            shared.prepare(&mut op);
            if let Err(mpsc::SendError(op)) = commit_tx.send(op) {
                error!(txn_id = op.txn.ctx.id(), "commit stage gone, finishing inline");
                shared.apply(op);
            }
        }
    }
    debug!("preparing stage drained");
}

fn commit_loop(shared: Arc<ManagerShared>, rx: Receiver<PipelineOp>) {
    let batch_size = shared.opts.batch_size.max(1);
    while let Some(batch) = drain_batch(&rx, batch_size) {
        for op in batch {
            shared.apply(op);
        }
    }
    debug!("commit stage drained");
}
