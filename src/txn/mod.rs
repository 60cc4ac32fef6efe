//! Transactions and the two-stage commit pipeline.
//!
//! A [`Transaction`] is the caller's handle; its shared [`TxnCtx`] is what
//! catalog entries and update nodes reference as their owning writer.
//! Writes are recorded as [`TxnEntry`] participants in the transaction's
//! [`TxnStore`] and driven through prepare and apply by the [`TxnManager`].

#![forbid(unsafe_code)]

mod manager;
mod store;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::metrics::TxnMetrics;
use crate::primitives::concurrency::DoneSignal;
use crate::storage::updates::{UpdateChain, UpdateEntry, UpdateNode};
use crate::types::{BasaltError, Result, Timestamp, TxnId, TxnState, UNCOMMIT_TS};

pub use manager::TxnManager;
pub use store::{TxnEntry, TxnStore};

use manager::{ManagerShared, OpKind};

/// Callback run by the preparing stage before participants are prepared.
///
/// Returning an error converts the commit into a rollback; the error is what
/// [`Transaction::commit`] returns.
pub trait PreCommitHook: Send {
    /// Runs once with the transaction in `Committing` state.
    fn before_commit(&mut self, txn: &TxnCtx) -> Result<()>;
}

impl<F> PreCommitHook for F
where
    F: FnMut(&TxnCtx) -> Result<()> + Send,
{
    fn before_commit(&mut self, txn: &TxnCtx) -> Result<()> {
        self(txn)
    }
}

struct TxnStatus {
    state: TxnState,
    commit_ts: Timestamp,
    err: Option<BasaltError>,
}

/// Shared per-transaction context.
///
/// Holds identity, snapshot, state and the completion signal. Versioned
/// entries keep an `Arc<TxnCtx>` as their owner reference.
pub struct TxnCtx {
    id: TxnId,
    start_ts: Timestamp,
    info: Bytes,
    wait_timeout: Option<Duration>,
    metrics: Arc<dyn TxnMetrics>,
    status: Mutex<TxnStatus>,
    done: DoneSignal<TxnState>,
}

impl fmt::Debug for TxnCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.lock();
        f.debug_struct("TxnCtx")
            .field("id", &self.id)
            .field("start_ts", &self.start_ts)
            .field("state", &status.state)
            .field("commit_ts", &status.commit_ts)
            .finish()
    }
}

impl TxnCtx {
    pub(crate) fn new(
        id: TxnId,
        start_ts: Timestamp,
        info: Bytes,
        wait_timeout: Option<Duration>,
        metrics: Arc<dyn TxnMetrics>,
    ) -> Self {
        Self {
            id,
            start_ts,
            info,
            wait_timeout,
            metrics,
            status: Mutex::new(TxnStatus {
                state: TxnState::Active,
                commit_ts: UNCOMMIT_TS,
                err: None,
            }),
            done: DoneSignal::new(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Snapshot timestamp.
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Caller-supplied description passed to `start_txn`.
    pub fn info(&self) -> &Bytes {
        &self.info
    }

    /// Current state.
    pub fn state(&self) -> TxnState {
        self.status.lock().state
    }

    /// Assigned commit timestamp, or [`UNCOMMIT_TS`].
    pub fn commit_ts(&self) -> Timestamp {
        self.status.lock().commit_ts
    }

    /// State and commit timestamp read atomically.
    pub fn status(&self) -> (TxnState, Timestamp) {
        let status = self.status.lock();
        (status.state, status.commit_ts)
    }

    /// Whether `other` is the same transaction.
    pub fn is_same(&self, other: &TxnCtx) -> bool {
        self.id == other.id
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn TxnMetrics> {
        &self.metrics
    }

    /// Moves to `next`, stamping `commit_ts`.
    ///
    /// # Panics
    /// On an edge outside the state machine, or a commit timestamp that does
    /// not exceed the start timestamp.
    pub(crate) fn transition(&self, next: TxnState, commit_ts: Timestamp) {
        let mut status = self.status.lock();
        if !status.state.can_transition_to(next) {
            panic!(
                "txn {}: illegal state transition {:?} -> {:?}",
                self.id, status.state, next
            );
        }
        if commit_ts != UNCOMMIT_TS && commit_ts <= self.start_ts {
            panic!(
                "txn {}: commit ts {} does not exceed start ts {}",
                self.id, commit_ts, self.start_ts
            );
        }
        trace!(txn_id = self.id, from = ?status.state, to = ?next, commit_ts, "txn transition");
        status.state = next;
        if next.is_committing() {
            status.commit_ts = commit_ts;
        }
    }

    pub(crate) fn set_err(&self, err: BasaltError) {
        let mut status = self.status.lock();
        if status.err.is_none() {
            status.err = Some(err);
        }
    }

    pub(crate) fn take_err(&self) -> Option<BasaltError> {
        self.status.lock().err.take()
    }

    /// Moves to the terminal state and releases every waiter.
    pub(crate) fn finish(&self, terminal: TxnState) {
        let commit_ts = self.commit_ts();
        self.transition(terminal, commit_ts);
        self.done.set(terminal);
    }

    /// Blocks until this transaction is terminal. Unbounded.
    pub fn wait_done(&self) -> TxnState {
        self.done.wait()
    }

    /// Blocks this reader until `other` is terminal, bounded by this
    /// reader's configured wait timeout.
    pub fn wait_for(&self, other: &TxnCtx) -> Result<TxnState> {
        self.metrics.commit_wait();
        debug!(
            txn_id = self.id,
            waiting_on = other.id,
            "waiting on in-flight commit"
        );
        other
            .done
            .wait_timeout(self.wait_timeout)
            .ok_or(BasaltError::WaitTimeout(other.id))
    }
}

pub(crate) struct TxnInner {
    pub(crate) ctx: Arc<TxnCtx>,
    pub(crate) store: Mutex<TxnStore>,
    pub(crate) hook: Mutex<Option<Box<dyn PreCommitHook>>>,
    pub(crate) submitted: AtomicBool,
}

/// Caller handle of one transaction.
///
/// Dropping a transaction that was never committed or rolled back rolls it
/// back.
pub struct Transaction {
    inner: Arc<TxnInner>,
    manager: Arc<ManagerShared>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transaction").field(&self.inner.ctx).finish()
    }
}

impl Transaction {
    pub(crate) fn new(ctx: Arc<TxnCtx>, manager: Arc<ManagerShared>) -> Self {
        Self {
            inner: Arc::new(TxnInner {
                ctx,
                store: Mutex::new(TxnStore::default()),
                hook: Mutex::new(None),
                submitted: AtomicBool::new(false),
            }),
            manager,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.inner.ctx.id()
    }

    /// Snapshot timestamp.
    pub fn start_ts(&self) -> Timestamp {
        self.inner.ctx.start_ts()
    }

    /// Commit timestamp, or [`UNCOMMIT_TS`] before stage 1 ran.
    pub fn commit_ts(&self) -> Timestamp {
        self.inner.ctx.commit_ts()
    }

    /// Current state.
    pub fn state(&self) -> TxnState {
        self.inner.ctx.state()
    }

    /// Shared context referenced by this transaction's writes.
    pub fn ctx(&self) -> &Arc<TxnCtx> {
        &self.inner.ctx
    }

    /// Installs the pre-commit hook, replacing any previous one.
    pub fn set_pre_commit_hook<H>(&self, hook: H)
    where
        H: PreCommitHook + 'static,
    {
        *self.inner.hook.lock() = Some(Box::new(hook));
    }

    /// Runs `write` against the transaction's store while it still accepts
    /// writes.
    pub(crate) fn write<R>(&self, write: impl FnOnce(&mut TxnStore) -> Result<R>) -> Result<R> {
        let mut store = self.inner.store.lock();
        let state = self.inner.ctx.state();
        if state != TxnState::Active || self.inner.submitted.load(Ordering::Acquire) {
            return Err(BasaltError::Invalid("transaction no longer accepts writes"));
        }
        write(&mut store)
    }

    /// Returns this transaction's node on `chain`, creating it on first use.
    pub fn update_node(&self, chain: &Arc<UpdateChain>) -> Result<Arc<UpdateNode>> {
        self.write(|store| {
            if let Some(node) = store.update_node(chain.block_id()) {
                return Ok(node);
            }
            let node = chain.add_node(&self.inner.ctx)?;
            store.add_entry(Box::new(UpdateEntry::new(
                Arc::clone(chain),
                Arc::clone(&node),
            )));
            store.insert_update_node(chain.block_id(), Arc::clone(&node));
            Ok(node)
        })
    }

    /// Deletes rows `start..=end` of `chain`'s block.
    pub fn delete_rows(&self, chain: &Arc<UpdateChain>, start: u32, end: u32) -> Result<()> {
        let node = self.update_node(chain)?;
        chain.delete_rows(&node, start, end)
    }

    /// Writes `value` to `(row, col)` of `chain`'s block.
    pub fn update_cell(
        &self,
        chain: &Arc<UpdateChain>,
        row: u32,
        col: u16,
        value: Bytes,
    ) -> Result<()> {
        let node = self.update_node(chain)?;
        chain.update(&node, row, col, value)
    }

    /// Commits, blocking until both pipeline stages finished.
    ///
    /// Returns the prepare-phase error when the commit was converted into a
    /// rollback.
    pub fn commit(&self) -> Result<()> {
        self.submit(OpKind::Commit)?;
        let terminal = self.inner.ctx.wait_done();
        match self.inner.ctx.take_err() {
            Some(err) => Err(err),
            None if terminal == TxnState::Committed => Ok(()),
            None => Err(BasaltError::Stopped),
        }
    }

    /// Rolls back, blocking until both pipeline stages finished.
    pub fn rollback(&self) -> Result<()> {
        self.submit(OpKind::Rollback)?;
        self.inner.ctx.wait_done();
        match self.inner.ctx.take_err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn submit(&self, kind: OpKind) -> Result<()> {
        {
            let _store = self.inner.store.lock();
            let state = self.inner.ctx.state();
            let target = match kind {
                OpKind::Commit => TxnState::Committing,
                OpKind::Rollback => TxnState::Rollbacking,
            };
            if state != TxnState::Active || self.inner.submitted.load(Ordering::Acquire) {
                return Err(BasaltError::IllegalStateTransition {
                    from: state,
                    to: target,
                });
            }
            self.inner.submitted.store(true, Ordering::Release);
        }
        self.manager.submit(Arc::clone(&self.inner), kind)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.inner.submitted.load(Ordering::Acquire) {
            return;
        }
        if self.inner.ctx.state() != TxnState::Active {
            return;
        }
        debug!(txn_id = self.id(), "dropping unfinished transaction, rolling back");
        let _ = self.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;

    fn ctx(id: TxnId, start: Timestamp, timeout: Option<Duration>) -> TxnCtx {
        TxnCtx::new(id, start, Bytes::new(), timeout, Arc::new(NoopMetrics))
    }

    #[test]
    fn transition_stamps_commit_ts() {
        let txn = ctx(1, 10, None);
        assert_eq!(txn.status(), (TxnState::Active, UNCOMMIT_TS));
        txn.transition(TxnState::Committing, 11);
        assert_eq!(txn.status(), (TxnState::Committing, 11));
        txn.transition(TxnState::Rollbacking, 11);
        txn.finish(TxnState::Rollbacked);
        assert_eq!(txn.status(), (TxnState::Rollbacked, 11));
        assert_eq!(txn.wait_done(), TxnState::Rollbacked);
    }

    #[test]
    #[should_panic(expected = "illegal state transition")]
    fn committed_cannot_roll_back() {
        let txn = ctx(1, 10, None);
        txn.transition(TxnState::Committing, 11);
        txn.finish(TxnState::Committed);
        txn.transition(TxnState::Rollbacking, 11);
    }

    #[test]
    #[should_panic(expected = "does not exceed start ts")]
    fn commit_ts_must_exceed_start_ts() {
        let txn = ctx(1, 10, None);
        txn.transition(TxnState::Committing, 10);
    }

    #[test]
    fn wait_for_times_out() {
        let reader = ctx(1, 10, Some(Duration::from_millis(20)));
        let writer = ctx(2, 5, None);
        writer.transition(TxnState::Committing, 8);
        assert!(matches!(
            reader.wait_for(&writer),
            Err(BasaltError::WaitTimeout(2))
        ));
        writer.finish(TxnState::Committed);
        assert_eq!(reader.wait_for(&writer).ok(), Some(TxnState::Committed));
    }

    #[test]
    fn first_error_is_kept() {
        let txn = ctx(1, 1, None);
        txn.set_err(BasaltError::WWConflict);
        txn.set_err(BasaltError::NotFound);
        assert!(matches!(txn.take_err(), Some(BasaltError::WWConflict)));
        assert!(txn.take_err().is_none());
    }
}
