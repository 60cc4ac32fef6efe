use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::types::ConflictKind;

/// Trait for tracking transaction pipeline and update-chain activity.
///
/// Implementations receive callbacks from the transaction manager, the catalog
/// and update chains. They must be cheap; several are called on hot paths.
pub trait TxnMetrics: Send + Sync {
    /// Records a newly started transaction.
    fn txn_started(&self);

    /// Records a transaction that reached `Committed`.
    fn txn_committed(&self);

    /// Records a transaction that reached `Rollbacked`.
    fn txn_rolled_back(&self);

    /// Records a conflict returned to a caller.
    fn conflict(&self, kind: ConflictKind);

    /// Records a reader that blocked on another transaction's outcome.
    fn commit_wait(&self);

    /// Records a compaction pass.
    ///
    /// # Parameters
    /// * `merged` - Number of chain nodes folded into the merge node.
    fn compaction(&self, merged: usize);

    /// Records an update payload written to the log device.
    fn spill(&self, bytes: usize);

    /// Records an update payload read back from the log device.
    fn reload(&self, bytes: usize);
}

/// A no-op implementation of [`TxnMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl TxnMetrics for NoopMetrics {
    fn txn_started(&self) {}
    fn txn_committed(&self) {}
    fn txn_rolled_back(&self) {}
    fn conflict(&self, _kind: ConflictKind) {}
    fn commit_wait(&self) {}
    fn compaction(&self, _merged: usize) {}
    fn spill(&self, _bytes: usize) {}
    fn reload(&self, _bytes: usize) {}
}

/// Atomic counter implementation of [`TxnMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Transactions started.
    pub started: AtomicU64,
    /// Transactions committed.
    pub committed: AtomicU64,
    /// Transactions rolled back, including commits flipped to rollback.
    pub rolled_back: AtomicU64,
    /// Write-write conflicts surfaced.
    pub ww_conflicts: AtomicU64,
    /// Read-write conflicts surfaced.
    pub rw_conflicts: AtomicU64,
    /// Reader waits on in-flight commits.
    pub commit_waits: AtomicU64,
    /// Compaction passes that merged at least one node.
    pub compactions: AtomicU64,
    /// Total nodes merged by compaction.
    pub nodes_merged: AtomicU64,
    /// Bytes spilled to the log device.
    pub spilled_bytes: AtomicU64,
    /// Bytes reloaded from the log device.
    pub reloaded_bytes: AtomicU64,
}

impl TxnMetrics for CounterMetrics {
    fn txn_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    fn txn_rolled_back(&self) {
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    fn conflict(&self, kind: ConflictKind) {
        match kind {
            ConflictKind::WriteWrite => {
                self.ww_conflicts.fetch_add(1, Ordering::Relaxed);
            }
            ConflictKind::ReadWrite => {
                self.rw_conflicts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn commit_wait(&self) {
        self.commit_waits.fetch_add(1, Ordering::Relaxed);
    }

    fn compaction(&self, merged: usize) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
        self.nodes_merged.fetch_add(merged as u64, Ordering::Relaxed);
    }

    fn spill(&self, bytes: usize) {
        self.spilled_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn reload(&self, bytes: usize) {
        self.reloaded_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn TxnMetrics> {
    Arc::new(NoopMetrics)
}
