//! Explicit owner of every long-lived object.
//!
//! There are no process-wide singletons: an [`Engine`] wires a catalog, a
//! transaction manager, a buffer pool and a log device together and hands
//! out transactions.

use std::fmt;
use std::fs;
use std::sync::Arc;

use tracing::info;

use crate::metrics::{default_metrics, TxnMetrics};
use crate::options::EngineOptions;
use crate::primitives::pager::BufferPool;
use crate::primitives::wal::{FileLog, LogDevice, MemLog};
use crate::storage::catalog::Catalog;
use crate::storage::updates::SpillTarget;
use crate::txn::{Transaction, TxnManager};
use crate::types::{ObjectId, Result};

/// File name of the update spill log inside `log_dir`.
pub const UPDATE_LOG_FILE: &str = "updates.log";

/// Catalog, transaction manager and spill resources of one instance.
pub struct Engine {
    catalog: Catalog,
    manager: TxnManager,
    pool: Arc<BufferPool>,
    log: Arc<dyn LogDevice>,
    metrics: Arc<dyn TxnMetrics>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("objects", &self.catalog.object_count())
            .field("active_txns", &self.manager.active_count())
            .field("pool", &self.pool.stats())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Validates `opts` and builds every component.
    ///
    /// With `log_dir` set, spilled update nodes go to
    /// `log_dir/updates.log`; otherwise they stay in an in-memory log.
    pub fn open(opts: EngineOptions) -> Result<Self> {
        opts.validate()?;
        let metrics = opts.metrics.clone().unwrap_or_else(default_metrics);
        let pool = BufferPool::new(opts.buffer.capacity_bytes);
        let log: Arc<dyn LogDevice> = match &opts.log_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                Arc::new(FileLog::open(dir.join(UPDATE_LOG_FILE))?)
            }
            None => Arc::new(MemLog::new()),
        };
        let spill = SpillTarget::new(Arc::clone(&pool), Arc::clone(&log));
        let catalog = Catalog::with_spill(Arc::clone(&metrics), spill);
        let manager = TxnManager::with_metrics(opts.txn.clone(), Arc::clone(&metrics))?;
        info!(
            buffer_bytes = opts.buffer.capacity_bytes,
            log_dir = ?opts.log_dir,
            "engine opened"
        );
        Ok(Self {
            catalog,
            manager,
            pool,
            log,
            metrics,
        })
    }

    /// Starts a transaction tagged with `info`.
    pub fn begin(&self, info: &[u8]) -> Result<Transaction> {
        self.manager.start_txn(info)
    }

    /// The catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The transaction manager.
    pub fn txn_manager(&self) -> &TxnManager {
        &self.manager
    }

    /// Pool holding compaction nodes.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Device receiving spilled payloads.
    pub fn log_device(&self) -> &Arc<dyn LogDevice> {
        &self.log
    }

    /// Metrics sink shared by every component.
    pub fn metrics(&self) -> &Arc<dyn TxnMetrics> {
        &self.metrics
    }

    /// Compacts the update chain of `block` below the oldest live snapshot.
    pub fn compact(&self, block: ObjectId) -> Result<usize> {
        let chain = self.catalog.block_updates(block)?;
        chain.compact_below(self.manager.gc_horizon())
    }

    /// Stops the commit pipeline after draining queued work.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}
