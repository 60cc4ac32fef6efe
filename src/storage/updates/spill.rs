use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::metrics::TxnMetrics;
use crate::primitives::pager::{BufferPool, Evictable};
use crate::primitives::wal::{LogDevice, UPDATE_GROUP};
use crate::storage::updates::chain::UpdateNode;
use crate::storage::updates::codec::{decode_block_updates, encode_block_updates};
use crate::types::{BasaltError, Result};

/// Where compaction nodes go when memory is tight.
#[derive(Clone)]
pub struct SpillTarget {
    /// Pool deciding which nodes stay resident.
    pub pool: Arc<BufferPool>,
    /// Device receiving evicted payloads.
    pub log: Arc<dyn LogDevice>,
}

impl fmt::Debug for SpillTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillTarget")
            .field("pool", &self.pool.stats())
            .finish_non_exhaustive()
    }
}

impl SpillTarget {
    /// Pairs a pool with a log device.
    pub fn new(pool: Arc<BufferPool>, log: Arc<dyn LogDevice>) -> Self {
        Self { pool, log }
    }
}

/// Pool entry for one update node.
///
/// A payload is appended to the log once; later evictions of the same node
/// reuse the recorded sequence.
pub(crate) struct SpillSlot {
    node: Arc<UpdateNode>,
    log: Arc<dyn LogDevice>,
    metrics: Arc<dyn TxnMetrics>,
}

impl SpillSlot {
    pub(crate) fn new(node: Arc<UpdateNode>, target: &SpillTarget, metrics: Arc<dyn TxnMetrics>) -> Self {
        Self {
            node,
            log: Arc::clone(&target.log),
            metrics,
        }
    }
}

impl Evictable for SpillSlot {
    fn resident_bytes(&self) -> usize {
        let state = self.node.state().lock();
        if state.resident {
            state.updates.payload_bytes()
        } else {
            0
        }
    }

    fn on_load(&self) -> Result<()> {
        let mut state = self.node.state().lock();
        if state.resident {
            return Ok(());
        }
        let seq = state
            .spilled
            .ok_or(BasaltError::Corruption("unloaded update node has no log record"))?;
        let payload = self.log.load(UPDATE_GROUP, seq)?;
        let loaded = decode_block_updates(&payload)?;
        if loaded.block_id() != state.updates.block_id()
            || loaded.commit_ts() != state.updates.commit_ts()
        {
            return Err(BasaltError::Corruption("spilled update node identity mismatch"));
        }
        state.updates.restore_payload(loaded);
        state.resident = true;
        self.metrics.reload(payload.len());
        debug!(
            block_id = %self.node.block_id(),
            seq,
            bytes = payload.len(),
            "update node reloaded"
        );
        Ok(())
    }

    fn on_unload(&self) -> Result<bool> {
        let mut state = self.node.state().lock();
        if !state.resident {
            return Ok(true);
        }
        if !state.updates.is_committed() {
            return Ok(false);
        }
        if state.spilled.is_none() {
            let payload = encode_block_updates(&state.updates)?;
            let seq = self.log.append(UPDATE_GROUP, &payload)?;
            state.spilled = Some(seq);
            self.metrics.spill(payload.len());
            debug!(
                block_id = %self.node.block_id(),
                seq,
                bytes = payload.len(),
                "update node spilled"
            );
        }
        state.updates.take_payload();
        state.resident = false;
        Ok(true)
    }

    fn on_destroy(&self) {
        trace!(block_id = %self.node.block_id(), "update node released from pool");
    }
}
