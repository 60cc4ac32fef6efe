use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use tracing::{debug, info, trace, warn};

use crate::metrics::TxnMetrics;
use crate::primitives::pager::BufferId;
use crate::primitives::wal::LogSeq;
use crate::storage::chain::{ChainKey, NodeHandle, VersionChain};
use crate::storage::mvcc::{pending_write_visibility, settle, Probe, Visibility};
use crate::storage::updates::spill::{SpillSlot, SpillTarget};
use crate::storage::updates::BlockUpdates;
use crate::txn::{TxnCtx, TxnEntry};
use crate::types::{BasaltError, ConflictKind, ObjectId, Result, Timestamp, TxnState, UNCOMMIT_TS};

pub(crate) struct NodeState {
    pub(crate) updates: BlockUpdates,
    pub(crate) resident: bool,
    pub(crate) spilled: Option<LogSeq>,
}

/// One writer's node in an [`UpdateChain`].
pub struct UpdateNode {
    block_id: ObjectId,
    handle: OnceLock<NodeHandle>,
    sort_ts: AtomicU64,
    state: Mutex<NodeState>,
    buffer: OnceLock<BufferId>,
}

impl fmt::Debug for UpdateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateNode")
            .field("block_id", &self.block_id)
            .field("sort_ts", &self.sort_ts.load(Ordering::Acquire))
            .field("buffer", &self.buffer.get())
            .finish()
    }
}

impl ChainKey for Arc<UpdateNode> {
    fn chain_ts(&self) -> Timestamp {
        self.sort_ts.load(Ordering::Acquire)
    }
}

impl UpdateNode {
    fn new(updates: BlockUpdates) -> Self {
        let sort_ts = if updates.is_committed() {
            updates.commit_ts()
        } else {
            UNCOMMIT_TS
        };
        Self {
            block_id: updates.block_id(),
            handle: OnceLock::new(),
            sort_ts: AtomicU64::new(sort_ts),
            state: Mutex::new(NodeState {
                updates,
                resident: true,
                spilled: None,
            }),
            buffer: OnceLock::new(),
        }
    }

    /// Block this node belongs to.
    pub fn block_id(&self) -> ObjectId {
        self.block_id
    }

    /// Snapshot of the writer that created this node.
    pub fn start_ts(&self) -> Timestamp {
        self.state.lock().updates.start_ts()
    }

    /// Commit timestamp, [`UNCOMMIT_TS`] until prepared.
    pub fn commit_ts(&self) -> Timestamp {
        self.state.lock().updates.commit_ts()
    }

    /// Whether the node settled as committed.
    pub fn is_committed(&self) -> bool {
        self.state.lock().updates.is_committed()
    }

    /// Whether the payload is in memory.
    pub fn is_resident(&self) -> bool {
        self.state.lock().resident
    }

    /// Pool registration, set for compaction nodes when spilling is enabled.
    pub fn buffer_id(&self) -> Option<BufferId> {
        self.buffer.get().copied()
    }

    pub(crate) fn state(&self) -> &Mutex<NodeState> {
        &self.state
    }

    fn owner(&self) -> Option<Arc<TxnCtx>> {
        self.state.lock().updates.owner().cloned()
    }

    fn settled_before(&self, ts: Timestamp) -> bool {
        let state = self.state.lock();
        state.updates.is_committed() && state.updates.commit_ts() < ts
    }

    fn visibility(&self, reader: &TxnCtx) -> Visibility {
        let state = self.state.lock();
        let updates = &state.updates;
        match updates.owner() {
            None if updates.commit_ts() < reader.start_ts() => Visibility::Visible,
            None => Visibility::Invisible,
            Some(owner) if owner.is_same(reader) => Visibility::Visible,
            Some(owner) => pending_write_visibility(owner, reader.start_ts()),
        }
    }
}

// Rolled-back writers never become visible and are about to be unlinked.
fn is_discarded(updates: &BlockUpdates) -> bool {
    updates
        .owner()
        .map(|owner| matches!(owner.state(), TxnState::Rollbacking | TxnState::Rollbacked))
        .unwrap_or(false)
}

// Whether a value written by `updates` conflicts with a write by `writer` to
// the same cell.
fn overlaps_writer(updates: &BlockUpdates, writer: &TxnCtx) -> bool {
    match updates.owner() {
        Some(owner) if owner.is_same(writer) => false,
        Some(owner) => {
            let (state, commit_ts) = owner.status();
            match state {
                TxnState::Active => true,
                TxnState::Committing | TxnState::Committed => commit_ts > writer.start_ts(),
                TxnState::Rollbacking | TxnState::Rollbacked => false,
            }
        }
        None => updates.commit_ts() > writer.start_ts(),
    }
}

/// Deletes and values visible to one snapshot.
#[derive(Clone, Debug, Default)]
pub struct UpdateView {
    deletes: RoaringBitmap,
    values: BTreeMap<(u16, u32), Bytes>,
}

impl UpdateView {
    /// Whether `row` is deleted.
    pub fn is_deleted(&self, row: u32) -> bool {
        self.deletes.contains(row)
    }

    /// Newest visible value of `(col, row)`.
    pub fn value(&self, col: u16, row: u32) -> Option<&Bytes> {
        self.values.get(&(col, row))
    }

    /// Visible deletes.
    pub fn deletes(&self) -> &RoaringBitmap {
        &self.deletes
    }

    /// Number of visible updated cells.
    pub fn update_count(&self) -> usize {
        self.values.len()
    }

    fn apply(&mut self, updates: &BlockUpdates) {
        self.deletes |= updates.base_deletes();
        self.deletes |= updates.local_deletes();
        for (col, overlay) in updates.columns() {
            for (row, value) in overlay.iter() {
                self.values.insert((*col, row), value.clone());
            }
        }
    }
}

/// Version chain of [`UpdateNode`]s for one block.
///
/// Writers take the chain write lock for conflict checks and writes, so two
/// writers of one block never interleave between check and write.
pub struct UpdateChain {
    block_id: ObjectId,
    base_deletes: RoaringBitmap,
    nodes: RwLock<VersionChain<Arc<UpdateNode>>>,
    spill: Option<SpillTarget>,
    metrics: Arc<dyn TxnMetrics>,
}

impl fmt::Debug for UpdateChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateChain")
            .field("block_id", &self.block_id)
            .field("nodes", &self.nodes.read().len())
            .field("spill", &self.spill.is_some())
            .finish()
    }
}

impl UpdateChain {
    /// Empty chain for `block_id`.
    pub fn new(block_id: ObjectId, metrics: Arc<dyn TxnMetrics>) -> Self {
        Self {
            block_id,
            base_deletes: RoaringBitmap::new(),
            nodes: RwLock::new(VersionChain::new()),
            spill: None,
            metrics,
        }
    }

    /// Rows already deleted in the block's persisted state.
    pub fn with_base_deletes(mut self, deletes: RoaringBitmap) -> Self {
        self.base_deletes = deletes;
        self
    }

    /// Registers compaction nodes with `target` so they can be evicted.
    pub fn with_spill(mut self, target: SpillTarget) -> Self {
        self.spill = Some(target);
        self
    }

    /// Block this chain belongs to.
    pub fn block_id(&self) -> ObjectId {
        self.block_id
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Returns `true` when no node is linked.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Linked nodes from newest to oldest.
    pub fn nodes(&self) -> Vec<Arc<UpdateNode>> {
        self.nodes.read().iter().cloned().collect()
    }

    /// Runs `read` over the payload of `node`, loading it back from the log
    /// device first when it was spilled.
    pub fn read_node<R>(&self, node: &UpdateNode, read: impl FnOnce(&BlockUpdates) -> R) -> Result<R> {
        let _pin = match (&self.spill, node.buffer_id()) {
            (Some(target), Some(id)) => Some(target.pool.pin(id)?),
            _ => None,
        };
        let state = node.state.lock();
        if !state.resident {
            return Err(BasaltError::Corruption("update node payload not resident"));
        }
        Ok(read(&state.updates))
    }

    /// Links a fresh node owned by `txn`.
    ///
    /// The node's base deletes are seeded from the chain base and every node
    /// committed before `txn`'s snapshot.
    pub fn add_node(&self, txn: &Arc<TxnCtx>) -> Result<Arc<UpdateNode>> {
        let mut chain = self.nodes.write();
        let mut base = self.base_deletes.clone();
        for node in chain.iter() {
            if node.settled_before(txn.start_ts()) {
                self.read_node(node, |updates| base |= updates.local_deletes())?;
            }
        }
        let node = Arc::new(UpdateNode::new(BlockUpdates::new(
            self.block_id,
            Some(Arc::clone(txn)),
            txn.start_ts(),
            base,
        )));
        let handle = chain.insert(Arc::clone(&node));
        let _ = node.handle.set(handle);
        trace!(
            txn_id = txn.id(),
            start_ts = txn.start_ts(),
            block_id = %self.block_id,
            "update node added"
        );
        Ok(node)
    }

    /// Deletes rows `start..=end` through `node`.
    ///
    /// Fails with `WWConflict` when another live node deleted any of the rows,
    /// or wrote a value to one of them that `node`'s writer cannot see.
    pub fn delete_rows(&self, node: &Arc<UpdateNode>, start: u32, end: u32) -> Result<()> {
        if start > end {
            return Err(BasaltError::Invalid("delete range start exceeds end"));
        }
        let mut range = RoaringBitmap::new();
        range.insert_range(start..=end);
        let chain = self.nodes.write();
        let writer = self.writer_of(node)?;
        for other in chain.iter() {
            if Arc::ptr_eq(other, node) {
                continue;
            }
            let conflict = self.read_node(other, |updates| {
                if is_discarded(updates) {
                    return false;
                }
                !updates.local_deletes().is_disjoint(&range)
                    || (overlaps_writer(updates, &writer)
                        && updates
                            .columns()
                            .values()
                            .any(|overlay| !overlay.rows().is_disjoint(&range)))
            })?;
            if conflict {
                return Err(self.conflict(&writer, "delete overlaps another writer"));
            }
        }
        node.state.lock().updates.delete_locked(start, end)
    }

    /// Writes `value` to `(row, col)` through `node`.
    ///
    /// Fails with `WWConflict` when another live node deleted the row, or
    /// holds a value for the cell that `node`'s writer cannot see.
    pub fn update(&self, node: &Arc<UpdateNode>, row: u32, col: u16, value: Bytes) -> Result<()> {
        let chain = self.nodes.write();
        let writer = self.writer_of(node)?;
        for other in chain.iter() {
            if Arc::ptr_eq(other, node) {
                continue;
            }
            let conflict = self.read_node(other, |updates| {
                if is_discarded(updates) {
                    return false;
                }
                updates.local_deletes().contains(row)
                    || (overlaps_writer(updates, &writer)
                        && updates.column(col).is_some_and(|overlay| overlay.contains(row)))
            })?;
            if conflict {
                return Err(self.conflict(&writer, "update overlaps another writer"));
            }
        }
        node.state.lock().updates.update_locked(row, col, value)
    }

    /// Deletes and values visible to `reader`.
    ///
    /// Nodes are applied oldest to newest, so the newest visible value of a
    /// cell wins. Blocks on a committing writer whose commit timestamp
    /// precedes the snapshot.
    pub fn view(&self, reader: &TxnCtx) -> Result<UpdateView> {
        settle(reader, || {
            let chain = self.nodes.read();
            let mut visible = Vec::new();
            let mut waiting = None;
            chain.scan(false, |_, node| match node.visibility(reader) {
                Visibility::Visible => {
                    visible.push(Arc::clone(node));
                    true
                }
                Visibility::Invisible => true,
                Visibility::Wait(writer) => {
                    waiting = Some(writer);
                    false
                }
            });
            if let Some(writer) = waiting {
                return Ok(Probe::Wait(writer));
            }
            let mut view = UpdateView {
                deletes: self.base_deletes.clone(),
                values: BTreeMap::new(),
            };
            for node in &visible {
                self.read_node(node, |updates| view.apply(updates))?;
            }
            Ok(Probe::Ready(view))
        })
    }

    /// Whether `row` is deleted for `reader`.
    pub fn is_deleted(&self, row: u32, reader: &TxnCtx) -> Result<bool> {
        Ok(self.view(reader)?.is_deleted(row))
    }

    /// Newest value of `(col, row)` visible to `reader`.
    pub fn value(&self, col: u16, row: u32, reader: &TxnCtx) -> Result<Option<Bytes>> {
        Ok(self.view(reader)?.value(col, row).cloned())
    }

    /// Merges every committed node.
    ///
    /// Only correct when no live snapshot starts at or below the newest
    /// merged commit: such a snapshot loses the older nodes of the run and
    /// may see false `WWConflict`s. With live transactions use
    /// [`Self::compact_below`] with the manager's `gc_horizon()`, as
    /// `Engine::compact` does.
    pub fn compact(&self) -> Result<usize> {
        self.compact_below(UNCOMMIT_TS)
    }

    /// Merges the oldest run of nodes committed before `horizon` into one
    /// node stamped with the run's largest commit timestamp. Returns the number
    /// of nodes merged; a run shorter than two is left alone.
    pub fn compact_below(&self, horizon: Timestamp) -> Result<usize> {
        let mut chain = self.nodes.write();
        let mut run = Vec::new();
        chain.scan(false, |handle, node| {
            if node.settled_before(horizon) {
                run.push((handle, Arc::clone(node)));
                true
            } else {
                false
            }
        });
        if run.len() < 2 {
            return Ok(0);
        }

        // A node whose apply has not re-sorted it yet can sit out of order.
        run.sort_by_key(|(_, node)| node.commit_ts());
        let first_start = run.iter().map(|(_, node)| node.start_ts()).min().unwrap_or(0);
        let last_commit = run.iter().map(|(_, node)| node.commit_ts()).max().unwrap_or(0);
        let mut merged = BlockUpdates::from_parts(
            self.block_id,
            first_start,
            last_commit,
            self.base_deletes.clone(),
            RoaringBitmap::new(),
            BTreeMap::new(),
        );
        for (_, node) in &run {
            self.read_node(node, |updates| merged.merge_locked(updates))?;
        }

        let count = run.len();
        for (handle, node) in run {
            chain.delete(handle);
            if let (Some(target), Some(id)) = (&self.spill, node.buffer_id()) {
                target.pool.unregister(id);
            }
        }
        let node = Arc::new(UpdateNode::new(merged));
        let handle = chain.insert_oldest(Arc::clone(&node));
        let _ = node.handle.set(handle);
        if let Some(target) = &self.spill {
            let slot = SpillSlot::new(Arc::clone(&node), target, Arc::clone(&self.metrics));
            let id = target.pool.register(Arc::new(slot));
            let _ = node.buffer.set(id);
        }
        self.metrics.compaction(count);
        info!(
            block_id = %self.block_id,
            merged = count,
            commit_ts = last_commit,
            remaining = chain.len(),
            "update chain compacted"
        );
        Ok(count)
    }

    fn writer_of(&self, node: &UpdateNode) -> Result<Arc<TxnCtx>> {
        if node.block_id != self.block_id {
            return Err(BasaltError::Invalid("update node belongs to another block"));
        }
        match node.owner() {
            Some(owner) if owner.state() == TxnState::Active => Ok(owner),
            _ => Err(BasaltError::Invalid("update node no longer accepts writes")),
        }
    }

    fn conflict(&self, writer: &TxnCtx, reason: &'static str) -> BasaltError {
        self.metrics.conflict(ConflictKind::WriteWrite);
        warn!(
            txn_id = writer.id(),
            start_ts = writer.start_ts(),
            block_id = %self.block_id,
            reason,
            "update write conflict"
        );
        BasaltError::WWConflict
    }
}

impl Drop for UpdateChain {
    fn drop(&mut self) {
        let Some(target) = &self.spill else {
            return;
        };
        for node in self.nodes.get_mut().iter() {
            if let Some(id) = node.buffer_id() {
                target.pool.unregister(id);
            }
        }
    }
}

/// Commit participant for one transaction's node on one chain.
pub(crate) struct UpdateEntry {
    chain: Arc<UpdateChain>,
    node: Arc<UpdateNode>,
}

impl UpdateEntry {
    pub(crate) fn new(chain: Arc<UpdateChain>, node: Arc<UpdateNode>) -> Self {
        Self { chain, node }
    }

    fn handle(&self) -> Result<NodeHandle> {
        self.node
            .handle
            .get()
            .copied()
            .ok_or(BasaltError::Corruption("update node was never linked"))
    }
}

impl TxnEntry for UpdateEntry {
    fn prepare_commit(&self, txn: &TxnCtx) -> Result<()> {
        let commit_ts = txn.commit_ts();
        assert!(
            commit_ts > txn.start_ts() && commit_ts != UNCOMMIT_TS,
            "update node commit ts {commit_ts} must exceed start ts {}",
            txn.start_ts()
        );
        self.node.state.lock().updates.set_commit_ts(commit_ts);
        Ok(())
    }

    fn prepare_rollback(&self, _txn: &TxnCtx) -> Result<()> {
        self.node.state.lock().updates.set_commit_ts(UNCOMMIT_TS);
        Ok(())
    }

    fn apply_commit(&self, txn: &TxnCtx) -> Result<()> {
        let handle = self.handle()?;
        let commit_ts = {
            let mut state = self.node.state.lock();
            state.updates.clear_owner();
            state.updates.commit_ts()
        };
        self.node.sort_ts.store(commit_ts, Ordering::Release);
        self.chain.nodes.write().update(handle);
        debug!(
            txn_id = txn.id(),
            commit_ts,
            block_id = %self.chain.block_id,
            "update node committed"
        );
        Ok(())
    }

    fn apply_rollback(&self, txn: &TxnCtx) -> Result<()> {
        let handle = self.handle()?;
        self.chain.nodes.write().delete(handle);
        debug!(
            txn_id = txn.id(),
            block_id = %self.chain.block_id,
            "update node discarded"
        );
        Ok(())
    }
}
