#![forbid(unsafe_code)]

//! Row deletes and column overlays inside one storage block.
//!
//! Each writer of a block owns one [`BlockUpdates`] node in the block's
//! [`UpdateChain`]. The chain reuses the version-chain ordering and the same
//! visibility rule shape as catalog entries.

mod chain;
mod codec;
mod spill;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use roaring::RoaringBitmap;

use crate::txn::TxnCtx;
use crate::types::{BasaltError, ObjectId, Result, Timestamp, UNCOMMIT_TS};

pub use chain::{UpdateChain, UpdateNode, UpdateView};
pub(crate) use chain::UpdateEntry;
pub use codec::{decode_block_updates, encode_block_updates};
pub use spill::SpillTarget;

/// Sparse value overlay of one column.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColumnUpdates {
    values: BTreeMap<u32, Bytes>,
    rows: RoaringBitmap,
}

impl ColumnUpdates {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of updated rows.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` when no row is updated.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `row` has a value.
    pub fn contains(&self, row: u32) -> bool {
        self.rows.contains(row)
    }

    /// Value of `row`.
    pub fn get(&self, row: u32) -> Option<&Bytes> {
        self.values.get(&row)
    }

    /// Rows with a value.
    pub fn rows(&self) -> &RoaringBitmap {
        &self.rows
    }

    /// `(row, value)` pairs in row order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Bytes)> + '_ {
        self.values.iter().map(|(row, value)| (*row, value))
    }

    /// Sets `row`, replacing any previous value.
    pub fn set(&mut self, row: u32, value: Bytes) {
        self.rows.insert(row);
        self.values.insert(row, value);
    }

    /// Overlays `newer` on top of this overlay.
    pub fn merge(&mut self, newer: &ColumnUpdates) {
        for (row, value) in newer.iter() {
            self.set(row, value.clone());
        }
    }

    fn payload_bytes(&self) -> usize {
        self.values.values().map(|v| v.len() + 8).sum::<usize>()
            + self.rows.serialized_size()
    }
}

/// One writer's deletes and column updates for a block.
#[derive(Clone, Debug)]
pub struct BlockUpdates {
    block_id: ObjectId,
    base_deletes: RoaringBitmap,
    local_deletes: RoaringBitmap,
    columns: BTreeMap<u16, ColumnUpdates>,
    owner: Option<Arc<TxnCtx>>,
    start_ts: Timestamp,
    commit_ts: Timestamp,
}

impl BlockUpdates {
    /// Empty updates owned by `owner`, seeded with `base_deletes`.
    pub fn new(
        block_id: ObjectId,
        owner: Option<Arc<TxnCtx>>,
        start_ts: Timestamp,
        base_deletes: RoaringBitmap,
    ) -> Self {
        Self {
            block_id,
            base_deletes,
            local_deletes: RoaringBitmap::new(),
            columns: BTreeMap::new(),
            owner,
            start_ts,
            commit_ts: UNCOMMIT_TS,
        }
    }

    /// Block these updates apply to.
    pub fn block_id(&self) -> ObjectId {
        self.block_id
    }

    /// Deletes that were durable when this node was created.
    pub fn base_deletes(&self) -> &RoaringBitmap {
        &self.base_deletes
    }

    /// Deletes made by this node.
    pub fn local_deletes(&self) -> &RoaringBitmap {
        &self.local_deletes
    }

    /// Overlay of column `col`.
    pub fn column(&self, col: u16) -> Option<&ColumnUpdates> {
        self.columns.get(&col)
    }

    /// All column overlays.
    pub fn columns(&self) -> &BTreeMap<u16, ColumnUpdates> {
        &self.columns
    }

    /// Total updated cells across columns.
    pub fn update_count(&self) -> usize {
        self.columns.values().map(ColumnUpdates::len).sum()
    }

    /// Writer owning this node; `None` once settled.
    pub fn owner(&self) -> Option<&Arc<TxnCtx>> {
        self.owner.as_ref()
    }

    /// Snapshot of the writer.
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Commit timestamp, [`UNCOMMIT_TS`] until prepared.
    pub fn commit_ts(&self) -> Timestamp {
        self.commit_ts
    }

    /// Settled with a commit timestamp.
    pub fn is_committed(&self) -> bool {
        self.owner.is_none() && self.commit_ts != UNCOMMIT_TS
    }

    /// Whether `row` is deleted in base or local deletes.
    pub fn is_deleted(&self, row: u32) -> bool {
        self.base_deletes.contains(row) || self.local_deletes.contains(row)
    }

    /// Deletes rows `start..=end`.
    ///
    /// Fails with `WWConflict` if any row in the range is already deleted.
    pub fn delete_locked(&mut self, start: u32, end: u32) -> Result<()> {
        if start > end {
            return Err(BasaltError::Invalid("delete range start exceeds end"));
        }
        let mut range = RoaringBitmap::new();
        range.insert_range(start..=end);
        if !range.is_disjoint(&self.base_deletes) || !range.is_disjoint(&self.local_deletes) {
            return Err(BasaltError::WWConflict);
        }
        self.local_deletes |= &range;
        Ok(())
    }

    /// Records `value` for `(row, col)`.
    ///
    /// Fails with `WWConflict` if the row is deleted or this node already
    /// updated the cell.
    pub fn update_locked(&mut self, row: u32, col: u16, value: Bytes) -> Result<()> {
        if self.is_deleted(row) {
            return Err(BasaltError::WWConflict);
        }
        let column = self.columns.entry(col).or_default();
        if column.contains(row) {
            return Err(BasaltError::WWConflict);
        }
        column.set(row, value);
        Ok(())
    }

    /// Folds `newer` into this node: deletes are unioned and newer column
    /// values win.
    pub fn merge_locked(&mut self, newer: &BlockUpdates) {
        self.base_deletes |= &newer.base_deletes;
        self.local_deletes |= &newer.local_deletes;
        for (col, overlay) in &newer.columns {
            self.columns.entry(*col).or_default().merge(overlay);
        }
    }

    pub(crate) fn set_commit_ts(&mut self, ts: Timestamp) {
        self.commit_ts = ts;
    }

    pub(crate) fn clear_owner(&mut self) -> Option<Arc<TxnCtx>> {
        self.owner.take()
    }

    pub(crate) fn payload_bytes(&self) -> usize {
        self.base_deletes.serialized_size()
            + self.local_deletes.serialized_size()
            + self
                .columns
                .values()
                .map(ColumnUpdates::payload_bytes)
                .sum::<usize>()
    }

    // Drops the payload while keeping identity and timestamps.
    pub(crate) fn take_payload(&mut self) {
        self.base_deletes = RoaringBitmap::new();
        self.local_deletes = RoaringBitmap::new();
        self.columns = BTreeMap::new();
    }

    pub(crate) fn restore_payload(&mut self, from: BlockUpdates) {
        self.base_deletes = from.base_deletes;
        self.local_deletes = from.local_deletes;
        self.columns = from.columns;
    }

    pub(crate) fn from_parts(
        block_id: ObjectId,
        start_ts: Timestamp,
        commit_ts: Timestamp,
        base_deletes: RoaringBitmap,
        local_deletes: RoaringBitmap,
        columns: BTreeMap<u16, ColumnUpdates>,
    ) -> Self {
        Self {
            block_id,
            base_deletes,
            local_deletes,
            columns,
            owner: None,
            start_ts,
            commit_ts,
        }
    }
}
