use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::error;

use crate::storage::updates::UpdateNode;
use crate::txn::TxnCtx;
use crate::types::{ObjectId, Result};

/// One write a transaction made, driven through the commit pipeline.
///
/// `prepare_*` run on the preparing stage with the commit timestamp already
/// assigned; `apply_*` run on the commit stage and must detach the owner
/// reference.
pub trait TxnEntry: Send + Sync {
    /// Stamps commit timestamps and validates cross-object constraints.
    fn prepare_commit(&self, txn: &TxnCtx) -> Result<()>;
    /// Undoes anything `prepare_commit` stamped.
    fn prepare_rollback(&self, txn: &TxnCtx) -> Result<()>;
    /// Makes the write durable and visible; detaches the owner.
    fn apply_commit(&self, txn: &TxnCtx) -> Result<()>;
    /// Discards the write; detaches the owner.
    fn apply_rollback(&self, txn: &TxnCtx) -> Result<()>;
}

/// Per-transaction write buffer.
#[derive(Default)]
pub struct TxnStore {
    entries: Vec<Box<dyn TxnEntry>>,
    update_nodes: FxHashMap<ObjectId, Arc<UpdateNode>>,
}

impl TxnStore {
    /// Records a participant.
    pub fn add_entry(&mut self, entry: Box<dyn TxnEntry>) {
        self.entries.push(entry);
    }

    /// Number of recorded participants.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the transaction wrote nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn update_node(&self, block_id: ObjectId) -> Option<Arc<UpdateNode>> {
        self.update_nodes.get(&block_id).cloned()
    }

    pub(crate) fn insert_update_node(&mut self, block_id: ObjectId, node: Arc<UpdateNode>) {
        self.update_nodes.insert(block_id, node);
    }

    /// Prepares participants in write order, stopping at the first failure.
    pub fn prepare_commit(&self, txn: &TxnCtx) -> Result<()> {
        for entry in &self.entries {
            entry.prepare_commit(txn)?;
        }
        Ok(())
    }

    /// Undoes prepared participants in reverse order. Every participant is
    /// visited; the first error is returned.
    pub fn prepare_rollback(&self, txn: &TxnCtx) -> Result<()> {
        Self::visit_all(self.entries.iter().rev(), txn, |entry, txn| {
            entry.prepare_rollback(txn)
        })
    }

    /// Applies participants in write order.
    pub fn apply_commit(&self, txn: &TxnCtx) -> Result<()> {
        Self::visit_all(self.entries.iter(), txn, |entry, txn| entry.apply_commit(txn))
    }

    /// Discards participants in reverse order.
    pub fn apply_rollback(&self, txn: &TxnCtx) -> Result<()> {
        Self::visit_all(self.entries.iter().rev(), txn, |entry, txn| {
            entry.apply_rollback(txn)
        })
    }

    fn visit_all<'a, I, F>(entries: I, txn: &TxnCtx, mut step: F) -> Result<()>
    where
        I: Iterator<Item = &'a Box<dyn TxnEntry>>,
        F: FnMut(&dyn TxnEntry, &TxnCtx) -> Result<()>,
    {
        let mut first = None;
        for entry in entries {
            if let Err(err) = step(entry.as_ref(), txn) {
                error!(txn_id = txn.id(), error = %err, "txn participant failed");
                if first.is_none() {
                    first = Some(err);
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
