use std::sync::Arc;

use tracing::{debug, warn};

use crate::storage::catalog::{CatalogObject, CatalogShared};
use crate::storage::chain::NodeHandle;
use crate::txn::{TxnCtx, TxnEntry};
use crate::types::{BasaltError, Result};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CatalogAction {
    Created,
    Dropped,
}

/// Commit participant for one catalog write.
pub(crate) struct CatalogTxnEntry {
    shared: Arc<CatalogShared>,
    object: Arc<CatalogObject>,
    handle: NodeHandle,
    action: CatalogAction,
}

impl CatalogTxnEntry {
    pub(crate) fn new(
        shared: Arc<CatalogShared>,
        object: Arc<CatalogObject>,
        handle: NodeHandle,
        action: CatalogAction,
    ) -> Self {
        Self {
            shared,
            object,
            handle,
            action,
        }
    }

    // A create must not commit after the drop of any ancestor committed.
    fn check_ancestors(&self, txn: &TxnCtx) -> Result<()> {
        let mut next = self.object.parent();
        while let Some(ancestor_id) = next {
            let Some(ancestor) = self.shared.object(ancestor_id) else {
                return Err(BasaltError::RWConflict);
            };
            let chain = ancestor.chain().read();
            let Some((_, entry)) = chain.origin() else {
                return Err(BasaltError::RWConflict);
            };
            if entry.has_dropped() && entry.delete_at() < txn.commit_ts() {
                warn!(
                    txn_id = txn.id(),
                    object_id = %self.object.id(),
                    ancestor_id = %ancestor_id,
                    ancestor_delete_at = entry.delete_at(),
                    commit_ts = txn.commit_ts(),
                    "ancestor dropped before child commit"
                );
                return Err(BasaltError::RWConflict);
            }
            next = ancestor.parent();
        }
        Ok(())
    }
}

impl TxnEntry for CatalogTxnEntry {
    fn prepare_commit(&self, txn: &TxnCtx) -> Result<()> {
        let _serial = self.shared.commit_lock.lock();
        if self.action == CatalogAction::Created {
            self.check_ancestors(txn)?;
        }
        let mut chain = self.object.chain().write();
        let entry = chain
            .get_mut(self.handle)
            .ok_or(BasaltError::Corruption("catalog entry vanished before commit"))?;
        entry.prepare_commit();
        Ok(())
    }

    fn prepare_rollback(&self, _txn: &TxnCtx) -> Result<()> {
        let _serial = self.shared.commit_lock.lock();
        let mut chain = self.object.chain().write();
        if let Some(entry) = chain.get_mut(self.handle) {
            entry.prepare_rollback();
        }
        Ok(())
    }

    fn apply_commit(&self, txn: &TxnCtx) -> Result<()> {
        let _serial = self.shared.commit_lock.lock();
        let mut chain = self.object.chain().write();
        let entry = chain
            .get_mut(self.handle)
            .ok_or(BasaltError::Corruption("catalog entry vanished before apply"))?;
        entry.finalize();
        chain.update(self.handle);
        debug!(
            txn_id = txn.id(),
            commit_ts = txn.commit_ts(),
            object_id = %self.object.id(),
            kind = ?self.object.kind(),
            action = ?self.action,
            "catalog write committed"
        );
        Ok(())
    }

    fn apply_rollback(&self, txn: &TxnCtx) -> Result<()> {
        let _serial = self.shared.commit_lock.lock();
        match self.action {
            CatalogAction::Created => {
                self.object.chain().write().delete(self.handle);
                self.shared.detach(&self.object);
            }
            CatalogAction::Dropped => {
                let mut chain = self.object.chain().write();
                if let Some(entry) = chain.get_mut(self.handle) {
                    entry.revert_drop();
                }
                chain.update(self.handle);
            }
        }
        debug!(
            txn_id = txn.id(),
            object_id = %self.object.id(),
            action = ?self.action,
            "catalog write rolled back"
        );
        Ok(())
    }
}
