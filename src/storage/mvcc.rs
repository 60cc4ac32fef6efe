//! Versioned entries and snapshot visibility.
//!
//! A [`VersionedEntry`] is one MVCC-tagged version of a catalog object. Its
//! `create_at`/`delete_at` stamps are zero until the respective write commits;
//! while a write is pending the entry keeps an owner reference to the writing
//! transaction's [`TxnCtx`].
//!
//! Visibility is classified without blocking. When the answer depends on a
//! writer that already holds a commit timestamp at or before the reader's
//! snapshot, classification yields [`Visibility::Wait`]; the caller releases
//! its locks, waits via [`settle`] and classifies again.

use std::sync::Arc;

use tracing::trace;

use crate::storage::chain::ChainKey;
use crate::txn::TxnCtx;
use crate::types::{BasaltError, ObjectId, Result, Timestamp, TxnId, TxnState, UNCOMMIT_TS};

/// Pending or settled operation of an entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntryOp {
    /// The entry exists (pending or committed create).
    Create,
    /// A drop is pending or committed.
    SoftDelete,
}

/// Outcome of classifying one version for one reader.
#[derive(Clone, Debug)]
pub enum Visibility {
    /// The reader sees this version.
    Visible,
    /// The reader does not see this version.
    Invisible,
    /// The answer depends on the outcome of this writer.
    Wait(Arc<TxnCtx>),
}

/// Result of a non-blocking probe that may need to wait on a writer.
pub(crate) enum Probe<R> {
    Ready(R),
    Wait(Arc<TxnCtx>),
}

/// Runs `probe` until it is ready, waiting on writers in between.
///
/// `probe` must release every lock it takes before returning `Wait`.
pub(crate) fn settle<R, F>(reader: &TxnCtx, mut probe: F) -> Result<R>
where
    F: FnMut() -> Result<Probe<R>>,
{
    loop {
        match probe()? {
            Probe::Ready(value) => return Ok(value),
            Probe::Wait(writer) => {
                reader.wait_for(&writer)?;
            }
        }
    }
}

/// Visibility of a write that has not settled, owned by a transaction other
/// than the reader.
///
/// Only a writer that is committing with a commit timestamp before the
/// reader's snapshot can become visible; that case waits.
pub(crate) fn pending_write_visibility(owner: &Arc<TxnCtx>, start_ts: Timestamp) -> Visibility {
    let (state, commit_ts) = owner.status();
    match state {
        TxnState::Active | TxnState::Rollbacking | TxnState::Rollbacked => Visibility::Invisible,
        TxnState::Committing if commit_ts > start_ts => Visibility::Invisible,
        TxnState::Committing => Visibility::Wait(Arc::clone(owner)),
        TxnState::Committed if commit_ts < start_ts => Visibility::Visible,
        TxnState::Committed => Visibility::Invisible,
    }
}

/// One version of a catalog object.
#[derive(Clone, Debug)]
pub struct VersionedEntry {
    id: ObjectId,
    create_txn: TxnId,
    create_start_ts: Timestamp,
    drop_txn: Option<TxnId>,
    drop_start_ts: Timestamp,
    create_at: Timestamp,
    delete_at: Timestamp,
    op: EntryOp,
    owner: Option<Arc<TxnCtx>>,
}

impl ChainKey for VersionedEntry {
    fn chain_ts(&self) -> Timestamp {
        if self.owner.is_some() {
            UNCOMMIT_TS
        } else {
            self.create_at
        }
    }
}

impl VersionedEntry {
    /// A pending create of `id` owned by `txn`.
    pub fn new_created(id: ObjectId, txn: &Arc<TxnCtx>) -> Self {
        Self {
            id,
            create_txn: txn.id(),
            create_start_ts: txn.start_ts(),
            drop_txn: None,
            drop_start_ts: 0,
            create_at: 0,
            delete_at: 0,
            op: EntryOp::Create,
            owner: Some(Arc::clone(txn)),
        }
    }

    /// An already committed entry, as restored from durable state.
    pub fn new_committed(id: ObjectId, create_at: Timestamp) -> Self {
        Self {
            id,
            create_txn: 0,
            create_start_ts: 0,
            drop_txn: None,
            drop_start_ts: 0,
            create_at,
            delete_at: 0,
            op: EntryOp::Create,
            owner: None,
        }
    }

    /// Object this entry versions.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Snapshot of the creating transaction.
    pub fn create_start_ts(&self) -> Timestamp {
        self.create_start_ts
    }

    /// Commit timestamp of the create, or [`UNCOMMIT_TS`].
    pub fn create_commit_ts(&self) -> Timestamp {
        if self.create_at == 0 {
            UNCOMMIT_TS
        } else {
            self.create_at
        }
    }

    /// Snapshot of the dropping transaction, zero if never dropped.
    pub fn drop_start_ts(&self) -> Timestamp {
        self.drop_start_ts
    }

    /// Commit timestamp of the drop, or [`UNCOMMIT_TS`].
    pub fn drop_commit_ts(&self) -> Timestamp {
        if self.delete_at == 0 {
            UNCOMMIT_TS
        } else {
            self.delete_at
        }
    }

    /// Create stamp; zero until the create commits.
    pub fn create_at(&self) -> Timestamp {
        self.create_at
    }

    /// Drop stamp; zero until a drop commits.
    pub fn delete_at(&self) -> Timestamp {
        self.delete_at
    }

    /// Current operation.
    pub fn op(&self) -> EntryOp {
        self.op
    }

    /// Writer holding an outstanding intent on this entry.
    pub fn owner(&self) -> Option<&Arc<TxnCtx>> {
        self.owner.as_ref()
    }

    /// Fully settled with a committed create.
    pub fn is_committed(&self) -> bool {
        self.owner.is_none() && self.create_at != 0
    }

    /// The create has a commit stamp.
    pub fn has_created(&self) -> bool {
        self.create_at != 0
    }

    /// A drop has a commit stamp.
    pub fn has_dropped(&self) -> bool {
        self.delete_at != 0
    }

    /// Create committed strictly before `ts`.
    pub fn create_before(&self, ts: Timestamp) -> bool {
        self.create_at != 0 && self.create_at < ts
    }

    /// Create committed strictly after `ts`.
    pub fn create_after(&self, ts: Timestamp) -> bool {
        self.create_at > ts
    }

    /// Drop committed strictly before `ts`.
    pub fn delete_before(&self, ts: Timestamp) -> bool {
        self.delete_at != 0 && self.delete_at < ts
    }

    /// Drop committed strictly after `ts`.
    pub fn delete_after(&self, ts: Timestamp) -> bool {
        self.delete_at > ts
    }

    /// Whether `txn` owns the outstanding intent.
    pub fn is_same_txn(&self, txn: &TxnCtx) -> bool {
        self.owner.as_ref().is_some_and(|owner| owner.is_same(txn))
    }

    fn created_by_owner(&self) -> bool {
        self.owner
            .as_ref()
            .is_some_and(|owner| owner.id() == self.create_txn)
    }

    /// Binds a pending drop by `txn`.
    ///
    /// Fails with `NotFound` when `txn` already dropped the entry, and with
    /// `WWConflict` when another writer holds it or a drop committed after
    /// `txn`'s snapshot.
    pub fn try_drop(&mut self, txn: &Arc<TxnCtx>) -> Result<()> {
        match self.owner.as_ref().map(|owner| owner.is_same(txn)) {
            None => {
                if self.has_dropped() {
                    if self.delete_after(txn.start_ts()) {
                        return Err(BasaltError::WWConflict);
                    }
                    return Err(BasaltError::Validation("entry already dropped"));
                }
                if self.create_after(txn.start_ts()) {
                    return Err(BasaltError::WWConflict);
                }
                self.owner = Some(Arc::clone(txn));
            }
            Some(true) => {
                if self.op == EntryOp::SoftDelete {
                    return Err(BasaltError::NotFound);
                }
            }
            Some(false) => return Err(BasaltError::WWConflict),
        }
        self.op = EntryOp::SoftDelete;
        self.drop_txn = Some(txn.id());
        self.drop_start_ts = txn.start_ts();
        trace!(object_id = %self.id, txn_id = txn.id(), "entry drop bound");
        Ok(())
    }

    /// Stamps `create_at`/`delete_at` with the owner's commit timestamp.
    ///
    /// # Panics
    /// Without an owner, without an assigned commit timestamp, or when the
    /// commit timestamp does not exceed the relevant start timestamp.
    pub fn prepare_commit(&mut self) {
        let Some(owner) = &self.owner else {
            panic!("entry {}: prepare_commit without owning txn", self.id);
        };
        let commit_ts = owner.commit_ts();
        if commit_ts == UNCOMMIT_TS {
            panic!("entry {}: owner {} has no commit ts", self.id, owner.id());
        }
        if self.created_by_owner() {
            if self.create_at != 0 || commit_ts <= self.create_start_ts {
                panic!(
                    "entry {}: bad create stamp {} (create_at {}, start {})",
                    self.id, commit_ts, self.create_at, self.create_start_ts
                );
            }
            self.create_at = commit_ts;
        }
        if self.op == EntryOp::SoftDelete {
            if self.delete_at != 0 || commit_ts <= self.drop_start_ts {
                panic!(
                    "entry {}: bad drop stamp {} (delete_at {}, start {})",
                    self.id, commit_ts, self.delete_at, self.drop_start_ts
                );
            }
            self.delete_at = commit_ts;
        }
    }

    /// Clears stamps applied by [`Self::prepare_commit`].
    pub fn prepare_rollback(&mut self) {
        if self.owner.is_none() {
            return;
        }
        if self.created_by_owner() {
            self.create_at = 0;
        }
        if self.op == EntryOp::SoftDelete {
            self.delete_at = 0;
        }
    }

    /// Reverts a pending drop of a committed entry and detaches the owner.
    pub fn revert_drop(&mut self) {
        self.op = EntryOp::Create;
        self.drop_txn = None;
        self.drop_start_ts = 0;
        self.delete_at = 0;
        self.owner = None;
    }

    /// Detaches the owner once it is terminal.
    ///
    /// # Panics
    /// When the entry has no owner.
    pub fn finalize(&mut self) {
        if self.owner.take().is_none() {
            panic!("entry {}: finalize without owning txn", self.id);
        }
    }

    /// Whether the owning writer created this entry (as opposed to dropping
    /// an existing one).
    pub fn is_pending_create(&self) -> bool {
        self.created_by_owner()
    }

    /// Classifies this entry for `reader`.
    pub fn visibility(&self, reader: &TxnCtx) -> Visibility {
        let start_ts = reader.start_ts();
        let Some(owner) = &self.owner else {
            return self.settled_visibility(start_ts);
        };
        if owner.is_same(reader) {
            return match self.op {
                EntryOp::SoftDelete => Visibility::Invisible,
                EntryOp::Create => Visibility::Visible,
            };
        }
        if self.created_by_owner() {
            if self.op == EntryOp::SoftDelete {
                // created and dropped by the same writer
                return Visibility::Invisible;
            }
            return pending_write_visibility(owner, start_ts);
        }
        // pending drop of a committed entry
        if !self.create_before(start_ts) {
            return Visibility::Invisible;
        }
        let (state, commit_ts) = owner.status();
        match state {
            TxnState::Active | TxnState::Rollbacking | TxnState::Rollbacked => Visibility::Visible,
            TxnState::Committing if commit_ts > start_ts => Visibility::Visible,
            TxnState::Committing => Visibility::Wait(Arc::clone(owner)),
            TxnState::Committed if commit_ts < start_ts => Visibility::Invisible,
            TxnState::Committed => Visibility::Visible,
        }
    }

    fn settled_visibility(&self, start_ts: Timestamp) -> Visibility {
        if !self.create_before(start_ts) || self.delete_before(start_ts) {
            Visibility::Invisible
        } else {
            Visibility::Visible
        }
    }
}
