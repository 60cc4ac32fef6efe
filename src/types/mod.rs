//! Identifiers, timestamps and the crate-wide error type.

#![forbid(unsafe_code)]

use std::fmt;

pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

/// Logical clock value shared by start and commit timestamps.
pub type Timestamp = u64;

/// Sentinel commit timestamp meaning "not yet committed".
pub const UNCOMMIT_TS: Timestamp = Timestamp::MAX;

/// Transaction identifier, allocated independently of timestamps.
pub type TxnId = u64;

/// Stable identifier of a catalog object (database, table, segment or block).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ObjectId {
    fn from(value: u64) -> Self {
        ObjectId(value)
    }
}

/// Lifecycle state of a transaction.
///
/// Transitions only move forward: `Active -> Committing -> Committed`,
/// `Active | Committing -> Rollbacking -> Rollbacked`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TxnState {
    /// Accepting reads and writes; no commit timestamp yet.
    Active,
    /// Commit timestamp assigned, prepare succeeded or in progress.
    Committing,
    /// Commit timestamp assigned, effects are being discarded.
    Rollbacking,
    /// Terminal: effects are durable and visible.
    Committed,
    /// Terminal: effects were discarded.
    Rollbacked,
}

impl TxnState {
    /// Returns `true` for `Committed` and `Rollbacked`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Rollbacked)
    }

    /// Returns `true` while a commit timestamp is assigned but not finalized.
    pub const fn is_committing(self) -> bool {
        matches!(self, TxnState::Committing | TxnState::Rollbacking)
    }

    /// Whether `self -> next` is one of the permitted edges.
    pub const fn can_transition_to(self, next: TxnState) -> bool {
        matches!(
            (self, next),
            (TxnState::Active, TxnState::Committing)
                | (TxnState::Active, TxnState::Rollbacking)
                | (TxnState::Committing, TxnState::Rollbacking)
                | (TxnState::Committing, TxnState::Committed)
                | (TxnState::Rollbacking, TxnState::Rollbacked)
        )
    }
}

/// Which kind of conflict an operation ran into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConflictKind {
    /// Two writers contended for the same entry or row.
    WriteWrite,
    /// A commit observed an ancestor dropped before its commit point.
    ReadWrite,
}

/// Errors produced by catalog, update-chain and transaction operations.
#[derive(thiserror::Error, Debug)]
pub enum BasaltError {
    /// I/O failure from a log device.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Name or entry absent, or already in the requested terminal state.
    #[error("not found")]
    NotFound,
    /// Create collided with a currently visible entry.
    #[error("duplicate entry")]
    Duplicate,
    /// Another, still-active writer holds the same entry or row.
    #[error("write-write conflict")]
    WWConflict,
    /// An ancestor was dropped before this commit point.
    #[error("read-write conflict")]
    RWConflict,
    /// Caller attempted an illegal entry transition.
    #[error("validation failed: {0}")]
    Validation(&'static str),
    /// Commit or rollback requested from a state that does not permit it.
    #[error("illegal state transition: {from:?} -> {to:?}")]
    IllegalStateTransition {
        /// State the transaction was in.
        from: TxnState,
        /// State that was requested.
        to: TxnState,
    },
    /// Waiting on another transaction's outcome exceeded the configured deadline.
    #[error("timed out waiting for transaction {0}")]
    WaitTimeout(TxnId),
    /// The transaction manager no longer accepts work.
    #[error("transaction manager stopped")]
    Stopped,
    /// A pre-commit hook rejected the commit.
    #[error("pre-commit hook failed: {0}")]
    Hook(String),
}

impl BasaltError {
    /// Returns the conflict kind when this error is a conflict.
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            BasaltError::WWConflict => Some(ConflictKind::WriteWrite),
            BasaltError::RWConflict => Some(ConflictKind::ReadWrite),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BasaltError>;
