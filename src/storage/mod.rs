//! Versioned catalog and block update storage.
//!
//! Every mutable object keeps its history in a [`VersionChain`] guarded by its
//! own lock; transactions decide what they see through the visibility rules in
//! [`mvcc`].

/// Database, table, segment and block registry with name resolution.
pub mod catalog;

/// Sorted version list with stable handles.
pub mod chain;

/// Versioned catalog entries and visibility classification.
pub mod mvcc;

/// Row deletes and column overlays per block.
pub mod updates;

pub use catalog::{Catalog, CatalogObject, EntityKind, NameIndex, NameScope};
pub use chain::{ChainKey, NodeHandle, VersionChain};
pub use mvcc::{EntryOp, VersionedEntry, Visibility};
pub use updates::{
    BlockUpdates, ColumnUpdates, SpillTarget, UpdateChain, UpdateNode, UpdateView,
};
