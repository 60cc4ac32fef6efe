use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::catalog::CatalogObject;
use crate::storage::mvcc::{Probe, Visibility};
use crate::txn::TxnCtx;
use crate::types::ObjectId;

/// Namespace a name is resolved in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum NameScope {
    /// Database names, catalog-wide.
    Databases,
    /// Table names inside one database.
    Tables(ObjectId),
}

impl fmt::Display for NameScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameScope::Databases => write!(f, "databases"),
            NameScope::Tables(db) => write!(f, "tables@{db}"),
        }
    }
}

/// Every object id that has ever carried one name in one scope, in creation
/// order.
///
/// A name accumulates ids across its create/drop/recreate history; which one
/// a transaction sees is decided by [`NameIndex::probe`].
pub struct NameIndex {
    scope: NameScope,
    name: String,
    ids: RwLock<Vec<ObjectId>>,
}

impl fmt::Debug for NameIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameIndex")
            .field("scope", &self.scope)
            .field("name", &self.name)
            .field("ids", &*self.ids.read())
            .finish()
    }
}

impl NameIndex {
    pub(crate) fn new(scope: NameScope, name: String) -> Self {
        Self {
            scope,
            name,
            ids: RwLock::new(Vec::new()),
        }
    }

    /// Scope of this name.
    pub fn scope(&self) -> NameScope {
        self.scope
    }

    /// The name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the id list.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.ids.read().clone()
    }

    pub(crate) fn ids_lock(&self) -> &RwLock<Vec<ObjectId>> {
        &self.ids
    }

    pub(crate) fn remove(&self, id: ObjectId) {
        self.ids.write().retain(|candidate| *candidate != id);
    }

    /// One non-blocking resolution pass over `ids` for `reader`.
    ///
    /// Walks ids in creation order and returns the first object whose origin
    /// entry is visible. An entry whose answer depends on a committing writer
    /// stops the walk with `Wait`; the caller releases its locks, waits and
    /// probes again.
    pub(crate) fn probe<L>(
        ids: &[ObjectId],
        lookup: L,
        reader: &TxnCtx,
    ) -> Probe<Option<Arc<CatalogObject>>>
    where
        L: Fn(ObjectId) -> Option<Arc<CatalogObject>>,
    {
        for id in ids {
            let Some(object) = lookup(*id) else {
                continue;
            };
            match object.visibility(reader) {
                Visibility::Visible => return Probe::Ready(Some(object)),
                Visibility::Invisible => continue,
                Visibility::Wait(writer) => return Probe::Wait(writer),
            }
        }
        Probe::Ready(None)
    }
}
