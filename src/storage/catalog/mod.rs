#![forbid(unsafe_code)]

//! Transactional catalog of databases, tables, segments and blocks.
//!
//! Every object lives in an id-keyed arena and owns a version chain of
//! [`VersionedEntry`] values; parents are referenced by id. Databases and
//! tables are additionally reachable by name through [`NameIndex`]es scoped
//! by [`NameScope`].

mod entry;
mod name_index;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::metrics::{default_metrics, TxnMetrics};
use crate::storage::chain::{NodeHandle, VersionChain};
use crate::storage::mvcc::{settle, Probe, VersionedEntry, Visibility};
use crate::storage::updates::{SpillTarget, UpdateChain};
use crate::txn::{Transaction, TxnCtx};
use crate::types::{BasaltError, ObjectId, Result};

use entry::{CatalogAction, CatalogTxnEntry};
pub use name_index::{NameIndex, NameScope};

/// Level of a catalog object in the hierarchy.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EntityKind {
    /// Top level, named in [`NameScope::Databases`].
    Database,
    /// Child of a database, named in [`NameScope::Tables`].
    Table,
    /// Child of a table, id-addressed.
    Segment,
    /// Child of a segment, id-addressed; owns an update chain.
    Block,
}

impl EntityKind {
    /// Kind a parent of this kind must have.
    pub fn parent_kind(self) -> Option<EntityKind> {
        match self {
            EntityKind::Database => None,
            EntityKind::Table => Some(EntityKind::Database),
            EntityKind::Segment => Some(EntityKind::Table),
            EntityKind::Block => Some(EntityKind::Segment),
        }
    }
}

/// One catalog object and its version chain.
pub struct CatalogObject {
    id: ObjectId,
    kind: EntityKind,
    parent: Option<ObjectId>,
    name: Option<String>,
    chain: RwLock<VersionChain<VersionedEntry>>,
    children: RwLock<Vec<ObjectId>>,
}

impl fmt::Debug for CatalogObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("name", &self.name)
            .finish()
    }
}

impl CatalogObject {
    fn new(id: ObjectId, kind: EntityKind, parent: Option<ObjectId>, name: Option<String>) -> Self {
        Self {
            id,
            kind,
            parent,
            name,
            chain: RwLock::new(VersionChain::new()),
            children: RwLock::new(Vec::new()),
        }
    }

    /// Object id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Hierarchy level.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Parent object, `None` for databases.
    pub fn parent(&self) -> Option<ObjectId> {
        self.parent
    }

    /// Name for databases and tables.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Copy of the version at the scan origin.
    pub fn latest(&self) -> Option<VersionedEntry> {
        self.chain.read().origin().map(|(_, entry)| entry.clone())
    }

    /// Number of versions in the chain.
    pub fn version_count(&self) -> usize {
        self.chain.read().len()
    }

    /// Classifies the origin version for `reader`.
    pub fn visibility(&self, reader: &TxnCtx) -> Visibility {
        match self.chain.read().origin() {
            Some((_, entry)) => entry.visibility(reader),
            None => Visibility::Invisible,
        }
    }

    pub(crate) fn chain(&self) -> &RwLock<VersionChain<VersionedEntry>> {
        &self.chain
    }

    fn child_ids(&self) -> Vec<ObjectId> {
        self.children.read().clone()
    }
}

pub(crate) struct CatalogShared {
    objects: RwLock<FxHashMap<ObjectId, Arc<CatalogObject>>>,
    names: RwLock<FxHashMap<(NameScope, String), Arc<NameIndex>>>,
    pub(crate) commit_lock: Mutex<()>,
    next_id: AtomicU64,
    update_chains: RwLock<FxHashMap<ObjectId, Arc<UpdateChain>>>,
    spill: Option<SpillTarget>,
    metrics: Arc<dyn TxnMetrics>,
}

impl CatalogShared {
    pub(crate) fn object(&self, id: ObjectId) -> Option<Arc<CatalogObject>> {
        self.objects.read().get(&id).cloned()
    }

    fn name_index(&self, scope: NameScope, name: &str) -> Option<Arc<NameIndex>> {
        self.names.read().get(&(scope, name.to_owned())).cloned()
    }

    fn name_index_or_insert(&self, scope: NameScope, name: &str) -> Arc<NameIndex> {
        if let Some(index) = self.name_index(scope, name) {
            return index;
        }
        let mut names = self.names.write();
        Arc::clone(
            names
                .entry((scope, name.to_owned()))
                .or_insert_with(|| Arc::new(NameIndex::new(scope, name.to_owned()))),
        )
    }

    // Unhooks an object whose create rolled back.
    pub(crate) fn detach(&self, object: &CatalogObject) {
        if let (Some(name), Some(scope)) = (object.name(), scope_of(object)) {
            if let Some(index) = self.name_index(scope, name) {
                index.remove(object.id);
            }
        }
        if let Some(parent) = object.parent.and_then(|id| self.object(id)) {
            parent.children.write().retain(|child| *child != object.id);
        }
        self.objects.write().remove(&object.id);
        self.update_chains.write().remove(&object.id);
        trace!(object_id = %object.id, "catalog object detached");
    }

    fn note_conflict(&self, err: &BasaltError) {
        if let Some(kind) = err.conflict_kind() {
            self.metrics.conflict(kind);
        }
    }
}

fn scope_of(object: &CatalogObject) -> Option<NameScope> {
    match object.kind {
        EntityKind::Database => Some(NameScope::Databases),
        EntityKind::Table => object.parent.map(NameScope::Tables),
        EntityKind::Segment | EntityKind::Block => None,
    }
}

/// Registry of all catalog objects.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Catalog {
    shared: Arc<CatalogShared>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("objects", &self.shared.objects.read().len())
            .field("names", &self.shared.names.read().len())
            .finish()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(default_metrics())
    }
}

impl Catalog {
    /// Creates an empty catalog.
    pub fn new(metrics: Arc<dyn TxnMetrics>) -> Self {
        Self::build(metrics, None)
    }

    /// Creates an empty catalog whose block update chains spill compaction
    /// nodes through `spill`.
    pub fn with_spill(metrics: Arc<dyn TxnMetrics>, spill: SpillTarget) -> Self {
        Self::build(metrics, Some(spill))
    }

    fn build(metrics: Arc<dyn TxnMetrics>, spill: Option<SpillTarget>) -> Self {
        Self {
            shared: Arc::new(CatalogShared {
                objects: RwLock::new(FxHashMap::default()),
                names: RwLock::new(FxHashMap::default()),
                commit_lock: Mutex::new(()),
                next_id: AtomicU64::new(1),
                update_chains: RwLock::new(FxHashMap::default()),
                spill,
                metrics,
            }),
        }
    }

    /// Number of objects in the arena, visible or not.
    pub fn object_count(&self) -> usize {
        self.shared.objects.read().len()
    }

    /// Resolves `name` in `scope` for `txn`.
    pub fn resolve(
        &self,
        scope: NameScope,
        name: &str,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        if let NameScope::Tables(db) = scope {
            self.get_object(db, txn)?;
        }
        let reader = txn.ctx();
        let Some(index) = self.shared.name_index(scope, name) else {
            return Err(BasaltError::NotFound);
        };
        let found = settle(reader, || {
            let ids = index.ids();
            Ok(NameIndex::probe(&ids, |id| self.shared.object(id), reader))
        })?;
        found.ok_or(BasaltError::NotFound)
    }

    /// Creates `name` in `scope` as a pending write of `txn`.
    ///
    /// Fails with `Duplicate` when `txn` already sees an entry with that
    /// name, and with `WWConflict` when another writer holds the name or
    /// created it after `txn`'s snapshot.
    pub fn create_entry(
        &self,
        scope: NameScope,
        name: &str,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        let (kind, parent) = match scope {
            NameScope::Databases => (EntityKind::Database, None),
            NameScope::Tables(db) => {
                let parent = self.get_object(db, txn)?;
                if parent.kind() != EntityKind::Database {
                    return Err(BasaltError::Invalid("table parent is not a database"));
                }
                (EntityKind::Table, Some(db))
            }
        };
        let result = self.create_named(scope, name, kind, parent, txn);
        if let Err(err) = &result {
            self.shared.note_conflict(err);
        }
        result
    }

    fn create_named(
        &self,
        scope: NameScope,
        name: &str,
        kind: EntityKind,
        parent: Option<ObjectId>,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        let ctx = Arc::clone(txn.ctx());
        txn.write(|store| {
            settle(&ctx, || {
                let index = self.shared.name_index_or_insert(scope, name);
                let mut ids = index.ids_lock().write();
                match NameIndex::probe(&ids, |id| self.shared.object(id), &ctx) {
                    Probe::Wait(writer) => return Ok(Probe::Wait(writer)),
                    Probe::Ready(Some(_)) => return Err(BasaltError::Duplicate),
                    Probe::Ready(None) => {}
                }
                for id in ids.iter() {
                    let Some(object) = self.shared.object(*id) else {
                        continue;
                    };
                    let chain = object.chain().read();
                    let Some((_, entry)) = chain.origin() else {
                        continue;
                    };
                    let held_by_other = entry.owner().is_some_and(|owner| !owner.is_same(&ctx));
                    if held_by_other || entry.create_after(ctx.start_ts()) {
                        debug!(
                            txn_id = ctx.id(),
                            %scope,
                            name,
                            object_id = %id,
                            "create collides with concurrent writer"
                        );
                        return Err(BasaltError::WWConflict);
                    }
                }
                let (object, handle) = self.new_object(kind, parent, Some(name.to_owned()), &ctx);
                ids.push(object.id());
                store.add_entry(Box::new(CatalogTxnEntry::new(
                    Arc::clone(&self.shared),
                    Arc::clone(&object),
                    handle,
                    CatalogAction::Created,
                )));
                debug!(
                    txn_id = ctx.id(),
                    %scope,
                    name,
                    object_id = %object.id(),
                    "catalog entry created"
                );
                Ok(Probe::Ready(object))
            })
        })
    }

    fn new_object(
        &self,
        kind: EntityKind,
        parent: Option<ObjectId>,
        name: Option<String>,
        ctx: &Arc<TxnCtx>,
    ) -> (Arc<CatalogObject>, NodeHandle) {
        let id = ObjectId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(CatalogObject::new(id, kind, parent, name));
        let handle = object
            .chain()
            .write()
            .insert(VersionedEntry::new_created(id, ctx));
        self.shared.objects.write().insert(id, Arc::clone(&object));
        if let Some(parent) = parent.and_then(|pid| self.shared.object(pid)) {
            parent.children.write().push(id);
        }
        (object, handle)
    }

    /// Resolves `name` in `scope` and binds a pending drop by `txn`.
    pub fn drop_entry(
        &self,
        scope: NameScope,
        name: &str,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        let object = self.resolve(scope, name, txn)?;
        self.drop_resolved(object, txn)
    }

    fn drop_resolved(
        &self,
        object: Arc<CatalogObject>,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        let ctx = Arc::clone(txn.ctx());
        let result = txn.write(|store| {
            let mut chain = object.chain().write();
            let Some((handle, _)) = chain.origin() else {
                return Err(BasaltError::NotFound);
            };
            let entry = chain
                .get_mut(handle)
                .ok_or(BasaltError::Corruption("catalog chain origin vanished"))?;
            let own_create = entry.is_pending_create() && entry.is_same_txn(&ctx);
            entry.try_drop(&ctx)?;
            chain.update(handle);
            // A create by the same transaction already commits or discards
            // the drop together with the create.
            if !own_create {
                store.add_entry(Box::new(CatalogTxnEntry::new(
                    Arc::clone(&self.shared),
                    Arc::clone(&object),
                    handle,
                    CatalogAction::Dropped,
                )));
            }
            debug!(txn_id = ctx.id(), object_id = %object.id(), "catalog entry drop bound");
            Ok(())
        });
        if let Err(err) = &result {
            self.shared.note_conflict(err);
        }
        result.map(|()| object)
    }

    /// Returns object `id` if it and every ancestor are visible to `txn`.
    pub fn get_object(&self, id: ObjectId, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        let object = self.shared.object(id).ok_or(BasaltError::NotFound)?;
        let mut next = Some(Arc::clone(&object));
        while let Some(current) = next {
            if !self.is_visible(&current, txn.ctx())? {
                return Err(BasaltError::NotFound);
            }
            next = match current.parent() {
                Some(parent) => Some(self.shared.object(parent).ok_or(BasaltError::NotFound)?),
                None => None,
            };
        }
        Ok(object)
    }

    fn is_visible(&self, object: &CatalogObject, reader: &TxnCtx) -> Result<bool> {
        settle(reader, || {
            Ok(match object.visibility(reader) {
                Visibility::Visible => Probe::Ready(true),
                Visibility::Invisible => Probe::Ready(false),
                Visibility::Wait(writer) => Probe::Wait(writer),
            })
        })
    }

    /// Drops object `id` as seen by `txn`.
    pub fn drop_object(&self, id: ObjectId, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        let object = self.get_object(id, txn)?;
        self.drop_resolved(object, txn)
    }

    /// Children of `parent` visible to `txn`, in creation order.
    pub fn children(&self, parent: ObjectId, txn: &Transaction) -> Result<Vec<Arc<CatalogObject>>> {
        let parent = self.get_object(parent, txn)?;
        self.visible_among(parent.child_ids(), txn)
    }

    fn visible_among(
        &self,
        ids: Vec<ObjectId>,
        txn: &Transaction,
    ) -> Result<Vec<Arc<CatalogObject>>> {
        let mut visible = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_object(id, txn) {
                Ok(object) => visible.push(object),
                Err(BasaltError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(visible)
    }

    /// Databases visible to `txn`, ordered by name.
    pub fn databases(&self, txn: &Transaction) -> Result<Vec<Arc<CatalogObject>>> {
        self.names_in(NameScope::Databases, txn)
    }

    /// Tables of `db` visible to `txn`, ordered by name.
    pub fn tables(&self, db: ObjectId, txn: &Transaction) -> Result<Vec<Arc<CatalogObject>>> {
        self.get_object(db, txn)?;
        self.names_in(NameScope::Tables(db), txn)
    }

    fn names_in(&self, scope: NameScope, txn: &Transaction) -> Result<Vec<Arc<CatalogObject>>> {
        let mut names: Vec<String> = self
            .shared
            .names
            .read()
            .keys()
            .filter(|(candidate, _)| *candidate == scope)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        let mut visible = Vec::new();
        for name in names {
            match self.resolve(scope, &name, txn) {
                Ok(object) => visible.push(object),
                Err(BasaltError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(visible)
    }

    /// Creates database `name`.
    pub fn create_database(&self, name: &str, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        self.create_entry(NameScope::Databases, name, txn)
    }

    /// Drops database `name`.
    pub fn drop_database(&self, name: &str, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        self.drop_entry(NameScope::Databases, name, txn)
    }

    /// Resolves database `name`.
    pub fn get_database(&self, name: &str, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        self.resolve(NameScope::Databases, name, txn)
    }

    /// Creates table `name` in database `db`.
    pub fn create_table(
        &self,
        db: ObjectId,
        name: &str,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        self.create_entry(NameScope::Tables(db), name, txn)
    }

    /// Drops table `name` of database `db`.
    pub fn drop_table(
        &self,
        db: ObjectId,
        name: &str,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        self.drop_entry(NameScope::Tables(db), name, txn)
    }

    /// Resolves table `name` of database `db`.
    pub fn get_table(
        &self,
        db: ObjectId,
        name: &str,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        self.resolve(NameScope::Tables(db), name, txn)
    }

    /// Creates a segment under `table`.
    pub fn create_segment(&self, table: ObjectId, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        self.create_child(EntityKind::Segment, table, txn)
    }

    /// Drops segment `id`.
    pub fn drop_segment(&self, id: ObjectId, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        self.drop_kind(EntityKind::Segment, id, txn)
    }

    /// Creates a block under `segment`.
    pub fn create_block(&self, segment: ObjectId, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        self.create_child(EntityKind::Block, segment, txn)
    }

    /// Drops block `id`.
    pub fn drop_block(&self, id: ObjectId, txn: &Transaction) -> Result<Arc<CatalogObject>> {
        self.drop_kind(EntityKind::Block, id, txn)
    }

    fn create_child(
        &self,
        kind: EntityKind,
        parent: ObjectId,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        let parent_object = self.get_object(parent, txn)?;
        if Some(parent_object.kind()) != kind.parent_kind() {
            return Err(BasaltError::Invalid("parent kind does not match child kind"));
        }
        let ctx = Arc::clone(txn.ctx());
        txn.write(|store| {
            let (object, handle) = self.new_object(kind, Some(parent), None, &ctx);
            store.add_entry(Box::new(CatalogTxnEntry::new(
                Arc::clone(&self.shared),
                Arc::clone(&object),
                handle,
                CatalogAction::Created,
            )));
            debug!(
                txn_id = ctx.id(),
                object_id = %object.id(),
                parent_id = %parent,
                kind = ?kind,
                "catalog child created"
            );
            Ok(object)
        })
    }

    fn drop_kind(
        &self,
        kind: EntityKind,
        id: ObjectId,
        txn: &Transaction,
    ) -> Result<Arc<CatalogObject>> {
        let object = self.get_object(id, txn)?;
        if object.kind() != kind {
            return Err(BasaltError::Invalid("object kind mismatch"));
        }
        self.drop_resolved(object, txn)
    }

    /// Update chain of block `block_id`, created on first use.
    pub fn block_updates(&self, block_id: ObjectId) -> Result<Arc<UpdateChain>> {
        let object = self.shared.object(block_id).ok_or(BasaltError::NotFound)?;
        if object.kind() != EntityKind::Block {
            return Err(BasaltError::Invalid("update chains belong to blocks"));
        }
        if let Some(chain) = self.shared.update_chains.read().get(&block_id) {
            return Ok(Arc::clone(chain));
        }
        let mut chains = self.shared.update_chains.write();
        let chain = chains.entry(block_id).or_insert_with(|| {
            let chain = UpdateChain::new(block_id, Arc::clone(&self.shared.metrics));
            let chain = match &self.shared.spill {
                Some(spill) => chain.with_spill(spill.clone()),
                None => chain,
            };
            Arc::new(chain)
        });
        Ok(Arc::clone(chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::TxnOptions;
    use crate::txn::TxnManager;
    use crate::types::TxnState;

    fn setup() -> Result<(TxnManager, Catalog)> {
        Ok((TxnManager::new(TxnOptions::default())?, Catalog::default()))
    }

    #[test]
    fn create_commit_resolve() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t1 = mgr.start_txn(b"t1")?;
        let db = catalog.create_database("d1", &t1)?;
        assert_eq!(catalog.get_database("d1", &t1)?.id(), db.id());
        t1.commit()?;

        let t2 = mgr.start_txn(b"t2")?;
        let found = catalog.get_database("d1", &t2)?;
        assert_eq!(found.id(), db.id());
        let entry = found.latest().expect("entry");
        assert!(entry.is_committed());
        assert_eq!(entry.create_at(), t1.commit_ts());
        Ok(())
    }

    #[test]
    fn rolled_back_create_is_detached() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t1 = mgr.start_txn(&[])?;
        let db = catalog.create_database("gone", &t1)?;
        t1.rollback()?;
        assert_eq!(catalog.object_count(), 0);

        let t2 = mgr.start_txn(&[])?;
        assert!(matches!(
            catalog.get_database("gone", &t2),
            Err(BasaltError::NotFound)
        ));
        assert!(matches!(
            catalog.get_object(db.id(), &t2),
            Err(BasaltError::NotFound)
        ));
        // name is free again
        catalog.create_database("gone", &t2)?;
        t2.commit()?;
        Ok(())
    }

    #[test]
    fn drop_then_recreate_keeps_history() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t1 = mgr.start_txn(&[])?;
        let first = catalog.create_database("d", &t1)?;
        t1.commit()?;

        let old_reader = mgr.start_txn(&[])?;
        let t2 = mgr.start_txn(&[])?;
        catalog.drop_database("d", &t2)?;
        t2.commit()?;

        let t3 = mgr.start_txn(&[])?;
        let second = catalog.create_database("d", &t3)?;
        assert_ne!(first.id(), second.id());
        t3.commit()?;

        let t4 = mgr.start_txn(&[])?;
        assert_eq!(catalog.get_database("d", &t4)?.id(), second.id());
        assert_eq!(catalog.get_database("d", &old_reader)?.id(), first.id());
        Ok(())
    }

    #[test]
    fn drop_rollback_restores_entry() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t1 = mgr.start_txn(&[])?;
        catalog.create_database("d", &t1)?;
        t1.commit()?;

        let t2 = mgr.start_txn(&[])?;
        catalog.drop_database("d", &t2)?;
        assert!(matches!(
            catalog.drop_database("d", &t2),
            Err(BasaltError::NotFound)
        ));
        let rival = mgr.start_txn(&[])?;
        assert!(matches!(
            catalog.drop_database("d", &rival),
            Err(BasaltError::WWConflict)
        ));
        t2.rollback()?;

        let t3 = mgr.start_txn(&[])?;
        let db = catalog.get_database("d", &t3)?;
        let entry = db.latest().expect("entry");
        assert!(entry.owner().is_none());
        assert_eq!(entry.delete_at(), 0);
        Ok(())
    }

    #[test]
    fn hierarchy_children_and_kinds() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t = mgr.start_txn(&[])?;
        let db = catalog.create_database("db", &t)?;
        let table = catalog.create_table(db.id(), "t", &t)?;
        let seg = catalog.create_segment(table.id(), &t)?;
        let b1 = catalog.create_block(seg.id(), &t)?;
        let b2 = catalog.create_block(seg.id(), &t)?;
        assert!(matches!(
            catalog.create_block(table.id(), &t),
            Err(BasaltError::Invalid(_))
        ));
        t.commit()?;

        let r = mgr.start_txn(&[])?;
        let blocks: Vec<_> = catalog
            .children(seg.id(), &r)?
            .iter()
            .map(|b| b.id())
            .collect();
        assert_eq!(blocks, vec![b1.id(), b2.id()]);
        assert_eq!(catalog.tables(db.id(), &r)?.len(), 1);

        let w = mgr.start_txn(&[])?;
        catalog.drop_block(b1.id(), &w)?;
        assert_eq!(catalog.children(seg.id(), &w)?.len(), 1);
        assert_eq!(catalog.children(seg.id(), &r)?.len(), 2);
        w.commit()?;
        assert!(matches!(
            catalog.drop_segment(b2.id(), &mgr.start_txn(&[])?),
            Err(BasaltError::Invalid(_))
        ));
        Ok(())
    }

    #[test]
    fn child_create_after_parent_drop_is_rw_conflict() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let setup_txn = mgr.start_txn(&[])?;
        let db = catalog.create_database("db", &setup_txn)?;
        setup_txn.commit()?;

        let creator = mgr.start_txn(&[])?;
        catalog.create_table(db.id(), "t", &creator)?;

        let dropper = mgr.start_txn(&[])?;
        catalog.drop_database("db", &dropper)?;
        dropper.commit()?;

        assert!(matches!(creator.commit(), Err(BasaltError::RWConflict)));
        assert_eq!(creator.state(), TxnState::Rollbacked);
        let after = mgr.start_txn(&[])?;
        assert!(matches!(
            catalog.get_table(db.id(), "t", &after),
            Err(BasaltError::NotFound)
        ));
        Ok(())
    }

    #[test]
    fn create_and_drop_in_one_txn() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t = mgr.start_txn(&[])?;
        catalog.create_database("tmp", &t)?;
        catalog.drop_database("tmp", &t)?;
        assert!(matches!(
            catalog.get_database("tmp", &t),
            Err(BasaltError::NotFound)
        ));
        t.commit()?;
        let r = mgr.start_txn(&[])?;
        assert!(matches!(
            catalog.get_database("tmp", &r),
            Err(BasaltError::NotFound)
        ));
        assert!(catalog.databases(&r)?.is_empty());
        Ok(())
    }

    #[test]
    fn block_updates_requires_block() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t = mgr.start_txn(&[])?;
        let db = catalog.create_database("db", &t)?;
        let table = catalog.create_table(db.id(), "t", &t)?;
        let seg = catalog.create_segment(table.id(), &t)?;
        let block = catalog.create_block(seg.id(), &t)?;
        assert!(matches!(
            catalog.block_updates(seg.id()),
            Err(BasaltError::Invalid(_))
        ));
        let a = catalog.block_updates(block.id())?;
        let b = catalog.block_updates(block.id())?;
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }

    #[test]
    fn dropped_database_hides_descendants() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t = mgr.start_txn(&[])?;
        let db = catalog.create_database("db", &t)?;
        let table = catalog.create_table(db.id(), "t", &t)?;
        let seg = catalog.create_segment(table.id(), &t)?;
        t.commit()?;

        let dropper = mgr.start_txn(&[])?;
        catalog.drop_database("db", &dropper)?;
        dropper.commit()?;

        let after = mgr.start_txn(&[])?;
        assert!(matches!(
            catalog.get_table(db.id(), "t", &after),
            Err(BasaltError::NotFound)
        ));
        assert!(matches!(
            catalog.drop_table(db.id(), "t", &after),
            Err(BasaltError::NotFound)
        ));
        assert!(matches!(
            catalog.get_object(seg.id(), &after),
            Err(BasaltError::NotFound)
        ));
        assert!(matches!(
            catalog.create_segment(table.id(), &after),
            Err(BasaltError::NotFound)
        ));
        assert!(matches!(
            catalog.create_block(seg.id(), &after),
            Err(BasaltError::NotFound)
        ));
        after.commit()?;
        Ok(())
    }

    #[test]
    fn grandchild_create_after_ancestor_drop_is_rw_conflict() -> Result<()> {
        let (mgr, catalog) = setup()?;
        let t = mgr.start_txn(&[])?;
        let db = catalog.create_database("db", &t)?;
        let table = catalog.create_table(db.id(), "t", &t)?;
        t.commit()?;

        let creator = mgr.start_txn(&[])?;
        let seg = catalog.create_segment(table.id(), &creator)?;

        let dropper = mgr.start_txn(&[])?;
        catalog.drop_database("db", &dropper)?;
        dropper.commit()?;

        assert!(matches!(creator.commit(), Err(BasaltError::RWConflict)));
        assert_eq!(creator.state(), TxnState::Rollbacked);
        let after = mgr.start_txn(&[])?;
        assert!(matches!(
            catalog.get_object(seg.id(), &after),
            Err(BasaltError::NotFound)
        ));
        Ok(())
    }
}
