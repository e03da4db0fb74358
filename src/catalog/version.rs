use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::collection::{Collection, IndexEntry};
use crate::catalog::drop_pending::DropPendingTracker;
use crate::catalog::history::{CatalogIdHistory, Existence};
use crate::catalog::registry::{Registry, RegistrationState};
use crate::catalog::views::{ViewDefinition, ViewStore, ViewsForDatabase};
use crate::types::{
    CatalogError, CatalogId, CollectionId, CollectionRef, DatabaseName, Ident, Namespace, Result,
    Timestamp, TxnId,
};

/// Collection counters maintained with every registry change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    /// Collections outside system namespaces and internal databases.
    pub user_collections: usize,
    /// User collections that are capped.
    pub user_capped: usize,
    /// User collections that are clustered.
    pub user_clustered: usize,
    /// System collections and collections in internal databases.
    pub internal: usize,
}

impl CatalogStats {
    fn apply(&mut self, collection: &Collection, added: bool) {
        let step = |slot: &mut usize| {
            *slot = if added {
                slot.saturating_add(1)
            } else {
                slot.saturating_sub(1)
            };
        };
        if collection.is_internal() {
            step(&mut self.internal);
            return;
        }
        step(&mut self.user_collections);
        if collection.options().capped {
            step(&mut self.user_capped);
        }
        if collection.options().clustered {
            step(&mut self.user_clustered);
        }
    }
}

/// One immutable catalog version.
///
/// Readers hold versions through `Arc` and never see them change. Writers
/// receive a structurally shared clone from the
/// [`VersionManager`](crate::catalog::VersionManager), mutate it through the
/// methods below, and the manager publishes it with a single pointer swap.
#[derive(Clone, Debug, Default)]
pub struct CatalogVersion {
    registry: Registry,
    history: CatalogIdHistory,
    views: ViewStore,
    drop_pending: DropPendingTracker,
    shadow: Option<Arc<HashMap<CollectionId, Namespace>>>,
    epoch: u64,
    generation: u64,
    stats: CatalogStats,
}

impl CatalogVersion {
    /// Empty version whose history is complete from `oldest_maintained` on.
    pub fn new(oldest_maintained: Timestamp) -> Self {
        Self {
            history: CatalogIdHistory::new(oldest_maintained),
            ..Self::default()
        }
    }

    /// Collection maps.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Catalog-id history.
    pub fn history(&self) -> &CatalogIdHistory {
        &self.history
    }

    /// Views and profiling settings.
    pub fn views(&self) -> &ViewStore {
        &self.views
    }

    /// Drop-pending tracking.
    pub fn drop_pending(&self) -> &DropPendingTracker {
        &self.drop_pending
    }

    /// Incremented once per close/reopen cycle.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Publication sequence number of this version.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Collection counters.
    pub fn stats(&self) -> CatalogStats {
        self.stats
    }

    /// Whether the catalog is closed and id lookups fall back to the shadow.
    pub fn is_closed(&self) -> bool {
        self.shadow.is_some()
    }

    /// Committed collection by id.
    pub fn lookup_by_id(&self, id: CollectionId) -> Option<Arc<Collection>> {
        self.registry.lookup_by_id(id).cloned()
    }

    /// Committed collection by namespace.
    pub fn lookup_by_namespace(&self, namespace: &Namespace) -> Option<Arc<Collection>> {
        self.registry.lookup_by_namespace(namespace).cloned()
    }

    /// Committed collection by either reference.
    pub fn lookup(&self, target: &CollectionRef) -> Option<Arc<Collection>> {
        match target {
            CollectionRef::Namespace(namespace) => self.lookup_by_namespace(namespace),
            CollectionRef::Id(id) => self.lookup_by_id(*id),
        }
    }

    /// Collection by either reference, pending two-phase registrations
    /// included.
    pub fn lookup_including_pending(&self, target: &CollectionRef) -> Option<Arc<Collection>> {
        match target {
            CollectionRef::Namespace(namespace) => {
                self.registry.lookup_pending_by_namespace(namespace).cloned()
            }
            CollectionRef::Id(id) => self.registry.lookup_pending_by_id(*id).cloned(),
        }
    }

    /// Namespace of `id`. While the catalog is closed, ids unknown to the
    /// registry resolve through the shadow taken at close time.
    pub fn lookup_namespace_by_id(&self, id: CollectionId) -> Option<Namespace> {
        if let Some(collection) = self.registry.lookup_by_id(id) {
            return Some(collection.namespace().clone());
        }
        self.shadow
            .as_ref()
            .and_then(|shadow| shadow.get(&id))
            .cloned()
    }

    /// Id of the collection at `namespace`.
    pub fn lookup_id_by_namespace(&self, namespace: &Namespace) -> Option<CollectionId> {
        self.registry
            .lookup_by_namespace(namespace)
            .map(|collection| collection.id())
    }

    /// Registration state of `id`.
    pub fn registration_state(&self, id: CollectionId) -> RegistrationState {
        self.registry.state_of(id)
    }

    /// Classifies `target` in history at `ts`.
    pub fn lookup_history(&self, target: &CollectionRef, ts: Option<Timestamp>) -> Existence {
        match target {
            CollectionRef::Namespace(namespace) => self.history.lookup_namespace(namespace, ts),
            CollectionRef::Id(id) => self.history.lookup_id(*id, ts),
        }
    }

    /// Committed collections of `db` in id order, bound to this version.
    pub fn iter_database(self: &Arc<Self>, db: &DatabaseName) -> DatabaseCollections {
        DatabaseCollections::resume(Arc::clone(self), db.clone(), None)
    }

    /// Fails with [`CatalogError::NamespaceExists`] when a collection, a
    /// pending registration, a view, or a reserved view name holds
    /// `namespace`.
    pub fn ensure_namespace_free(&self, namespace: &Namespace) -> Result<()> {
        if self.registry.state_of_namespace(namespace) != RegistrationState::Absent
            || self.views.occupies(namespace)
        {
            return Err(CatalogError::NamespaceExists(namespace.clone()));
        }
        Ok(())
    }

    /// Registers a committed collection and records its creation at `ts`.
    pub fn register_collection(
        &mut self,
        collection: Arc<Collection>,
        ts: Option<Timestamp>,
    ) -> Result<()> {
        self.ensure_namespace_free(collection.namespace())?;
        self.registry.insert_committed(Arc::clone(&collection))?;
        self.history.push_create(
            collection.id(),
            collection.namespace(),
            collection.catalog_id(),
            ts,
        )?;
        self.stats.apply(&collection, true);
        Ok(())
    }

    /// Publishes a two-phase registration visible only as pending.
    pub fn register_pending(&mut self, txn: TxnId, collection: Arc<Collection>) -> Result<()> {
        self.ensure_namespace_free(collection.namespace())?;
        self.registry.insert_pending(txn, collection)
    }

    /// Finalizes a two-phase registration owned by `txn`.
    pub fn commit_pending(
        &mut self,
        txn: TxnId,
        collection: Arc<Collection>,
        ts: Option<Timestamp>,
    ) -> Result<()> {
        self.registry.commit_pending(txn, Arc::clone(&collection))?;
        self.history.push_create(
            collection.id(),
            collection.namespace(),
            collection.catalog_id(),
            ts,
        )?;
        self.stats.apply(&collection, true);
        Ok(())
    }

    /// Withdraws a two-phase registration owned by `txn`.
    pub fn remove_pending(&mut self, txn: TxnId, id: CollectionId) -> Option<Arc<Collection>> {
        self.registry.remove_pending(txn, id)
    }

    /// Removes a committed collection, records the drop at `ts`, and
    /// optionally tracks it as drop-pending.
    pub fn deregister(
        &mut self,
        id: CollectionId,
        ts: Option<Timestamp>,
        drop_pending: bool,
    ) -> Result<Arc<Collection>> {
        let collection = self.registry.remove(id)?;
        self.history.push_drop(id, collection.namespace(), ts)?;
        self.stats.apply(&collection, false);
        if drop_pending {
            self.drop_pending.track_collection(&collection);
        }
        Ok(collection)
    }

    /// Moves a committed collection to `to` and records the rename at `ts`.
    pub fn rename(
        &mut self,
        id: CollectionId,
        to: &Namespace,
        ts: Option<Timestamp>,
    ) -> Result<Arc<Collection>> {
        if self.views.occupies(to) {
            return Err(CatalogError::NamespaceExists(to.clone()));
        }
        let from = self
            .registry
            .lookup_by_id(id)
            .cloned()
            .ok_or(CatalogError::CollectionNotFound(id))?;
        let renamed = self.registry.rename(id, to)?;
        self.history
            .push_rename(from.namespace(), to, from.catalog_id(), ts)?;
        self.stats.apply(&from, false);
        self.stats.apply(&renamed, true);
        Ok(renamed)
    }

    /// Publishes a new handle for a committed collection.
    pub fn replace_collection(&mut self, collection: Arc<Collection>) -> Result<()> {
        let previous = self
            .registry
            .lookup_by_id(collection.id())
            .cloned()
            .ok_or(CatalogError::CollectionNotFound(collection.id()))?;
        self.registry.replace(Arc::clone(&collection))?;
        self.stats.apply(&previous, false);
        self.stats.apply(&collection, true);
        Ok(())
    }

    /// Tracks a dropped index until its ident is reclaimed.
    pub fn track_drop_pending_index(&mut self, index: &Arc<IndexEntry>) {
        self.drop_pending.track_index(index);
    }

    /// Forgets a reclaimed ident.
    pub fn notify_ident_dropped(&mut self, ident: &Ident) -> bool {
        self.drop_pending.notify_removed(ident)
    }

    /// Caches a durable scan result for `target` at exactly `ts`.
    pub fn record_scan(&mut self, target: &CollectionRef, ts: Timestamp, found: Option<CatalogId>) {
        match target {
            CollectionRef::Namespace(namespace) => {
                self.history
                    .record_namespace_scan(namespace.clone(), ts, found)
            }
            CollectionRef::Id(id) => self.history.record_id_scan(*id, ts, found),
        }
    }

    /// Reserves a view name for an in-flight creation.
    pub fn reserve_view(&mut self, name: &Namespace) -> Result<()> {
        if self.registry.state_of_namespace(name) != RegistrationState::Absent {
            return Err(CatalogError::NamespaceExists(name.clone()));
        }
        self.views.reserve(name)
    }

    /// Releases a view name reservation.
    pub fn release_view(&mut self, name: &Namespace) {
        self.views.release(name);
    }

    /// Publishes a view, replacing any previous definition of the name.
    pub fn put_view(&mut self, view: Arc<ViewDefinition>) -> Result<()> {
        if self.registry.state_of_namespace(&view.name) != RegistrationState::Absent {
            return Err(CatalogError::NamespaceExists(view.name.clone()));
        }
        self.views.put(view);
        Ok(())
    }

    /// Removes a view.
    pub fn remove_view(&mut self, name: &Namespace) -> Result<Arc<ViewDefinition>> {
        self.views
            .remove(name)
            .ok_or_else(|| CatalogError::NamespaceNotFound(name.to_string()))
    }

    /// Installs a reloaded view set for `db`.
    pub fn replace_views(&mut self, db: DatabaseName, views: ViewsForDatabase) {
        self.views.replace_database(db, views);
    }

    /// Mutable access to views and profile settings.
    pub fn views_mut(&mut self) -> &mut ViewStore {
        &mut self.views
    }

    /// Snapshots id to namespace mappings and enters the closed state.
    pub fn close(&mut self) -> Result<()> {
        if self.shadow.is_some() {
            return Err(CatalogError::invariant("catalog closed twice"));
        }
        let shadow = self.registry.namespaces_by_id();
        info!(collections = shadow.len(), epoch = self.epoch, "catalog.close");
        self.shadow = Some(Arc::new(shadow));
        Ok(())
    }

    /// Leaves the closed state and bumps the epoch.
    pub fn open(&mut self) -> Result<()> {
        if self.shadow.take().is_none() {
            return Err(CatalogError::invariant("catalog opened while not closed"));
        }
        self.epoch += 1;
        info!(epoch = self.epoch, "catalog.open");
        Ok(())
    }

    /// O(1) check whether history can be pruned at `oldest`.
    pub fn needs_cleanup(&self, oldest: Timestamp) -> bool {
        self.history.needs_cleanup(oldest)
    }

    /// Prunes history below `oldest` and forgets dead drop-pending entries.
    pub fn cleanup(&mut self, oldest: Timestamp) -> usize {
        let pruned = self.history.cleanup(oldest);
        let dead = self.drop_pending.purge_dead();
        debug!(oldest = %oldest, pruned, dead, "catalog.version.cleanup");
        pruned
    }

    /// Re-bases history on the live collections after a reopen at `stable`.
    pub fn reseed_history(&mut self, stable: Timestamp) -> Result<()> {
        let live: Vec<(CollectionId, Namespace, CatalogId)> = self
            .registry
            .iter()
            .map(|c| (c.id(), c.namespace().clone(), c.catalog_id()))
            .collect();
        self.history.reseed_for_reopen(
            stable,
            live.iter()
                .map(|(id, namespace, catalog_id)| (*id, namespace, *catalog_id)),
        )
    }

    /// Removes every collection and view. History, profiling settings and
    /// the closed state are kept.
    pub fn deregister_all(&mut self) {
        info!(
            collections = self.registry.len(),
            "catalog.deregister_all"
        );
        self.registry = Registry::default();
        self.views.clear();
        self.stats = CatalogStats::default();
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

/// Restartable iterator over one database's collections, bound to the
/// version it was created from.
#[derive(Clone, Debug)]
pub struct DatabaseCollections {
    version: Arc<CatalogVersion>,
    db: DatabaseName,
    last: Option<CollectionId>,
}

impl DatabaseCollections {
    /// Continues iteration after `after` (or from the start).
    pub fn resume(version: Arc<CatalogVersion>, db: DatabaseName, after: Option<CollectionId>) -> Self {
        Self {
            version,
            db,
            last: after,
        }
    }

    /// Id of the last collection returned.
    pub fn position(&self) -> Option<CollectionId> {
        self.last
    }

    /// The version being iterated.
    pub fn version(&self) -> &Arc<CatalogVersion> {
        &self.version
    }
}

impl Iterator for DatabaseCollections {
    type Item = Arc<Collection>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = Arc::clone(self.version.registry.next_in(&self.db, self.last)?);
        self.last = Some(next.id());
        Some(next)
    }
}
