//! Versioned collection catalog.
//!
//! [`Catalog`] is the entry point. It keeps the latest [`CatalogVersion`] in
//! a [`VersionManager`], stages transactional changes on the caller's
//! [`OpContext`], and answers historical lookups through the
//! [`PointInTimeResolver`] with a [`DurableCatalog`] as ground truth.

pub mod collection;
pub mod context;
pub mod drop_pending;
pub mod durable;
pub mod history;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod resolver;
mod uncommitted;
pub mod version;
pub mod views;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

pub use collection::{Collection, CollectionOptions, IndexEntry};
pub use context::{LockMode, LockResource, OpContext, PrepareUndo, WriteUnit};
pub use drop_pending::DropPendingTracker;
pub use durable::{
    DurableCatalog, DurableDump, DurableEntry, DurableEvent, DurableIndex, MemoryDurableCatalog,
};
pub use history::{CatalogIdHistory, Existence, HistoryEntry};
pub use manager::{BatchedWriter, CatalogStasher, VersionManager, WriteJob};
pub use metrics::{default_metrics, CatalogMetrics, CounterMetrics, NoopMetrics};
pub use registry::{RegistrationState, Registry};
pub use resolver::PointInTimeResolver;
pub use version::{CatalogStats, CatalogVersion, DatabaseCollections};
pub use views::{
    default_view_validator, validate_pipeline, Durability, ProfileFilter, ProfileSettings,
    ViewDefinition, ViewReload, ViewStats, ViewValidator, ViewsForDatabase,
};

use crate::options::CatalogOptions;
use crate::types::{
    CatalogError, CollectionId, CollectionRef, DatabaseName, Ident, Namespace, Result, Timestamp,
};
use uncommitted::{Staged, UncommittedUpdates};

/// Shared handle to the collection catalog.
///
/// Cloning is cheap; every clone observes and publishes the same versions.
#[derive(Clone)]
pub struct Catalog {
    manager: VersionManager,
    durable: Arc<dyn DurableCatalog>,
    options: Arc<CatalogOptions>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("manager", &self.manager)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Catalog {
    /// Empty catalog whose history is complete from the beginning of time.
    pub fn new(durable: Arc<dyn DurableCatalog>, options: CatalogOptions) -> Self {
        Self::with_version(durable, options, CatalogVersion::default())
    }

    /// Loads every collection `durable` holds at `stable` (latest when
    /// `None`). History is complete from `stable` on; older lookups fall back
    /// to durable scans.
    pub fn open(
        durable: Arc<dyn DurableCatalog>,
        options: CatalogOptions,
        stable: Option<Timestamp>,
    ) -> Result<Self> {
        let base = stable.unwrap_or(Timestamp::MIN);
        let mut version = CatalogVersion::new(base);
        for entry in durable.list_at(stable)? {
            version.register_collection(Arc::new(Collection::from_durable(&entry, None)), None)?;
        }
        version.reseed_history(base)?;
        info!(
            collections = version.registry().len(),
            stable = ?stable,
            "catalog.open_from_durable"
        );
        Ok(Self::with_version(durable, options, version))
    }

    fn with_version(
        durable: Arc<dyn DurableCatalog>,
        options: CatalogOptions,
        version: CatalogVersion,
    ) -> Self {
        let metrics = options.metrics.clone().unwrap_or_else(default_metrics);
        Self {
            manager: VersionManager::with_metrics(version, metrics),
            durable,
            options: Arc::new(options),
        }
    }

    /// The version register.
    pub fn manager(&self) -> &VersionManager {
        &self.manager
    }

    /// The durable catalog backing historical lookups.
    pub fn durable(&self) -> &Arc<dyn DurableCatalog> {
        &self.durable
    }

    /// Options the catalog was created with.
    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    /// Version `ctx` reads from.
    pub fn current(&self, ctx: &OpContext) -> Arc<CatalogVersion> {
        self.manager.current(ctx)
    }

    fn resolver(&self) -> PointInTimeResolver<'_> {
        PointInTimeResolver::new(&self.manager, self.durable.as_ref())
            .cache_scan_results(self.options.cache_scan_results)
            .reuse_drop_pending(self.options.reuse_drop_pending)
    }

    fn staged<R>(&self, ctx: &OpContext, f: impl FnOnce(&UncommittedUpdates) -> Staged<R>) -> Staged<R> {
        ctx.peek(f).unwrap_or(Staged::Untouched)
    }

    fn ensure_namespace_free(&self, ctx: &OpContext, namespace: &Namespace) -> Result<()> {
        if ctx.peek(|updates| updates.occupies(namespace)).unwrap_or(false) {
            return Err(CatalogError::NamespaceExists(namespace.clone()));
        }
        if ctx.peek(|updates| updates.vacated(namespace)).unwrap_or(false) {
            return Ok(());
        }
        self.manager.latest().ensure_namespace_free(namespace)
    }

    // ---- lookups -------------------------------------------------------

    /// Collection with `id`, including this context's uncommitted changes.
    pub fn lookup_by_id(&self, ctx: &OpContext, id: CollectionId) -> Option<Arc<Collection>> {
        match self.staged(ctx, |updates| updates.lookup_by_id(id)) {
            Staged::Present(collection) => Some(collection),
            Staged::Removed => None,
            Staged::Untouched => self.manager.current(ctx).lookup_by_id(id),
        }
    }

    /// Collection at `namespace`, including this context's uncommitted
    /// changes.
    pub fn lookup_by_namespace(&self, ctx: &OpContext, namespace: &Namespace) -> Option<Arc<Collection>> {
        match self.staged(ctx, |updates| updates.lookup_by_namespace(namespace)) {
            Staged::Present(collection) => Some(collection),
            Staged::Removed => None,
            Staged::Untouched => self.manager.current(ctx).lookup_by_namespace(namespace),
        }
    }

    /// Collection by either reference.
    pub fn lookup(&self, ctx: &OpContext, target: &CollectionRef) -> Option<Arc<Collection>> {
        match target {
            CollectionRef::Namespace(namespace) => self.lookup_by_namespace(ctx, namespace),
            CollectionRef::Id(id) => self.lookup_by_id(ctx, *id),
        }
    }

    /// Tries `namespace` first, then `id`.
    pub fn lookup_by_namespace_or_id(
        &self,
        ctx: &OpContext,
        namespace: Option<&Namespace>,
        id: Option<CollectionId>,
    ) -> Option<Arc<Collection>> {
        namespace
            .and_then(|namespace| self.lookup_by_namespace(ctx, namespace))
            .or_else(|| id.and_then(|id| self.lookup_by_id(ctx, id)))
    }

    /// Namespace of `id`. While the catalog is closed, ids dropped since the
    /// close still resolve to their namespace at close time.
    pub fn lookup_namespace_by_id(&self, ctx: &OpContext, id: CollectionId) -> Option<Namespace> {
        match self.staged(ctx, |updates| updates.lookup_by_id(id)) {
            Staged::Present(collection) => Some(collection.namespace().clone()),
            Staged::Removed => None,
            Staged::Untouched => self.manager.current(ctx).lookup_namespace_by_id(id),
        }
    }

    /// Id of the collection at `namespace`.
    pub fn lookup_id_by_namespace(&self, ctx: &OpContext, namespace: &Namespace) -> Option<CollectionId> {
        self.lookup_by_namespace(ctx, namespace)
            .map(|collection| collection.id())
    }

    /// Namespace a reference names; fails when an id does not resolve.
    pub fn resolve_namespace(&self, ctx: &OpContext, target: &CollectionRef) -> Result<Namespace> {
        match target {
            CollectionRef::Namespace(namespace) => Ok(namespace.clone()),
            CollectionRef::Id(id) => self
                .lookup_namespace_by_id(ctx, *id)
                .ok_or_else(|| CatalogError::NamespaceNotFound(id.to_string())),
        }
    }

    /// Collection `target` named at `read_ts`; `None` reads the latest
    /// mapping, including pending two-phase registrations.
    pub fn establish_consistent_collection(
        &self,
        ctx: &OpContext,
        target: &CollectionRef,
        read_ts: Option<Timestamp>,
    ) -> Result<Option<Arc<Collection>>> {
        if read_ts.is_none() {
            let staged = match target {
                CollectionRef::Namespace(namespace) => {
                    self.staged(ctx, |updates| updates.lookup_by_namespace(namespace))
                }
                CollectionRef::Id(id) => self.staged(ctx, |updates| updates.lookup_by_id(*id)),
            };
            match staged {
                Staged::Present(collection) => return Ok(Some(collection)),
                Staged::Removed => return Ok(None),
                Staged::Untouched => {}
            }
        }
        self.resolver()
            .establish_consistent_collection(ctx, target, read_ts)
    }

    /// Whether `id` is registered but its creating transaction has not
    /// committed yet.
    pub fn is_awaiting_visibility(&self, ctx: &OpContext, id: CollectionId) -> bool {
        matches!(
            self.manager.current(ctx).registration_state(id),
            RegistrationState::Pending(_)
        )
    }

    /// Whether `collection` is the exact handle this context would see.
    pub fn contains(&self, ctx: &OpContext, collection: &Arc<Collection>) -> bool {
        self.lookup_by_id(ctx, collection.id())
            .is_some_and(|current| Arc::ptr_eq(&current, collection))
    }

    /// Ids of `db`'s committed collections in id order.
    pub fn all_collection_ids(&self, ctx: &OpContext, db: &DatabaseName) -> Vec<CollectionId> {
        self.manager.current(ctx).registry().ids_in(db)
    }

    /// Namespaces of `db`'s committed collections, sorted.
    pub fn all_collection_names(&self, ctx: &OpContext, db: &DatabaseName) -> Vec<Namespace> {
        let mut names: Vec<Namespace> = self
            .manager
            .current(ctx)
            .registry()
            .collections_in(db)
            .map(|collection| collection.namespace().clone())
            .collect();
        names.sort();
        names
    }

    /// Databases with at least one committed collection, sorted.
    pub fn all_database_names(&self, ctx: &OpContext) -> Vec<DatabaseName> {
        self.manager.current(ctx).registry().database_names()
    }

    /// Whether `id` resolves and its handle satisfies `predicate`.
    pub fn satisfies(
        &self,
        ctx: &OpContext,
        id: CollectionId,
        predicate: impl FnOnce(&Collection) -> bool,
    ) -> bool {
        self.lookup_by_id(ctx, id)
            .is_some_and(|collection| predicate(&collection))
    }

    /// Restartable iterator over `db`'s collections in the version `ctx`
    /// reads.
    pub fn iter_database(&self, ctx: &OpContext, db: &DatabaseName) -> DatabaseCollections {
        self.manager.current(ctx).iter_database(db)
    }

    /// Collection counters of the version `ctx` reads.
    pub fn stats(&self, ctx: &OpContext) -> CatalogStats {
        self.manager.current(ctx).stats()
    }

    // ---- collection DDL ----------------------------------------------

    /// Registers a new collection in `ctx`'s write unit. The creating
    /// context sees it immediately, everyone else once the unit commits.
    pub fn register_create(
        &self,
        ctx: &OpContext,
        collection: Collection,
        commit_ts: Option<Timestamp>,
    ) -> Result<Arc<Collection>> {
        let namespace = collection.namespace().clone();
        ctx.require_claim(&namespace, LockMode::Exclusive)?;
        self.ensure_namespace_free(ctx, &namespace)?;
        let id = collection.id();
        if self.manager.latest().registration_state(id) != RegistrationState::Absent
            || !matches!(self.staged(ctx, |updates| updates.lookup_by_id(id)), Staged::Untouched)
        {
            return Err(CatalogError::CollectionIdExists(id));
        }
        let handle = Arc::new(collection);
        ctx.stage(&self.manager, |updates| {
            updates.stage_create(Arc::clone(&handle), false, commit_ts);
            Ok(())
        })?;
        info!(ns = %namespace, %id, "catalog.create.staged");
        Ok(handle)
    }

    /// Registers a collection in two phases: a pending registration is
    /// published right away, so concurrent creations of the namespace or id
    /// conflict, and the owning unit's commit finalizes it.
    pub fn register_create_two_phase(
        &self,
        ctx: &OpContext,
        collection: Collection,
        commit_ts: Option<Timestamp>,
    ) -> Result<Arc<Collection>> {
        let namespace = collection.namespace().clone();
        let id = collection.id();
        ctx.require_claim(&namespace, LockMode::IntentExclusive)?;
        if ctx.peek(|updates| updates.occupies(&namespace)).unwrap_or(false) {
            return Err(CatalogError::NamespaceExists(namespace));
        }
        // Binds the unit to this catalog before anything is published.
        ctx.stage(&self.manager, |_| Ok(()))?;

        let handle = Arc::new(collection);
        let txn = ctx.txn();
        let pending = Arc::clone(&handle);
        self.manager
            .write(move |version| version.register_pending(txn, pending))?;
        let manager = self.manager.clone();
        ctx.on_rollback(move || {
            let withdrawn = manager.write(move |version| {
                version.remove_pending(txn, id);
                Ok(())
            });
            if let Err(err) = withdrawn {
                warn!(%id, error = %err, "catalog.create.pending_rollback_failed");
            }
        })?;
        ctx.stage(&self.manager, |updates| {
            updates.stage_create(Arc::clone(&handle), true, commit_ts);
            Ok(())
        })?;
        info!(ns = %namespace, %id, txn = %txn, "catalog.create.pending");
        Ok(handle)
    }

    /// Removes a collection at commit. Returns the handle being dropped;
    /// with `drop_pending`, the catalog keeps a weak reference to it, keyed
    /// by ident, for as long as the caller holds it.
    pub fn deregister(
        &self,
        ctx: &OpContext,
        id: CollectionId,
        drop_pending: bool,
        commit_ts: Option<Timestamp>,
    ) -> Result<Arc<Collection>> {
        let current = self
            .lookup_by_id(ctx, id)
            .ok_or(CatalogError::CollectionNotFound(id))?;
        ctx.require_claim(current.namespace(), LockMode::Exclusive)?;
        ctx.stage(&self.manager, |updates| {
            updates.stage_drop(id, current.namespace(), drop_pending, commit_ts);
            Ok(())
        })?;
        info!(ns = %current.namespace(), %id, drop_pending, "catalog.drop.staged");
        Ok(current)
    }

    /// Moves collection `id` to `to` at commit.
    pub fn rename(
        &self,
        ctx: &OpContext,
        id: CollectionId,
        to: &Namespace,
        commit_ts: Option<Timestamp>,
    ) -> Result<Arc<Collection>> {
        let current = self
            .lookup_by_id(ctx, id)
            .ok_or(CatalogError::CollectionNotFound(id))?;
        ctx.require_claim(current.namespace(), LockMode::Exclusive)?;
        ctx.require_claim(to, LockMode::Exclusive)?;
        self.ensure_namespace_free(ctx, to)?;
        let renamed = ctx.stage(&self.manager, |updates| {
            updates.stage_rename(&current, to, commit_ts)
        })?;
        info!(from = %current.namespace(), to = %to, %id, "catalog.rename.staged");
        Ok(renamed)
    }

    /// Removes an index at commit. With `drop_pending`, the removed entry is
    /// tracked by ident until its storage is reclaimed.
    pub fn drop_index(
        &self,
        ctx: &OpContext,
        namespace: &Namespace,
        index: &str,
        drop_pending: bool,
        commit_ts: Option<Timestamp>,
    ) -> Result<Arc<IndexEntry>> {
        let current = self
            .lookup_by_namespace(ctx, namespace)
            .ok_or_else(|| CatalogError::NamespaceNotFound(namespace.to_string()))?;
        ctx.require_claim(namespace, LockMode::Exclusive)?;
        if current.index(index).is_none() {
            return Err(CatalogError::IndexNotFound {
                namespace: namespace.clone(),
                index: index.to_string(),
            });
        }
        ctx.stage(&self.manager, |updates| {
            let removed = updates.edit(&current, |collection| {
                let removed = collection.remove_index(index);
                if commit_ts.is_some() {
                    collection.set_min_valid(commit_ts);
                }
                removed
            });
            let removed = removed.ok_or_else(|| {
                CatalogError::invariant(format!("index {index} vanished from {namespace}"))
            })?;
            updates.stage_drop_index(Arc::clone(&removed), drop_pending);
            Ok(removed)
        })
    }

    /// Edits this unit's private copy of the collection at `namespace`.
    /// Later calls in the same unit see earlier edits; the final state is
    /// published at commit.
    pub fn with_metadata_write<R>(
        &self,
        ctx: &OpContext,
        namespace: &Namespace,
        edit: impl FnOnce(&mut Collection) -> R,
    ) -> Result<R> {
        let current = self
            .lookup_by_namespace(ctx, namespace)
            .ok_or_else(|| CatalogError::NamespaceNotFound(namespace.to_string()))?;
        let pending_here = ctx
            .peek(|updates| updates.is_pending_creation(current.id()))
            .unwrap_or(false);
        let mode = if pending_here {
            LockMode::IntentExclusive
        } else {
            LockMode::Exclusive
        };
        ctx.require_claim(namespace, mode)?;
        ctx.stage(&self.manager, |updates| Ok(updates.edit(&current, edit)))
    }

    // ---- views ---------------------------------------------------------

    /// Creates a view at commit. The name is reserved immediately so
    /// concurrent creations of the same namespace conflict; rollback
    /// releases it. `NotYetDurable` views are written to the durable catalog
    /// before the unit publishes.
    pub fn create_view(
        &self,
        ctx: &OpContext,
        view: ViewDefinition,
        durability: Durability,
    ) -> Result<()> {
        let name = view.name.clone();
        ctx.require_claim(&name, LockMode::Exclusive)?;
        (self.options.view_validator)(&view)?;
        if ctx.peek(|updates| updates.occupies(&name)).unwrap_or(false) {
            return Err(CatalogError::NamespaceExists(name));
        }
        ctx.stage(&self.manager, |_| Ok(()))?;
        self.open_database(ctx, name.db())?;

        let reserved = name.clone();
        self.manager
            .write(move |version| version.reserve_view(&reserved))?;
        let manager = self.manager.clone();
        let released = name.clone();
        ctx.on_rollback(move || {
            let result = manager.write(move |version| {
                version.release_view(&released);
                Ok(())
            });
            if let Err(err) = result {
                warn!(error = %err, "catalog.views.release_failed");
            }
        })?;

        let view = Arc::new(view);
        if durability == Durability::NotYetDurable {
            self.persist_view_on_prepare(ctx, Arc::clone(&view))?;
        }
        ctx.stage(&self.manager, |updates| {
            updates.stage_put_view(view);
            Ok(())
        })?;
        info!(view = %name, "catalog.views.create");
        Ok(())
    }

    /// Replaces the definition of an existing view at commit.
    pub fn modify_view(&self, ctx: &OpContext, view: ViewDefinition) -> Result<()> {
        let name = view.name.clone();
        ctx.require_claim(&name, LockMode::Exclusive)?;
        self.open_database(ctx, name.db())?;
        if self.lookup_view_without_validating(ctx, &name).is_none() {
            return Err(CatalogError::NamespaceNotFound(name.to_string()));
        }
        (self.options.view_validator)(&view)?;
        let view = Arc::new(view);
        self.persist_view_on_prepare(ctx, Arc::clone(&view))?;
        ctx.stage(&self.manager, |updates| {
            updates.stage_put_view(view);
            Ok(())
        })?;
        info!(view = %name, "catalog.views.modify");
        Ok(())
    }

    /// Drops a view at commit.
    pub fn drop_view(&self, ctx: &OpContext, name: &Namespace) -> Result<()> {
        ctx.require_claim(name, LockMode::Exclusive)?;
        self.open_database(ctx, name.db())?;
        if self.lookup_view_without_validating(ctx, name).is_none() {
            return Err(CatalogError::NamespaceNotFound(name.to_string()));
        }
        let durable = Arc::clone(&self.durable);
        let removed = name.clone();
        ctx.on_prepare_undoable(move || {
            let previous = durable.view_record(&removed)?;
            durable.remove_view(&removed)?;
            Ok(restore_view_record(durable, removed, previous))
        })?;
        ctx.stage(&self.manager, |updates| {
            updates.stage_drop_view(name);
            Ok(())
        })?;
        info!(view = %name, "catalog.views.drop");
        Ok(())
    }

    fn persist_view_on_prepare(&self, ctx: &OpContext, view: Arc<ViewDefinition>) -> Result<()> {
        let durable = Arc::clone(&self.durable);
        ctx.on_prepare_undoable(move || {
            let previous = durable.view_record(&view.name)?;
            durable.upsert_view(&view)?;
            Ok(restore_view_record(durable, view.name.clone(), previous))
        })
    }

    /// Re-reads `db`'s durable view records and publishes the result. Loading
    /// stops at the first invalid record; the valid prefix is kept and the
    /// set is marked invalid, which makes validated lookups fail.
    pub fn reload_views(&self, ctx: &OpContext, db: &DatabaseName) -> Result<ViewReload> {
        let (views, reload) = self.load_durable_views(db)?;
        let target = db.clone();
        let publish = move |version: &mut CatalogVersion| {
            version.replace_views(target, views);
            Ok(())
        };
        if ctx.in_unit() {
            self.manager.write_on_commit(ctx, publish)?;
        } else {
            self.manager.write(publish)?;
        }
        Ok(reload)
    }

    /// Schedules a reload of `db`'s views for when `ctx`'s unit commits,
    /// after someone wrote `system.views` directly.
    pub fn on_durable_views_changed(&self, ctx: &OpContext, db: &DatabaseName) -> Result<()> {
        let catalog = self.clone();
        let db = db.clone();
        ctx.on_commit(move |_| {
            let ctx = OpContext::new();
            match catalog.reload_views(&ctx, &db) {
                Ok(reload) if !reload.is_complete() => {
                    warn!(db = %db, loaded = reload.loaded.len(), "catalog.views.reload_incomplete");
                }
                Ok(_) => {}
                Err(err) => warn!(db = %db, error = %err, "catalog.views.reload_failed"),
            }
        })
    }

    /// Loads `db`'s views the first time the database is opened. The load is
    /// published immediately, even inside a write unit.
    pub fn open_database(&self, ctx: &OpContext, db: &DatabaseName) -> Result<Option<ViewReload>> {
        if self.manager.current(ctx).views().is_loaded(db)
            || self.manager.latest().views().is_loaded(db)
        {
            return Ok(None);
        }
        let (views, reload) = self.load_durable_views(db)?;
        let target = db.clone();
        self.manager.write(move |version| {
            // Someone else may have loaded it meanwhile.
            if !version.views().is_loaded(&target) {
                version.replace_views(target, views);
            }
            Ok(())
        })?;
        Ok(Some(reload))
    }

    fn load_durable_views(&self, db: &DatabaseName) -> Result<(ViewsForDatabase, ViewReload)> {
        let records = self.durable.load_views(db)?;
        let loaded = ViewsForDatabase::load(db, &records, &self.options.view_validator);
        debug!(db = %db, records = records.len(), complete = loaded.1.is_complete(), "catalog.views.load");
        Ok(loaded)
    }

    /// View named `name`; fails when `db`'s view set is invalid.
    pub fn lookup_view(&self, ctx: &OpContext, name: &Namespace) -> Result<Option<Arc<ViewDefinition>>> {
        match self.staged(ctx, |updates| updates.lookup_view(name)) {
            Staged::Present(view) => Ok(Some(view)),
            Staged::Removed => Ok(None),
            Staged::Untouched => self.manager.current(ctx).views().lookup(name),
        }
    }

    /// View named `name`, even from an invalid view set.
    pub fn lookup_view_without_validating(
        &self,
        ctx: &OpContext,
        name: &Namespace,
    ) -> Option<Arc<ViewDefinition>> {
        match self.staged(ctx, |updates| updates.lookup_view(name)) {
            Staged::Present(view) => Some(view),
            Staged::Removed => None,
            Staged::Untouched => self
                .manager
                .current(ctx)
                .views()
                .lookup_without_validating(name),
        }
    }

    /// Views of `db` in namespace order, with this context's uncommitted
    /// view changes applied.
    pub fn iterate_views(&self, ctx: &OpContext, db: &DatabaseName) -> Result<Vec<Arc<ViewDefinition>>> {
        let version = self.manager.current(ctx);
        let mut views: BTreeMap<Namespace, Arc<ViewDefinition>> =
            match version.views().database(db) {
                Some(set) if !set.is_valid() => {
                    return Err(CatalogError::InvalidViewDefinition(format!(
                        "views of database {db} are invalid"
                    )))
                }
                Some(set) => set
                    .iter()
                    .map(|view| (view.name.clone(), Arc::clone(view)))
                    .collect(),
                None => BTreeMap::new(),
            };
        for (name, staged) in ctx.peek(|updates| updates.views_in(db)).unwrap_or_default() {
            match staged {
                Some(view) => views.insert(name, view),
                None => views.remove(&name),
            };
        }
        Ok(views.into_values().collect())
    }

    /// View counters of `db`.
    pub fn view_stats(&self, ctx: &OpContext, db: &DatabaseName) -> Option<ViewStats> {
        self.manager.current(ctx).views().stats(db)
    }

    /// Databases with a loaded view set.
    pub fn view_database_names(&self, ctx: &OpContext) -> Vec<DatabaseName> {
        self.manager.current(ctx).views().database_names()
    }

    /// Forgets `db`'s views when the database closes.
    pub fn clear_views(&self, ctx: &OpContext, db: &DatabaseName) -> Result<()> {
        if !ctx.has_database_exclusive(db) {
            return Err(CatalogError::invariant(format!(
                "clearing views of {db} requires an exclusive database claim"
            )));
        }
        let db = db.clone();
        self.manager.write(move |version| {
            version.views_mut().clear_database(&db);
            Ok(())
        })
    }

    // ---- profiling -----------------------------------------------------

    /// Profiling settings of `db`, or the configured default.
    pub fn profile_settings(&self, ctx: &OpContext, db: &DatabaseName) -> ProfileSettings {
        self.manager
            .current(ctx)
            .views()
            .profile_settings(db, &self.options.default_profile)
    }

    /// Sets `db`'s profiling level and filter.
    pub fn set_profile_settings(
        &self,
        db: &DatabaseName,
        level: i32,
        filter: Option<Value>,
    ) -> Result<()> {
        let settings = ProfileSettings::new(level, filter.map(|f| Arc::new(ProfileFilter(f))))?;
        let db = db.clone();
        debug!(db = %db, level = settings.level(), "catalog.profile.set");
        self.manager.write(move |version| {
            version.views_mut().set_profile_settings(db, settings);
            Ok(())
        })
    }

    /// Replaces the filter of every database with explicit settings.
    pub fn set_all_profile_filters(&self, filter: Option<Value>) -> Result<()> {
        let filter = filter.map(|f| Arc::new(ProfileFilter(f)));
        self.manager.write(move |version| {
            version.views_mut().set_all_profile_filters(filter);
            Ok(())
        })
    }

    /// Reverts `db` to the default profiling settings.
    pub fn clear_profile_settings(&self, db: &DatabaseName) -> Result<()> {
        let db = db.clone();
        self.manager.write(move |version| {
            version.views_mut().clear_profile_settings(&db);
            Ok(())
        })
    }

    // ---- lifecycle -----------------------------------------------------

    /// Enters the closed state ahead of a storage-engine restart.
    pub fn on_close_catalog(&self, ctx: &OpContext) -> Result<()> {
        self.manager.on_close_catalog(ctx)
    }

    /// Leaves the closed state and bumps the epoch.
    pub fn on_open_catalog(&self, ctx: &OpContext) -> Result<()> {
        self.manager.on_open_catalog(ctx)
    }

    /// Close/reopen counter.
    pub fn epoch(&self) -> u64 {
        self.manager.epoch()
    }

    /// Removes every collection and view, e.g. at shutdown.
    pub fn deregister_all(&self, ctx: &OpContext) -> Result<()> {
        ctx.require_global_exclusive("deregistering all collections")?;
        self.manager.write(|version| {
            version.deregister_all();
            Ok(())
        })
    }

    /// Replaces the registry with what `durable` holds at `stable`. Views of
    /// databases that were loaded are reloaded.
    pub fn reload_from_durable(&self, ctx: &OpContext, stable: Option<Timestamp>) -> Result<()> {
        ctx.require_global_exclusive("reloading the catalog")?;
        let entries = self.durable.list_at(stable)?;
        let loaded = self.manager.latest().views().database_names();
        let count = entries.len();
        self.manager.write(move |version| {
            version.deregister_all();
            for entry in &entries {
                version
                    .register_collection(Arc::new(Collection::from_durable(entry, None)), None)?;
            }
            Ok(())
        })?;
        for db in &loaded {
            let reload = self.reload_views(ctx, db)?;
            if !reload.is_complete() {
                warn!(db = %db, loaded = reload.loaded.len(), "catalog.views.reload_incomplete");
            }
        }
        info!(collections = count, stable = ?stable, "catalog.reload_from_durable");
        Ok(())
    }

    /// Full storage-engine restart: close, reload from durable at `stable`,
    /// reopen, and re-base history on `stable`.
    pub fn reopen(&self, ctx: &OpContext, stable: Option<Timestamp>) -> Result<()> {
        self.on_close_catalog(ctx)?;
        self.reload_from_durable(ctx, stable)?;
        self.on_open_catalog(ctx)?;
        self.manager
            .cleanup_for_catalog_reopen(stable.unwrap_or(Timestamp::MIN))
    }

    /// Live drop-pending collection stored under `ident`.
    pub fn find_drop_pending_collection(&self, ident: &Ident) -> Option<Arc<Collection>> {
        self.manager.latest().drop_pending().find_collection(ident)
    }

    /// Live drop-pending index stored under `ident`.
    pub fn find_drop_pending_index(&self, ident: &Ident) -> Option<Arc<IndexEntry>> {
        self.manager.latest().drop_pending().find_index(ident)
    }

    /// Forgets `ident` once its storage has been reclaimed. Returns whether
    /// anything was tracked under it.
    pub fn notify_ident_dropped(&self, ident: &Ident) -> Result<bool> {
        let ident = ident.clone();
        let removed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&removed);
        self.manager.write(move |version| {
            flag.store(version.notify_ident_dropped(&ident), Ordering::Release);
            Ok(())
        })?;
        Ok(removed.load(Ordering::Acquire))
    }

    /// O(1) check whether history can be pruned at `oldest`.
    pub fn needs_cleanup_for_oldest_timestamp(&self, oldest: Timestamp) -> bool {
        self.manager.needs_cleanup_for_oldest_timestamp(oldest)
    }

    /// Prunes history no reader at or after `oldest` can need.
    pub fn cleanup_for_oldest_timestamp(&self, oldest: Timestamp) -> Result<usize> {
        self.manager.cleanup_for_oldest_timestamp(oldest)
    }
}

fn restore_view_record(
    durable: Arc<dyn DurableCatalog>,
    name: Namespace,
    previous: Option<Value>,
) -> PrepareUndo {
    Box::new(move || {
        if let Err(err) = durable.restore_view_record(&name, previous) {
            warn!(view = %name, error = %err, "catalog.views.restore_failed");
        }
    })
}
