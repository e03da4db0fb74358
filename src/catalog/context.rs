//! Caller context: transaction identity, lock claims, read snapshot, and the
//! open write unit.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::catalog::collection::Collection;
use crate::catalog::manager::{VersionManager, WriteJob};
use crate::catalog::uncommitted::UncommittedUpdates;
use crate::catalog::version::CatalogVersion;
use crate::types::{CatalogError, CollectionRef, DatabaseName, Namespace, Result, Timestamp, TxnId};

/// Lockable resources, coarsest first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LockResource {
    /// The whole server.
    Global,
    /// One database.
    Database(DatabaseName),
    /// One collection or view namespace.
    Collection(Namespace),
}

/// Lock modes granted by the external lock manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Intent to read below this resource.
    IntentShared,
    /// Intent to write below this resource.
    IntentExclusive,
    /// Shared access to the resource.
    Shared,
    /// Exclusive access to the resource.
    Exclusive,
}

impl LockMode {
    /// Whether holding `self` satisfies a requirement for `wanted`.
    pub fn covers(self, wanted: LockMode) -> bool {
        match self {
            LockMode::Exclusive => true,
            LockMode::Shared => matches!(wanted, LockMode::Shared | LockMode::IntentShared),
            LockMode::IntentExclusive => {
                matches!(wanted, LockMode::IntentExclusive | LockMode::IntentShared)
            }
            LockMode::IntentShared => wanted == LockMode::IntentShared,
        }
    }
}

type ResolveKey = (CollectionRef, Option<Timestamp>);

#[derive(Default)]
struct SnapshotState {
    open: bool,
    read_ts: Option<Timestamp>,
    stashed: Option<Arc<CatalogVersion>>,
    resolved: HashMap<ResolveKey, Option<Arc<Collection>>>,
}

type CommitHandler = Box<dyn FnOnce(Option<Timestamp>) + Send>;
type RollbackHandler = Box<dyn FnOnce() + Send>;
type PrepareHandler = Box<dyn FnOnce() -> Result<Option<PrepareUndo>> + Send>;

/// Reverts the external effect of a prepare step that ran before the unit
/// failed to publish.
pub type PrepareUndo = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct UnitState {
    prepare: Vec<PrepareHandler>,
    on_commit: Vec<CommitHandler>,
    on_rollback: Vec<RollbackHandler>,
    catalog_jobs: Vec<WriteJob>,
    publisher: Option<VersionManager>,
    updates: UncommittedUpdates,
}

impl UnitState {
    fn bind(&mut self, manager: &VersionManager) -> Result<()> {
        match &self.publisher {
            Some(bound) if !bound.same_as(manager) => Err(CatalogError::invariant(
                "write unit already publishes to another catalog",
            )),
            Some(_) => Ok(()),
            None => {
                self.publisher = Some(manager.clone());
                Ok(())
            }
        }
    }
}

/// Per-operation state the catalog reads from its caller.
///
/// Lock claims are recorded by the caller after the external lock manager
/// grants them; the catalog only checks them. The snapshot fields mirror the
/// storage engine's open read transaction.
pub struct OpContext {
    txn: TxnId,
    claims: Mutex<HashMap<LockResource, LockMode>>,
    snapshot: Mutex<SnapshotState>,
    unit: Mutex<Option<UnitState>>,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("txn", &self.txn)
            .field("in_unit", &self.in_unit())
            .finish()
    }
}

impl OpContext {
    /// Creates a context with a fresh transaction id.
    pub fn new() -> Self {
        Self {
            txn: TxnId::next(),
            claims: Mutex::new(HashMap::new()),
            snapshot: Mutex::new(SnapshotState::default()),
            unit: Mutex::new(None),
        }
    }

    /// Transaction id.
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    /// Records a claim granted by the lock manager.
    pub fn claim(&self, resource: LockResource, mode: LockMode) {
        let mut claims = self.claims.lock();
        let held = claims.entry(resource).or_insert(mode);
        if mode > *held {
            *held = mode;
        }
    }

    /// Builder-style [`OpContext::claim`].
    pub fn with_claim(self, resource: LockResource, mode: LockMode) -> Self {
        self.claim(resource, mode);
        self
    }

    /// Drops a claim.
    pub fn release(&self, resource: &LockResource) {
        self.claims.lock().remove(resource);
    }

    fn holds(&self, resource: &LockResource, wanted: LockMode) -> bool {
        self.claims
            .lock()
            .get(resource)
            .is_some_and(|held| held.covers(wanted))
    }

    /// Whether the global resource is held exclusively.
    pub fn has_global_exclusive(&self) -> bool {
        self.holds(&LockResource::Global, LockMode::Exclusive)
    }

    /// Whether `db` is held exclusively, directly or through the global
    /// resource.
    pub fn has_database_exclusive(&self, db: &DatabaseName) -> bool {
        self.has_global_exclusive()
            || self.holds(&LockResource::Database(db.clone()), LockMode::Exclusive)
    }

    /// Whether `namespace` is covered by a claim of at least `wanted`,
    /// directly or through an exclusive database or global claim.
    pub fn has_claim_on(&self, namespace: &Namespace, wanted: LockMode) -> bool {
        self.has_global_exclusive()
            || self.holds(
                &LockResource::Database(namespace.db().clone()),
                LockMode::Exclusive,
            )
            || self.holds(&LockResource::Collection(namespace.clone()), wanted)
    }

    pub(crate) fn require_claim(&self, namespace: &Namespace, wanted: LockMode) -> Result<()> {
        if self.has_claim_on(namespace, wanted) {
            return Ok(());
        }
        Err(CatalogError::invariant(format!(
            "{} requires {wanted:?} on {namespace}",
            self.txn
        )))
    }

    pub(crate) fn require_global_exclusive(&self, operation: &str) -> Result<()> {
        if self.has_global_exclusive() {
            return Ok(());
        }
        Err(CatalogError::invariant(format!(
            "{operation} requires an exclusive global claim"
        )))
    }

    /// Opens a read snapshot at `read_ts` (`None` reads the latest data).
    pub fn open_snapshot(&self, read_ts: Option<Timestamp>) {
        let mut snapshot = self.snapshot.lock();
        snapshot.open = true;
        snapshot.read_ts = read_ts;
    }

    /// Closes the snapshot, releasing the stashed version and resolved
    /// handles.
    pub fn close_snapshot(&self) {
        *self.snapshot.lock() = SnapshotState::default();
    }

    /// Whether a read snapshot is open.
    pub fn has_open_snapshot(&self) -> bool {
        self.snapshot.lock().open
    }

    /// Read timestamp of the open snapshot.
    pub fn read_timestamp(&self) -> Option<Timestamp> {
        let snapshot = self.snapshot.lock();
        snapshot.read_ts.filter(|_| snapshot.open)
    }

    /// Version pinned on this context, if any.
    pub fn stashed(&self) -> Option<Arc<CatalogVersion>> {
        self.snapshot.lock().stashed.clone()
    }

    pub(crate) fn stash(&self, version: Arc<CatalogVersion>) {
        self.snapshot.lock().stashed = Some(version);
    }

    /// Unpins the stashed version and forgets resolved handles.
    pub fn reset_stash(&self) {
        let mut snapshot = self.snapshot.lock();
        snapshot.stashed = None;
        snapshot.resolved.clear();
    }

    pub(crate) fn resolved(&self, key: &ResolveKey) -> Option<Option<Arc<Collection>>> {
        self.snapshot.lock().resolved.get(key).cloned()
    }

    pub(crate) fn remember_resolved(&self, key: ResolveKey, value: Option<Arc<Collection>>) {
        let mut snapshot = self.snapshot.lock();
        if snapshot.open {
            snapshot.resolved.insert(key, value);
        }
    }

    /// Starts a write unit. Only one unit may be open at a time.
    pub fn begin_unit(&self) -> Result<WriteUnit<'_>> {
        let mut unit = self.unit.lock();
        if unit.is_some() {
            return Err(CatalogError::invariant(format!(
                "{} already has an open write unit",
                self.txn
            )));
        }
        *unit = Some(UnitState::default());
        Ok(WriteUnit {
            ctx: self,
            finished: false,
        })
    }

    /// Whether a write unit is open.
    pub fn in_unit(&self) -> bool {
        self.unit.lock().is_some()
    }

    fn with_unit<R>(&self, f: impl FnOnce(&mut UnitState) -> Result<R>) -> Result<R> {
        let mut unit = self.unit.lock();
        let state = unit.as_mut().ok_or_else(|| {
            CatalogError::invariant(format!("{} has no open write unit", self.txn))
        })?;
        f(state)
    }

    /// Registers a handler run after the unit's catalog changes publish.
    pub fn on_commit(&self, handler: impl FnOnce(Option<Timestamp>) + Send + 'static) -> Result<()> {
        self.with_unit(|state| {
            state.on_commit.push(Box::new(handler));
            Ok(())
        })
    }

    /// Registers a handler run if the unit does not commit.
    pub fn on_rollback(&self, handler: impl FnOnce() + Send + 'static) -> Result<()> {
        self.with_unit(|state| {
            state.on_rollback.push(Box::new(handler));
            Ok(())
        })
    }

    /// Registers a fallible step run at commit before anything publishes.
    /// Its failure rolls the unit back.
    pub fn on_prepare(&self, step: impl FnOnce() -> Result<()> + Send + 'static) -> Result<()> {
        self.with_unit(|state| {
            state.prepare.push(Box::new(move || step().map(|()| None)));
            Ok(())
        })
    }

    /// Like [`OpContext::on_prepare`], for steps with effects outside the
    /// catalog. The returned undo runs if a later step or the publication
    /// fails; undos run in reverse order before the rollback handlers.
    pub fn on_prepare_undoable(
        &self,
        step: impl FnOnce() -> Result<PrepareUndo> + Send + 'static,
    ) -> Result<()> {
        self.with_unit(|state| {
            state.prepare.push(Box::new(move || step().map(Some)));
            Ok(())
        })
    }

    pub(crate) fn push_catalog_job(&self, manager: &VersionManager, job: WriteJob) -> Result<()> {
        self.with_unit(|state| {
            state.bind(manager)?;
            state.catalog_jobs.push(job);
            Ok(())
        })
    }

    /// Runs `f` against this unit's staged catalog changes.
    pub(crate) fn stage<R>(
        &self,
        manager: &VersionManager,
        f: impl FnOnce(&mut UncommittedUpdates) -> Result<R>,
    ) -> Result<R> {
        self.with_unit(|state| {
            state.bind(manager)?;
            f(&mut state.updates)
        })
    }

    /// Reads staged changes; `None` when no unit is open.
    pub(crate) fn peek<R>(&self, f: impl FnOnce(&UncommittedUpdates) -> R) -> Option<R> {
        self.unit.lock().as_ref().map(|state| f(&state.updates))
    }

    fn take_unit(&self) -> Option<UnitState> {
        self.unit.lock().take()
    }
}

/// RAII write unit. Dropping it without [`WriteUnit::commit`] rolls back.
#[must_use = "dropping a write unit rolls it back"]
pub struct WriteUnit<'a> {
    ctx: &'a OpContext,
    finished: bool,
}

impl WriteUnit<'_> {
    /// Commits at `ts`: runs prepare steps, publishes staged catalog changes
    /// as one version, then runs commit handlers in registration order. Any
    /// failure before publication rolls the unit back and is returned.
    pub fn commit(mut self, ts: Option<Timestamp>) -> Result<()> {
        self.finished = true;
        let Some(mut state) = self.ctx.take_unit() else {
            return Err(CatalogError::invariant("write unit state vanished"));
        };
        let mut undos = Vec::new();
        let prepared = std::mem::take(&mut state.prepare)
            .into_iter()
            .try_for_each(|step| -> Result<()> {
                undos.extend(step()?);
                Ok(())
            });
        let published = prepared.and_then(|()| Self::publish(self.ctx.txn, &mut state, ts));
        if let Err(err) = published {
            warn!(txn = %self.ctx.txn, error = %err, undos = undos.len(), "catalog.unit.commit_failed");
            for undo in undos.into_iter().rev() {
                undo();
            }
            Self::run_rollback(state);
            self.ctx.reset_stash();
            return Err(err);
        }
        debug!(txn = %self.ctx.txn, ts = ?ts, "catalog.unit.commit");
        for handler in state.on_commit {
            handler(ts);
        }
        self.ctx.reset_stash();
        Ok(())
    }

    /// Rolls back explicitly.
    pub fn rollback(mut self) {
        self.finished = true;
        if let Some(state) = self.ctx.take_unit() {
            Self::run_rollback(state);
        }
        self.ctx.reset_stash();
    }

    fn publish(txn: TxnId, state: &mut UnitState, ts: Option<Timestamp>) -> Result<()> {
        let updates = std::mem::take(&mut state.updates);
        let jobs = std::mem::take(&mut state.catalog_jobs);
        if updates.is_empty() && jobs.is_empty() {
            return Ok(());
        }
        let Some(manager) = state.publisher.clone() else {
            return Err(CatalogError::invariant("staged catalog changes without a catalog"));
        };
        manager.write(move |version| {
            updates.apply(version, txn, ts)?;
            for job in jobs {
                job(version)?;
            }
            Ok(())
        })
    }

    fn run_rollback(state: UnitState) {
        for handler in state.on_rollback.into_iter().rev() {
            handler();
        }
    }
}

impl Drop for WriteUnit<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(state) = self.ctx.take_unit() {
            debug!(txn = %self.ctx.txn, "catalog.unit.rollback");
            Self::run_rollback(state);
        }
        self.ctx.reset_stash();
    }
}
