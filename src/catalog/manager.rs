//! Latest-version register and the copy-on-write write protocol.
//!
//! Readers load the latest [`CatalogVersion`] with one atomic pointer load.
//! Writers enqueue jobs; the first writer to find the queue idle becomes the
//! leader, drains every queued job onto one clone of the latest version, and
//! publishes the result with a single swap. Each job runs against its own
//! scratch copy of the batch clone so a failing job leaves no trace.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace};

use crate::catalog::context::OpContext;
use crate::catalog::metrics::{default_metrics, CatalogMetrics};
use crate::catalog::version::CatalogVersion;
use crate::types::{CatalogError, Result, Timestamp};

/// A catalog mutation. Jobs must not block: co-batched writers wait on them.
pub type WriteJob = Box<dyn FnOnce(&mut CatalogVersion) -> Result<()> + Send>;

#[derive(Default)]
struct Slot {
    result: Mutex<Option<Result<()>>>,
    ready: Condvar,
}

impl Slot {
    fn complete(&self, result: Result<()>) {
        *self.result.lock() = Some(result);
        self.ready.notify_one();
    }

    fn wait(&self) -> Result<()> {
        let mut result = self.result.lock();
        loop {
            if let Some(result) = result.take() {
                return result;
            }
            self.ready.wait(&mut result);
        }
    }
}

struct Queued {
    job: WriteJob,
    slot: Arc<Slot>,
}

#[derive(Default)]
struct JobQueue {
    jobs: Vec<Queued>,
    leader_active: bool,
}

struct BatchSession {
    owner: ThreadId,
    base: Arc<CatalogVersion>,
    instance: Arc<CatalogVersion>,
}

struct ManagerInner {
    latest: ArcSwap<CatalogVersion>,
    queue: Mutex<JobQueue>,
    batch: Mutex<Option<BatchSession>>,
    // Set while `batch` holds a session; readers skip the lock otherwise.
    batch_active: AtomicBool,
    // Serializes publication between the queue leader and batch sessions.
    publish: Mutex<()>,
    generation: AtomicU64,
    metrics: Arc<dyn CatalogMetrics>,
}

/// Process-wide holder of the latest catalog version.
#[derive(Clone)]
pub struct VersionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionManager")
            .field("generation", &self.generation())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new(CatalogVersion::default())
    }
}

fn apply_isolated(working: &mut CatalogVersion, job: WriteJob) -> Result<()> {
    let mut scratch = working.clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        job(&mut scratch).map(|()| scratch)
    }));
    match outcome {
        Ok(Ok(scratch)) => {
            *working = scratch;
            Ok(())
        }
        Ok(Err(err)) => Err(err),
        Err(_) => Err(CatalogError::invariant("catalog write job panicked")),
    }
}

impl VersionManager {
    /// Starts with `initial` as the latest version.
    pub fn new(initial: CatalogVersion) -> Self {
        Self::with_metrics(initial, default_metrics())
    }

    /// Starts with `initial` and reports to `metrics`.
    pub fn with_metrics(initial: CatalogVersion, metrics: Arc<dyn CatalogMetrics>) -> Self {
        let generation = initial.generation();
        Self {
            inner: Arc::new(ManagerInner {
                latest: ArcSwap::from_pointee(initial),
                queue: Mutex::new(JobQueue::default()),
                batch: Mutex::new(None),
                batch_active: AtomicBool::new(false),
                publish: Mutex::new(()),
                generation: AtomicU64::new(generation),
                metrics,
            }),
        }
    }

    pub(crate) fn same_as(&self, other: &VersionManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn CatalogMetrics> {
        &self.inner.metrics
    }

    /// The absolute latest version, ignoring stashes and batch sessions.
    pub fn latest(&self) -> Arc<CatalogVersion> {
        self.inner.latest.load_full()
    }

    /// The version `ctx` should read: its stashed version, the in-progress
    /// batch clone when `ctx`'s thread owns the batch session, or the latest
    /// version, which is stashed when `ctx` has an open snapshot so repeated
    /// calls agree.
    pub fn current(&self, ctx: &OpContext) -> Arc<CatalogVersion> {
        if let Some(stashed) = ctx.stashed() {
            return stashed;
        }
        if let Some(instance) = self.batch_instance() {
            return instance;
        }
        let latest = self.latest();
        if ctx.has_open_snapshot() {
            ctx.stash(Arc::clone(&latest));
        }
        latest
    }

    /// Pins `version` on `ctx` until [`OpContext::reset_stash`].
    pub fn stash(&self, ctx: &OpContext, version: Arc<CatalogVersion>) {
        ctx.stash(version);
    }

    /// Number of versions published so far.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Close/reopen counter of the latest version.
    pub fn epoch(&self) -> u64 {
        self.latest().epoch()
    }

    fn batch_instance(&self) -> Option<Arc<CatalogVersion>> {
        if !self.inner.batch_active.load(Ordering::Acquire) {
            return None;
        }
        let me = thread::current().id();
        self.inner
            .batch
            .lock()
            .as_ref()
            .filter(|session| session.owner == me)
            .map(|session| Arc::clone(&session.instance))
    }

    /// Applies `job` and publishes the result.
    ///
    /// Jobs submitted while another writer is publishing are folded into the
    /// next version together. A failing job affects only its own caller.
    pub fn write<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut CatalogVersion) -> Result<()> + Send + 'static,
    {
        let job: WriteJob = Box::new(job);
        self.write_batch(vec![job])
            .pop()
            .unwrap_or_else(|| Err(CatalogError::invariant("write job lost")))
    }

    /// Applies several jobs that land in the same published version. Results
    /// are returned in submission order.
    pub fn write_batch(&self, mut jobs: Vec<WriteJob>) -> Vec<Result<()>> {
        if jobs.is_empty() {
            return Vec::new();
        }
        if let Some(results) = self.try_session(&mut jobs) {
            return results;
        }
        let slots: Vec<Arc<Slot>> = jobs.iter().map(|_| Arc::new(Slot::default())).collect();
        let lead = {
            let mut queue = self.inner.queue.lock();
            queue.jobs.extend(
                jobs.into_iter()
                    .zip(slots.iter())
                    .map(|(job, slot)| Queued {
                        job,
                        slot: Arc::clone(slot),
                    }),
            );
            !std::mem::replace(&mut queue.leader_active, true)
        };
        if lead {
            self.drain();
        }
        slots.iter().map(|slot| slot.wait()).collect()
    }

    fn try_session(&self, jobs: &mut Vec<WriteJob>) -> Option<Vec<Result<()>>> {
        if !self.inner.batch_active.load(Ordering::Acquire) {
            return None;
        }
        let me = thread::current().id();
        let mut batch = self.inner.batch.lock();
        let session = batch.as_mut().filter(|session| session.owner == me)?;
        let instance = Arc::make_mut(&mut session.instance);
        let results = jobs
            .drain(..)
            .map(|job| {
                let result = apply_isolated(instance, job);
                if result.is_err() {
                    self.inner.metrics.write_job_failed();
                }
                result
            })
            .collect();
        Some(results)
    }

    fn drain(&self) {
        loop {
            let jobs = {
                let mut queue = self.inner.queue.lock();
                if queue.jobs.is_empty() {
                    queue.leader_active = false;
                    return;
                }
                std::mem::take(&mut queue.jobs)
            };
            self.apply_and_publish(jobs);
        }
    }

    fn apply_and_publish(&self, jobs: Vec<Queued>) {
        let _publish = self.inner.publish.lock();
        let base = self.latest();
        let mut working = CatalogVersion::clone(&base);
        let mut applied = 0usize;
        let mut completions = Vec::with_capacity(jobs.len());
        for Queued { job, slot } in jobs {
            let result = apply_isolated(&mut working, job);
            match &result {
                Ok(()) => applied += 1,
                Err(err) => {
                    self.inner.metrics.write_job_failed();
                    debug!(error = %err, "catalog.write.job_failed");
                }
            }
            completions.push((slot, result));
        }
        if applied > 0 {
            self.publish(working, applied);
        }
        for (slot, result) in completions {
            slot.complete(result);
        }
    }

    fn publish(&self, mut version: CatalogVersion, jobs: usize) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        version.set_generation(generation);
        self.inner.latest.store(Arc::new(version));
        self.inner.metrics.version_published(jobs);
        trace!(generation, jobs, "catalog.write.publish");
    }

    /// Registers `job` on `ctx`'s open write unit. It runs when the unit
    /// commits, in the same published version as the unit's other catalog
    /// changes, and never runs on rollback.
    pub fn write_on_commit<F>(&self, ctx: &OpContext, job: F) -> Result<()>
    where
        F: FnOnce(&mut CatalogVersion) -> Result<()> + Send + 'static,
    {
        ctx.push_catalog_job(self, Box::new(job))
    }

    fn begin_session(&self, ctx: &OpContext) -> Result<()> {
        ctx.require_global_exclusive("batched catalog writer")?;
        let mut batch = self.inner.batch.lock();
        if batch.is_some() {
            return Err(CatalogError::invariant("a batched catalog writer is already active"));
        }
        let base = self.latest();
        *batch = Some(BatchSession {
            owner: thread::current().id(),
            instance: Arc::clone(&base),
            base,
        });
        self.inner.batch_active.store(true, Ordering::Release);
        debug!(generation = self.generation(), "catalog.batch.begin");
        Ok(())
    }

    fn finish_session(&self) -> Result<()> {
        let Some(session) = self.inner.batch.lock().take() else {
            return Ok(());
        };
        self.inner.batch_active.store(false, Ordering::Release);
        let _publish = self.inner.publish.lock();
        if !Arc::ptr_eq(&self.latest(), &session.base) {
            return Err(CatalogError::invariant(
                "catalog was published while a batched writer was active",
            ));
        }
        if Arc::ptr_eq(&session.instance, &session.base) {
            return Ok(());
        }
        let version = Arc::unwrap_or_clone(session.instance);
        self.publish(version, 1);
        debug!(generation = self.generation(), "catalog.batch.finish");
        Ok(())
    }

    /// Enters the closed state. Requires an exclusive global claim.
    pub fn on_close_catalog(&self, ctx: &OpContext) -> Result<()> {
        ctx.require_global_exclusive("closing the catalog")?;
        self.write(|version| version.close())
    }

    /// Leaves the closed state and bumps the epoch. Requires an exclusive
    /// global claim.
    pub fn on_open_catalog(&self, ctx: &OpContext) -> Result<()> {
        ctx.require_global_exclusive("opening the catalog")?;
        self.write(|version| version.open())
    }

    /// O(1) check against the latest version's cleanup watermark.
    pub fn needs_cleanup_for_oldest_timestamp(&self, oldest: Timestamp) -> bool {
        self.latest().needs_cleanup(oldest)
    }

    /// Prunes history the oldest reader can no longer need. Returns the
    /// number of entries removed.
    pub fn cleanup_for_oldest_timestamp(&self, oldest: Timestamp) -> Result<usize> {
        if !self.needs_cleanup_for_oldest_timestamp(oldest) {
            return Ok(0);
        }
        let pruned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pruned);
        self.write(move |version| {
            counter.store(version.cleanup(oldest), Ordering::Relaxed);
            Ok(())
        })?;
        let pruned = pruned.load(Ordering::Relaxed);
        self.inner.metrics.history_pruned(pruned);
        Ok(pruned)
    }

    /// Re-bases history after the catalog was reopened at `stable`.
    pub fn cleanup_for_catalog_reopen(&self, stable: Timestamp) -> Result<()> {
        info!(stable = %stable, "catalog.reopen.cleanup");
        self.write(move |version| version.reseed_history(stable))
    }
}

/// RAII batched-writer session.
///
/// While alive, every [`VersionManager::write`] from the owning thread
/// mutates one private clone instead of publishing. [`BatchedWriter::finish`]
/// (or drop) publishes that clone, failing if anyone else published in
/// between.
#[must_use = "dropping a batched writer publishes immediately"]
pub struct BatchedWriter {
    manager: VersionManager,
    finished: bool,
}

impl BatchedWriter {
    /// Opens a session. Requires an exclusive global claim on `ctx`.
    pub fn begin(manager: &VersionManager, ctx: &OpContext) -> Result<Self> {
        manager.begin_session(ctx)?;
        Ok(Self {
            manager: manager.clone(),
            finished: false,
        })
    }

    /// Publishes the session's clone.
    pub fn finish(mut self) -> Result<()> {
        self.finished = true;
        self.manager.finish_session()
    }
}

impl Drop for BatchedWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.manager.finish_session() {
            error!(error = %err, "catalog.batch.finish_failed");
        }
    }
}

/// Stashes a version on a context and unpins it on drop.
pub struct CatalogStasher<'a> {
    ctx: &'a OpContext,
}

impl<'a> CatalogStasher<'a> {
    /// Pins `version` on `ctx`.
    pub fn new(ctx: &'a OpContext, version: Arc<CatalogVersion>) -> Self {
        ctx.stash(version);
        Self { ctx }
    }

    /// Replaces the pinned version.
    pub fn stash(&self, version: Arc<CatalogVersion>) {
        self.ctx.stash(version);
    }
}

impl Drop for CatalogStasher<'_> {
    fn drop(&mut self) {
        self.ctx.reset_stash();
    }
}
