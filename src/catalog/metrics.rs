use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking catalog version churn and point-in-time resolution.
///
/// Implementations receive callbacks from the version manager and the
/// resolver. Callbacks run on hot paths and must not block.
pub trait CatalogMetrics: Send + Sync {
    /// Records publication of a new catalog version.
    ///
    /// # Parameters
    /// * `jobs` - Number of write jobs folded into the version.
    fn version_published(&self, jobs: usize);

    /// Records a write job that returned an error and was discarded.
    fn write_job_failed(&self);

    /// Records the outcome of a point-in-time history lookup.
    ///
    /// # Parameters
    /// * `outcome` - `"exists"`, `"not_exists"` or `"unknown"`.
    fn point_in_time(&self, outcome: &'static str);

    /// Records a fallback scan of the durable catalog.
    fn scan_fallback(&self);

    /// Records history entries removed by a cleanup pass.
    fn history_pruned(&self, entries: usize);
}

/// A no-op implementation of [`CatalogMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl CatalogMetrics for NoopMetrics {
    fn version_published(&self, _jobs: usize) {}
    fn write_job_failed(&self) {}
    fn point_in_time(&self, _outcome: &'static str) {}
    fn scan_fallback(&self) {}
    fn history_pruned(&self, _entries: usize) {}
}

/// Atomic counters for every [`CatalogMetrics`] callback.
#[derive(Default)]
pub struct CounterMetrics {
    /// Versions published.
    pub versions_published: AtomicU64,

    /// Write jobs applied across all published versions.
    pub jobs_applied: AtomicU64,

    /// Write jobs that failed.
    pub jobs_failed: AtomicU64,

    /// Point-in-time lookups answered as existing.
    pub pit_exists: AtomicU64,

    /// Point-in-time lookups answered as not existing.
    pub pit_not_exists: AtomicU64,

    /// Point-in-time lookups history could not answer.
    pub pit_unknown: AtomicU64,

    /// Durable catalog scans.
    pub scans: AtomicU64,

    /// History entries pruned.
    pub history_pruned: AtomicU64,
}

impl CatalogMetrics for CounterMetrics {
    fn version_published(&self, jobs: usize) {
        self.versions_published.fetch_add(1, Ordering::Relaxed);
        self.jobs_applied.fetch_add(jobs as u64, Ordering::Relaxed);
    }

    fn write_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn point_in_time(&self, outcome: &'static str) {
        match outcome {
            "exists" => {
                self.pit_exists.fetch_add(1, Ordering::Relaxed);
            }
            "not_exists" => {
                self.pit_not_exists.fetch_add(1, Ordering::Relaxed);
            }
            "unknown" => {
                self.pit_unknown.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn scan_fallback(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    fn history_pruned(&self, entries: usize) {
        self.history_pruned
            .fetch_add(entries as u64, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
pub fn default_metrics() -> Arc<dyn CatalogMetrics> {
    Arc::new(NoopMetrics)
}
