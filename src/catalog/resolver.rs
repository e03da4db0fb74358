//! Point-in-time collection lookups.
//!
//! History answers most historical lookups on its own. When it cannot, the
//! durable catalog is scanned at the read timestamp. Either way the durable
//! record is turned into a handle that shares as much state as possible with
//! handles the catalog already holds.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::catalog::collection::{Collection, Compatibility};
use crate::catalog::context::OpContext;
use crate::catalog::durable::{DurableCatalog, DurableEntry};
use crate::catalog::history::Existence;
use crate::catalog::manager::VersionManager;
use crate::catalog::version::CatalogVersion;
use crate::types::{CollectionRef, Result, Timestamp};

/// Resolves collections as of a read timestamp.
pub struct PointInTimeResolver<'a> {
    manager: &'a VersionManager,
    durable: &'a dyn DurableCatalog,
    cache_scan_results: bool,
    reuse_drop_pending: bool,
}

impl<'a> PointInTimeResolver<'a> {
    /// Resolver over `manager`'s versions backed by `durable`.
    pub fn new(manager: &'a VersionManager, durable: &'a dyn DurableCatalog) -> Self {
        Self {
            manager,
            durable,
            cache_scan_results: true,
            reuse_drop_pending: true,
        }
    }

    /// Whether durable scan results are remembered in history.
    pub fn cache_scan_results(mut self, enabled: bool) -> Self {
        self.cache_scan_results = enabled;
        self
    }

    /// Whether drop-pending handles may answer historical lookups.
    pub fn reuse_drop_pending(mut self, enabled: bool) -> Self {
        self.reuse_drop_pending = enabled;
        self
    }

    /// Returns the collection `target` named at `read_ts`.
    ///
    /// Without a timestamp this is the latest mapping, pending two-phase
    /// registrations included. Results are memoised on `ctx` while its
    /// snapshot stays open.
    pub fn establish_consistent_collection(
        &self,
        ctx: &OpContext,
        target: &CollectionRef,
        read_ts: Option<Timestamp>,
    ) -> Result<Option<Arc<Collection>>> {
        let version = self.manager.current(ctx);
        let Some(ts) = read_ts else {
            return Ok(version.lookup_including_pending(target));
        };
        let key = (target.clone(), Some(ts));
        if let Some(memo) = ctx.resolved(&key) {
            return Ok(memo);
        }

        let existence = version.lookup_history(target, Some(ts));
        self.manager.metrics().point_in_time(existence.label());
        trace!(target = %target, ts = %ts, existence = existence.label(), "catalog.pit.lookup");
        let entry = match existence {
            Existence::NotExists => None,
            Existence::Exists(catalog_id) => {
                let entry = self.durable.fetch_at(catalog_id, Some(ts))?;
                if entry.is_none() {
                    warn!(target = %target, ts = %ts, catalog_id = %catalog_id, "catalog.pit.missing_record");
                }
                entry
            }
            Existence::Unknown => self.scan(target, ts)?,
        };
        let resolved = entry.and_then(|entry| self.build(&version, &entry, ts));
        ctx.remember_resolved(key, resolved.clone());
        Ok(resolved)
    }

    fn scan(&self, target: &CollectionRef, ts: Timestamp) -> Result<Option<DurableEntry>> {
        self.manager.metrics().scan_fallback();
        let found = self.durable.scan_at(target, Some(ts))?;
        debug!(target = %target, ts = %ts, found = found.is_some(), "catalog.pit.scan");
        if self.cache_scan_results {
            let mut keys = vec![target.clone()];
            if let Some(entry) = &found {
                keys.push(match target {
                    CollectionRef::Namespace(_) => CollectionRef::Id(entry.id),
                    CollectionRef::Id(_) => CollectionRef::Namespace(entry.namespace.clone()),
                });
            }
            let catalog_id = found.as_ref().map(|entry| entry.catalog_id);
            self.manager.write(move |version| {
                for key in &keys {
                    version.record_scan(key, ts, catalog_id);
                }
                Ok(())
            })?;
        }
        Ok(found)
    }

    fn build(
        &self,
        version: &CatalogVersion,
        entry: &DurableEntry,
        ts: Timestamp,
    ) -> Option<Arc<Collection>> {
        if let Some(handle) = version
            .lookup_by_id(entry.id)
            .and_then(|latest| share(&latest, entry, ts))
        {
            return Some(handle);
        }
        if self.reuse_drop_pending {
            if let Some(handle) = version
                .drop_pending()
                .find_collection(&entry.ident)
                .and_then(|pending| share(&pending, entry, ts))
            {
                trace!(ident = %entry.ident, "catalog.pit.drop_pending_reuse");
                return Some(handle);
            }
        }
        if self.durable.ident_exists(&entry.ident) {
            return Some(Arc::new(Collection::from_durable(entry, Some(ts))));
        }
        debug!(ident = %entry.ident, ts = %ts, "catalog.pit.ident_gone");
        None
    }
}

fn share(existing: &Arc<Collection>, entry: &DurableEntry, ts: Timestamp) -> Option<Arc<Collection>> {
    match existing.compatibility(entry, ts) {
        Compatibility::Identical => Some(Arc::clone(existing)),
        Compatibility::Adaptable => Some(Arc::new(existing.adapt(entry, ts))),
        Compatibility::Incompatible => None,
    }
}
