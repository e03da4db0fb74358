use std::sync::{Arc, Weak};

use imbl::HashMap;
use tracing::trace;

use crate::catalog::collection::{Collection, IndexEntry};
use crate::types::Ident;

/// Handles whose drop committed but whose storage has not been reclaimed.
///
/// Only weak references are kept; whoever schedules the physical removal
/// owns the handle. Once that owner lets go, or the removal is reported
/// through [`DropPendingTracker::notify_removed`], lookups return `None`.
/// Dead entries are dropped whenever the tracker changes.
#[derive(Clone, Debug, Default)]
pub struct DropPendingTracker {
    collections: HashMap<Ident, Weak<Collection>>,
    indexes: HashMap<Ident, Weak<IndexEntry>>,
}

impl DropPendingTracker {
    /// Starts tracking a dropped collection under its storage ident.
    pub fn track_collection(&mut self, collection: &Arc<Collection>) {
        trace!(ident = %collection.ident(), "catalog.drop_pending.collection");
        self.purge_dead();
        self.collections
            .insert(collection.ident().clone(), Arc::downgrade(collection));
    }

    /// Starts tracking a dropped index under its storage ident.
    pub fn track_index(&mut self, index: &Arc<IndexEntry>) {
        trace!(ident = %index.ident, "catalog.drop_pending.index");
        self.purge_dead();
        self.indexes
            .insert(index.ident.clone(), Arc::downgrade(index));
    }

    /// Returns the collection for `ident` if it is still alive.
    pub fn find_collection(&self, ident: &Ident) -> Option<Arc<Collection>> {
        self.collections.get(ident).and_then(Weak::upgrade)
    }

    /// Returns the index entry for `ident` if it is still alive.
    pub fn find_index(&self, ident: &Ident) -> Option<Arc<IndexEntry>> {
        self.indexes.get(ident).and_then(Weak::upgrade)
    }

    /// Forgets `ident`. Returns whether anything was tracked under it.
    pub fn notify_removed(&mut self, ident: &Ident) -> bool {
        let collection = self.collections.remove(ident).is_some();
        let index = self.indexes.remove(ident).is_some();
        self.purge_dead();
        collection || index
    }

    /// Drops entries whose referent is already gone.
    pub fn purge_dead(&mut self) -> usize {
        let before = self.len();
        self.collections.retain(|_, weak| weak.strong_count() > 0);
        self.indexes.retain(|_, weak| weak.strong_count() > 0);
        before - self.len()
    }

    /// Number of tracked idents, live or not.
    pub fn len(&self) -> usize {
        self.collections.len() + self.indexes.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
