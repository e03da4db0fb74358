//! Catalog changes staged by one write unit.
//!
//! The owning context sees its own changes immediately; everyone else sees
//! them only once the unit commits and the combined publication job lands in
//! a new catalog version.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use crate::catalog::collection::{Collection, IndexEntry};
use crate::catalog::version::CatalogVersion;
use crate::catalog::views::ViewDefinition;
use crate::types::{CatalogError, CollectionId, DatabaseName, Namespace, Result, Timestamp, TxnId};

/// What the overlay knows about a key.
#[derive(Clone, Debug)]
pub(crate) enum Staged<T> {
    /// Created, renamed to, or edited in this unit.
    Present(T),
    /// Dropped or renamed away in this unit.
    Removed,
    /// Not touched; consult the catalog version.
    Untouched,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NamespaceSlot {
    Holds(CollectionId),
    Vacated,
}

#[derive(Debug)]
enum StagedOp {
    Create {
        id: CollectionId,
        two_phase: bool,
        ts: Option<Timestamp>,
    },
    AbandonPending {
        id: CollectionId,
    },
    Drop {
        id: CollectionId,
        drop_pending: bool,
        ts: Option<Timestamp>,
    },
    Rename {
        id: CollectionId,
        to: Namespace,
        ts: Option<Timestamp>,
    },
    DropIndex {
        index: Arc<IndexEntry>,
        drop_pending: bool,
    },
    PutView {
        view: Arc<ViewDefinition>,
    },
    DropView {
        name: Namespace,
    },
}

/// Staged collection and view changes of one unit, in submission order.
#[derive(Debug, Default)]
pub(crate) struct UncommittedUpdates {
    ops: Vec<StagedOp>,
    handles: HashMap<CollectionId, Arc<Collection>>,
    created: HashSet<CollectionId>,
    two_phase: HashSet<CollectionId>,
    dropped: HashSet<CollectionId>,
    namespaces: HashMap<Namespace, NamespaceSlot>,
    views: HashMap<Namespace, Option<Arc<ViewDefinition>>>,
}

impl UncommittedUpdates {
    pub(crate) fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.handles.is_empty()
    }

    pub(crate) fn lookup_by_id(&self, id: CollectionId) -> Staged<Arc<Collection>> {
        if let Some(handle) = self.handles.get(&id) {
            return Staged::Present(Arc::clone(handle));
        }
        if self.dropped.contains(&id) {
            return Staged::Removed;
        }
        Staged::Untouched
    }

    pub(crate) fn lookup_by_namespace(&self, namespace: &Namespace) -> Staged<Arc<Collection>> {
        match self.namespaces.get(namespace) {
            Some(NamespaceSlot::Holds(id)) => self
                .handles
                .get(id)
                .map_or(Staged::Removed, |handle| Staged::Present(Arc::clone(handle))),
            Some(NamespaceSlot::Vacated) => Staged::Removed,
            None => Staged::Untouched,
        }
    }

    pub(crate) fn lookup_view(&self, name: &Namespace) -> Staged<Arc<ViewDefinition>> {
        match self.views.get(name) {
            Some(Some(view)) => Staged::Present(Arc::clone(view)),
            Some(None) => Staged::Removed,
            None => Staged::Untouched,
        }
    }

    /// Views of `db` created, modified or dropped in this unit.
    pub(crate) fn views_in(&self, db: &DatabaseName) -> Vec<(Namespace, Option<Arc<ViewDefinition>>)> {
        self.views
            .iter()
            .filter(|(name, _)| name.db() == db)
            .map(|(name, view)| (name.clone(), view.clone()))
            .collect()
    }

    /// Whether this unit created `id` through a two-phase registration.
    pub(crate) fn is_pending_creation(&self, id: CollectionId) -> bool {
        self.two_phase.contains(&id)
    }

    /// Whether `namespace` is taken by something staged in this unit.
    pub(crate) fn occupies(&self, namespace: &Namespace) -> bool {
        matches!(self.namespaces.get(namespace), Some(NamespaceSlot::Holds(_)))
            || matches!(self.views.get(namespace), Some(Some(_)))
    }

    /// Whether this unit vacated `namespace`.
    pub(crate) fn vacated(&self, namespace: &Namespace) -> bool {
        matches!(self.namespaces.get(namespace), Some(NamespaceSlot::Vacated))
            || matches!(self.views.get(namespace), Some(None))
    }

    pub(crate) fn stage_create(
        &mut self,
        handle: Arc<Collection>,
        two_phase: bool,
        ts: Option<Timestamp>,
    ) {
        let id = handle.id();
        trace!(%id, ns = %handle.namespace(), two_phase, "catalog.uncommitted.create");
        self.namespaces
            .insert(handle.namespace().clone(), NamespaceSlot::Holds(id));
        self.handles.insert(id, handle);
        self.created.insert(id);
        if two_phase {
            self.two_phase.insert(id);
        }
        self.ops.push(StagedOp::Create { id, two_phase, ts });
    }

    pub(crate) fn stage_drop(
        &mut self,
        id: CollectionId,
        namespace: &Namespace,
        drop_pending: bool,
        ts: Option<Timestamp>,
    ) {
        trace!(%id, ns = %namespace, drop_pending, "catalog.uncommitted.drop");
        self.handles.remove(&id);
        self.namespaces
            .insert(namespace.clone(), NamespaceSlot::Vacated);
        if self.created.remove(&id) {
            // Never published: cancel the creation instead of dropping.
            let two_phase = self.two_phase.remove(&id);
            self.ops
                .retain(|op| !matches!(op, StagedOp::Create { id: created, .. } if *created == id));
            if two_phase {
                self.ops.push(StagedOp::AbandonPending { id });
            }
            return;
        }
        self.dropped.insert(id);
        self.ops.push(StagedOp::Drop {
            id,
            drop_pending,
            ts,
        });
    }

    pub(crate) fn stage_rename(
        &mut self,
        current: &Arc<Collection>,
        to: &Namespace,
        ts: Option<Timestamp>,
    ) -> Result<Arc<Collection>> {
        let id = current.id();
        if self.two_phase.contains(&id) {
            return Err(CatalogError::invariant(format!(
                "collection {id} is pending creation and cannot be renamed"
            )));
        }
        let from = current.namespace().clone();
        let mut renamed = Collection::clone(current);
        renamed.set_namespace(to.clone());
        let renamed = Arc::new(renamed);
        trace!(%id, from = %from, to = %to, "catalog.uncommitted.rename");
        self.handles.insert(id, Arc::clone(&renamed));
        self.namespaces.insert(from, NamespaceSlot::Vacated);
        self.namespaces
            .insert(to.clone(), NamespaceSlot::Holds(id));
        if !self.created.contains(&id) {
            self.ops.push(StagedOp::Rename {
                id,
                to: to.clone(),
                ts,
            });
        }
        Ok(renamed)
    }

    /// Runs `edit` on this unit's private copy of `current`, creating the
    /// copy on first use.
    pub(crate) fn edit<R>(
        &mut self,
        current: &Arc<Collection>,
        edit: impl FnOnce(&mut Collection) -> R,
    ) -> R {
        let handle = self
            .handles
            .entry(current.id())
            .or_insert_with(|| Arc::new(Collection::clone(current)));
        if let Some(slot) = self.namespaces.get(current.namespace()) {
            debug_assert_eq!(*slot, NamespaceSlot::Holds(current.id()));
        } else {
            self.namespaces.insert(
                current.namespace().clone(),
                NamespaceSlot::Holds(current.id()),
            );
        }
        edit(Arc::make_mut(handle))
    }

    pub(crate) fn stage_drop_index(&mut self, index: Arc<IndexEntry>, drop_pending: bool) {
        trace!(index = %index.name, ident = %index.ident, "catalog.uncommitted.drop_index");
        self.ops.push(StagedOp::DropIndex {
            index,
            drop_pending,
        });
    }

    pub(crate) fn stage_put_view(&mut self, view: Arc<ViewDefinition>) {
        self.views.insert(view.name.clone(), Some(Arc::clone(&view)));
        self.ops.push(StagedOp::PutView { view });
    }

    pub(crate) fn stage_drop_view(&mut self, name: &Namespace) {
        self.views.insert(name.clone(), None);
        self.ops.push(StagedOp::DropView { name: name.clone() });
    }

    /// Applies every staged change to `version` in submission order, then
    /// publishes the final state of each edited handle.
    pub(crate) fn apply(
        self,
        version: &mut CatalogVersion,
        txn: TxnId,
        commit_ts: Option<Timestamp>,
    ) -> Result<()> {
        let handle = |id: &CollectionId| {
            self.handles
                .get(id)
                .cloned()
                .ok_or_else(|| CatalogError::invariant(format!("no staged handle for {id}")))
        };
        let mut index_drops = Vec::new();
        for op in &self.ops {
            match op {
                StagedOp::Create {
                    id,
                    two_phase: false,
                    ts,
                } => version.register_collection(handle(id)?, ts.or(commit_ts))?,
                StagedOp::Create {
                    id,
                    two_phase: true,
                    ts,
                } => version.commit_pending(txn, handle(id)?, ts.or(commit_ts))?,
                StagedOp::AbandonPending { id } => {
                    version.remove_pending(txn, *id);
                }
                StagedOp::Drop {
                    id,
                    drop_pending,
                    ts,
                } => {
                    version.deregister(*id, ts.or(commit_ts), *drop_pending)?;
                }
                StagedOp::Rename { id, to, ts } => {
                    version.rename(*id, to, ts.or(commit_ts))?;
                }
                StagedOp::DropIndex {
                    index,
                    drop_pending,
                } => {
                    if *drop_pending {
                        index_drops.push(Arc::clone(index));
                    }
                }
                StagedOp::PutView { view } => version.put_view(Arc::clone(view))?,
                StagedOp::DropView { name } => {
                    version.remove_view(name)?;
                }
            }
        }
        for (id, staged) in &self.handles {
            if self.created.contains(id) {
                continue;
            }
            match version.lookup_by_id(*id) {
                Some(current) if !Arc::ptr_eq(&current, staged) => {
                    version.replace_collection(Arc::clone(staged))?;
                }
                Some(_) => {}
                None => {
                    return Err(CatalogError::CollectionNotFound(*id));
                }
            }
        }
        for index in &index_drops {
            version.track_drop_pending_index(index);
        }
        Ok(())
    }
}
