use std::ops::Bound;
use std::sync::Arc;

use imbl::{HashMap, OrdMap};
use tracing::trace;

use crate::catalog::collection::Collection;
use crate::types::{CatalogError, CollectionId, DatabaseName, Namespace, Result, TxnId};

/// How an id or namespace is currently held in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationState {
    /// Nothing is registered.
    Absent,
    /// A two-phase creation by the given transaction has not committed yet.
    Pending(TxnId),
    /// Visible to everyone.
    Committed,
}

#[derive(Clone, Debug)]
enum Registration {
    Pending {
        txn: TxnId,
        collection: Arc<Collection>,
    },
    Committed(Arc<Collection>),
}

impl Registration {
    fn collection(&self) -> &Arc<Collection> {
        match self {
            Registration::Pending { collection, .. } => collection,
            Registration::Committed(collection) => collection,
        }
    }

    fn committed(&self) -> Option<&Arc<Collection>> {
        match self {
            Registration::Committed(collection) => Some(collection),
            Registration::Pending { .. } => None,
        }
    }

    fn state(&self) -> RegistrationState {
        match self {
            Registration::Pending { txn, .. } => RegistrationState::Pending(*txn),
            Registration::Committed(_) => RegistrationState::Committed,
        }
    }
}

type OrderedKey = (DatabaseName, CollectionId);

/// Persistent id and namespace maps plus an ordered `(db, id)` index.
///
/// Cloning is O(1); every mutation copies only the touched tree paths, so a
/// clone taken by a writer shares almost everything with the version
/// readers hold.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    by_id: HashMap<CollectionId, Registration>,
    by_namespace: HashMap<Namespace, Registration>,
    ordered: OrdMap<OrderedKey, Arc<Collection>>,
}

impl Registry {
    fn ensure_vacant(&self, collection: &Collection) -> Result<()> {
        if self.by_id.contains_key(&collection.id()) {
            return Err(CatalogError::CollectionIdExists(collection.id()));
        }
        if self.by_namespace.contains_key(collection.namespace()) {
            return Err(CatalogError::NamespaceExists(collection.namespace().clone()));
        }
        Ok(())
    }

    fn ordered_key(collection: &Collection) -> OrderedKey {
        (collection.namespace().db().clone(), collection.id())
    }

    /// Registers a committed collection.
    pub fn insert_committed(&mut self, collection: Arc<Collection>) -> Result<()> {
        self.ensure_vacant(&collection)?;
        trace!(id = %collection.id(), ns = %collection.namespace(), "catalog.registry.insert");
        self.ordered
            .insert(Self::ordered_key(&collection), Arc::clone(&collection));
        self.by_id
            .insert(collection.id(), Registration::Committed(Arc::clone(&collection)));
        self.by_namespace.insert(
            collection.namespace().clone(),
            Registration::Committed(collection),
        );
        Ok(())
    }

    /// Registers a two-phase creation owned by `txn`.
    pub fn insert_pending(&mut self, txn: TxnId, collection: Arc<Collection>) -> Result<()> {
        self.ensure_vacant(&collection)?;
        trace!(id = %collection.id(), ns = %collection.namespace(), %txn, "catalog.registry.pending");
        let registration = Registration::Pending {
            txn,
            collection: Arc::clone(&collection),
        };
        self.by_id.insert(collection.id(), registration.clone());
        self.by_namespace
            .insert(collection.namespace().clone(), registration);
        Ok(())
    }

    /// Promotes a pending registration. Only the owning transaction may do
    /// this; `collection` replaces the handle published as pending.
    pub fn commit_pending(&mut self, txn: TxnId, collection: Arc<Collection>) -> Result<()> {
        let id = collection.id();
        match self.by_id.get(&id) {
            Some(Registration::Pending { txn: owner, collection: pending }) if *owner == txn => {
                if pending.namespace() != collection.namespace() {
                    return Err(CatalogError::invariant(format!(
                        "pending collection {id} changed namespace before commit"
                    )));
                }
            }
            Some(Registration::Pending { txn: owner, .. }) => {
                return Err(CatalogError::invariant(format!(
                    "{txn} cannot commit collection {id} pending in {owner}"
                )));
            }
            Some(Registration::Committed(_)) => {
                return Err(CatalogError::invariant(format!(
                    "collection {id} is already committed"
                )));
            }
            None => {
                return Err(CatalogError::invariant(format!(
                    "collection {id} has no pending registration"
                )));
            }
        }
        self.ordered
            .insert(Self::ordered_key(&collection), Arc::clone(&collection));
        self.by_id
            .insert(id, Registration::Committed(Arc::clone(&collection)));
        self.by_namespace.insert(
            collection.namespace().clone(),
            Registration::Committed(collection),
        );
        Ok(())
    }

    /// Removes a pending registration owned by `txn`.
    pub fn remove_pending(&mut self, txn: TxnId, id: CollectionId) -> Option<Arc<Collection>> {
        let collection = match self.by_id.get(&id) {
            Some(Registration::Pending { txn: owner, collection }) if *owner == txn => {
                Arc::clone(collection)
            }
            _ => return None,
        };
        self.by_id.remove(&id);
        self.by_namespace.remove(collection.namespace());
        Some(collection)
    }

    /// Removes a committed collection.
    pub fn remove(&mut self, id: CollectionId) -> Result<Arc<Collection>> {
        let collection = self
            .by_id
            .get(&id)
            .and_then(Registration::committed)
            .cloned()
            .ok_or(CatalogError::CollectionNotFound(id))?;
        self.by_id.remove(&id);
        self.by_namespace.remove(collection.namespace());
        self.ordered.remove(&Self::ordered_key(&collection));
        Ok(collection)
    }

    /// Moves a committed collection to `to`, returning the re-keyed handle.
    pub fn rename(&mut self, id: CollectionId, to: &Namespace) -> Result<Arc<Collection>> {
        if self.by_namespace.contains_key(to) {
            return Err(CatalogError::NamespaceExists(to.clone()));
        }
        let existing = self.remove(id)?;
        let mut renamed = Collection::clone(&existing);
        renamed.set_namespace(to.clone());
        let renamed = Arc::new(renamed);
        self.insert_committed(Arc::clone(&renamed))?;
        Ok(renamed)
    }

    /// Swaps in a new handle for an already committed collection under the
    /// same namespace.
    pub fn replace(&mut self, collection: Arc<Collection>) -> Result<()> {
        let id = collection.id();
        let current = self
            .by_id
            .get(&id)
            .and_then(Registration::committed)
            .ok_or(CatalogError::CollectionNotFound(id))?;
        if current.namespace() != collection.namespace() {
            return Err(CatalogError::invariant(format!(
                "replacement for {id} moved from {} to {}",
                current.namespace(),
                collection.namespace()
            )));
        }
        self.ordered
            .insert(Self::ordered_key(&collection), Arc::clone(&collection));
        self.by_id
            .insert(id, Registration::Committed(Arc::clone(&collection)));
        self.by_namespace.insert(
            collection.namespace().clone(),
            Registration::Committed(collection),
        );
        Ok(())
    }

    /// Committed collection by id.
    pub fn lookup_by_id(&self, id: CollectionId) -> Option<&Arc<Collection>> {
        self.by_id.get(&id).and_then(Registration::committed)
    }

    /// Committed collection by namespace.
    pub fn lookup_by_namespace(&self, namespace: &Namespace) -> Option<&Arc<Collection>> {
        self.by_namespace
            .get(namespace)
            .and_then(Registration::committed)
    }

    /// Collection by id, pending registrations included.
    pub fn lookup_pending_by_id(&self, id: CollectionId) -> Option<&Arc<Collection>> {
        self.by_id.get(&id).map(Registration::collection)
    }

    /// Collection by namespace, pending registrations included.
    pub fn lookup_pending_by_namespace(&self, namespace: &Namespace) -> Option<&Arc<Collection>> {
        self.by_namespace.get(namespace).map(Registration::collection)
    }

    /// Registration state of an id.
    pub fn state_of(&self, id: CollectionId) -> RegistrationState {
        self.by_id
            .get(&id)
            .map_or(RegistrationState::Absent, Registration::state)
    }

    /// Registration state of a namespace.
    pub fn state_of_namespace(&self, namespace: &Namespace) -> RegistrationState {
        self.by_namespace
            .get(namespace)
            .map_or(RegistrationState::Absent, Registration::state)
    }

    /// Committed collections of `db` in id order.
    pub fn collections_in<'a>(
        &'a self,
        db: &DatabaseName,
    ) -> impl Iterator<Item = &'a Arc<Collection>> + 'a {
        self.ordered
            .range((db.clone(), CollectionId::MIN)..=(db.clone(), CollectionId::MAX))
            .map(|(_, collection)| collection)
    }

    /// First committed collection of `db` ordered after `after`.
    pub fn next_in(
        &self,
        db: &DatabaseName,
        after: Option<CollectionId>,
    ) -> Option<&Arc<Collection>> {
        let lower = match after {
            Some(id) => Bound::Excluded((db.clone(), id)),
            None => Bound::Included((db.clone(), CollectionId::MIN)),
        };
        let upper = Bound::Included((db.clone(), CollectionId::MAX));
        self.ordered
            .range((lower, upper))
            .next()
            .map(|(_, collection)| collection)
    }

    /// Committed collection ids of `db` in order.
    pub fn ids_in(&self, db: &DatabaseName) -> Vec<CollectionId> {
        self.collections_in(db).map(|c| c.id()).collect()
    }

    /// Databases holding at least one committed collection, sorted.
    pub fn database_names(&self) -> Vec<DatabaseName> {
        let mut names: Vec<DatabaseName> = Vec::new();
        for (db, _) in self.ordered.keys() {
            if names.last() != Some(db) {
                names.push(db.clone());
            }
        }
        names
    }

    /// All committed collections in `(db, id)` order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Collection>> {
        self.ordered.values()
    }

    /// Id to namespace mapping of committed collections.
    pub fn namespaces_by_id(&self) -> std::collections::HashMap<CollectionId, Namespace> {
        self.ordered
            .values()
            .map(|c| (c.id(), c.namespace().clone()))
            .collect()
    }

    /// Number of committed collections.
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether no collection is committed.
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Number of pending registrations.
    pub fn pending_len(&self) -> usize {
        self.by_id.len() - self.ordered.len()
    }
}
