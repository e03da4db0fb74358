use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::durable::{DurableEntry, DurableIndex};
use crate::types::{CatalogId, CollectionId, Ident, Namespace, Timestamp};

/// Creation options that affect catalog statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Fixed-size collection.
    #[serde(default)]
    pub capped: bool,
    /// Collection clustered by its primary key.
    #[serde(default)]
    pub clustered: bool,
}

/// Index metadata shared between catalog versions.
///
/// Entries are reference counted; a catalog version that did not touch an
/// index keeps pointing at the same entry as its predecessor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Index name, unique per collection.
    pub name: String,
    /// Storage ident backing the index.
    pub ident: Ident,
    /// Whether any document produced multiple keys.
    pub multikey: bool,
    /// Whether the build has finished.
    pub ready: bool,
}

impl IndexEntry {
    /// Creates a ready, non-multikey index entry.
    pub fn new(name: impl Into<String>, ident: impl Into<Ident>) -> Self {
        Self {
            name: name.into(),
            ident: ident.into(),
            multikey: false,
            ready: true,
        }
    }
}

impl From<&DurableIndex> for IndexEntry {
    fn from(index: &DurableIndex) -> Self {
        Self {
            name: index.name.clone(),
            ident: index.ident.clone(),
            multikey: index.multikey,
            ready: index.ready,
        }
    }
}

/// How an in-memory handle relates to a durable record at some timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Compatibility {
    /// The handle already describes the record and is valid at the timestamp.
    Identical,
    /// Same storage, different metadata: a sibling handle can share state.
    Adaptable,
    /// Different collection or storage.
    Incompatible,
}

/// Metadata handle for one collection at one catalog version.
///
/// Handles are shared through `Arc` and never mutated once published. Writers
/// clone, edit the clone, and publish it in a new version.
#[derive(Clone, Debug)]
pub struct Collection {
    id: CollectionId,
    namespace: Namespace,
    catalog_id: CatalogId,
    ident: Ident,
    options: CollectionOptions,
    indexes: Vec<Arc<IndexEntry>>,
    min_valid: Option<Timestamp>,
}

impl Collection {
    /// Creates a handle with no indexes.
    pub fn new(
        id: CollectionId,
        namespace: Namespace,
        catalog_id: CatalogId,
        ident: impl Into<Ident>,
    ) -> Self {
        Self {
            id,
            namespace,
            catalog_id,
            ident: ident.into(),
            options: CollectionOptions::default(),
            indexes: Vec::new(),
            min_valid: None,
        }
    }

    /// Builds a handle from a durable record as of `ts`.
    pub fn from_durable(entry: &DurableEntry, ts: Option<Timestamp>) -> Self {
        Self {
            id: entry.id,
            namespace: entry.namespace.clone(),
            catalog_id: entry.catalog_id,
            ident: entry.ident.clone(),
            options: entry.options,
            indexes: entry
                .indexes
                .iter()
                .map(|index| Arc::new(IndexEntry::from(index)))
                .collect(),
            min_valid: ts,
        }
    }

    /// Sets the creation options.
    pub fn with_options(mut self, options: CollectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Appends an index.
    pub fn with_index(mut self, index: IndexEntry) -> Self {
        self.indexes.push(Arc::new(index));
        self
    }

    /// Sets the earliest timestamp this handle is valid for.
    pub fn with_min_valid(mut self, ts: Timestamp) -> Self {
        self.min_valid = Some(ts);
        self
    }

    /// Stable identifier.
    pub fn id(&self) -> CollectionId {
        self.id
    }

    /// Current namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Durable record location.
    pub fn catalog_id(&self) -> CatalogId {
        self.catalog_id
    }

    /// Storage ident of the record store.
    pub fn ident(&self) -> &Ident {
        &self.ident
    }

    /// Creation options.
    pub fn options(&self) -> CollectionOptions {
        self.options
    }

    /// All indexes in creation order.
    pub fn indexes(&self) -> &[Arc<IndexEntry>] {
        &self.indexes
    }

    /// Finds an index by name.
    pub fn index(&self, name: &str) -> Option<&Arc<IndexEntry>> {
        self.indexes.iter().find(|index| index.name == name)
    }

    /// Earliest snapshot this metadata is valid for; `None` means unbounded.
    pub fn min_valid(&self) -> Option<Timestamp> {
        self.min_valid
    }

    /// Whether this collection counts as internal for statistics.
    pub fn is_internal(&self) -> bool {
        self.namespace.is_internal()
    }

    /// Adds an index, replacing any existing entry with the same name.
    pub fn add_index(&mut self, index: IndexEntry) {
        self.indexes.retain(|existing| existing.name != index.name);
        self.indexes.push(Arc::new(index));
    }

    /// Removes an index, returning the shared entry it was stored in.
    pub fn remove_index(&mut self, name: &str) -> Option<Arc<IndexEntry>> {
        let pos = self.indexes.iter().position(|index| index.name == name)?;
        Some(self.indexes.remove(pos))
    }

    /// Flags an index as multikey. Copy-on-write: other versions keep the
    /// previous entry.
    pub fn set_multikey(&mut self, name: &str) -> bool {
        let Some(index) = self.indexes.iter_mut().find(|index| index.name == name) else {
            return false;
        };
        if !index.multikey {
            Arc::make_mut(index).multikey = true;
        }
        true
    }

    /// Records a destructive schema change at `ts`.
    pub fn set_min_valid(&mut self, ts: Option<Timestamp>) {
        self.min_valid = ts;
    }

    pub(crate) fn set_namespace(&mut self, namespace: Namespace) {
        self.namespace = namespace;
    }

    pub(crate) fn compatibility(&self, entry: &DurableEntry, ts: Timestamp) -> Compatibility {
        if self.id != entry.id || self.ident != entry.ident {
            return Compatibility::Incompatible;
        }
        let valid_at_ts = self.min_valid.map_or(true, |min| min <= ts);
        if valid_at_ts
            && self.namespace == entry.namespace
            && self.catalog_id == entry.catalog_id
            && self.same_indexes(&entry.indexes)
        {
            Compatibility::Identical
        } else {
            Compatibility::Adaptable
        }
    }

    /// Builds a sibling handle describing `entry` at `ts`. Indexes whose
    /// ident, name and build state are unchanged keep the shared entry, so
    /// multikey state may be wider than the snapshot strictly needs, never
    /// narrower. Rebuilt entries carry the record's build state and keep any
    /// multikey flag the shared entry had.
    pub(crate) fn adapt(&self, entry: &DurableEntry, ts: Timestamp) -> Collection {
        let indexes = entry
            .indexes
            .iter()
            .map(|durable| {
                let Some(existing) = self.indexes.iter().find(|index| index.ident == durable.ident)
                else {
                    return Arc::new(IndexEntry::from(durable));
                };
                if existing.name == durable.name && existing.ready == durable.ready {
                    return Arc::clone(existing);
                }
                let mut rebuilt = IndexEntry::from(durable);
                rebuilt.multikey |= existing.multikey;
                Arc::new(rebuilt)
            })
            .collect();
        Collection {
            id: entry.id,
            namespace: entry.namespace.clone(),
            catalog_id: entry.catalog_id,
            ident: entry.ident.clone(),
            options: entry.options,
            indexes,
            min_valid: Some(ts),
        }
    }

    fn same_indexes(&self, durable: &[DurableIndex]) -> bool {
        self.indexes.len() == durable.len()
            && durable.iter().all(|d| {
                self.indexes.iter().any(|index| {
                    index.name == d.name && index.ident == d.ident && index.ready == d.ready
                })
            })
    }
}
