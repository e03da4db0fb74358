//! Contract with the on-disk catalog, plus an in-memory implementation.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::catalog::collection::CollectionOptions;
use crate::catalog::views::ViewDefinition;
use crate::types::{
    CatalogError, CatalogId, CollectionId, CollectionRef, DatabaseName, Ident, Namespace, Result,
    Timestamp,
};

/// Index as stored in a durable collection record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableIndex {
    /// Index name.
    pub name: String,
    /// Storage ident.
    pub ident: Ident,
    /// Multikey flag as persisted.
    #[serde(default)]
    pub multikey: bool,
    /// Whether the build finished.
    #[serde(default = "default_ready")]
    pub ready: bool,
}

fn default_ready() -> bool {
    true
}

impl DurableIndex {
    /// Ready, non-multikey index record.
    pub fn new(name: impl Into<String>, ident: impl Into<Ident>) -> Self {
        Self {
            name: name.into(),
            ident: ident.into(),
            multikey: false,
            ready: true,
        }
    }
}

/// One durable collection record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableEntry {
    /// Record location.
    pub catalog_id: CatalogId,
    /// Collection id.
    pub id: CollectionId,
    /// Namespace at the record's version.
    pub namespace: Namespace,
    /// Record store ident.
    pub ident: Ident,
    /// Creation options.
    #[serde(default)]
    pub options: CollectionOptions,
    /// Indexes.
    #[serde(default)]
    pub indexes: Vec<DurableIndex>,
}

impl DurableEntry {
    /// Whether this record answers a lookup for `target`.
    pub fn matches(&self, target: &CollectionRef) -> bool {
        match target {
            CollectionRef::Namespace(namespace) => &self.namespace == namespace,
            CollectionRef::Id(id) => self.id == *id,
        }
    }
}

/// Ground truth the catalog falls back to when its history cannot answer.
///
/// Every method may perform I/O. The catalog calls them without holding any
/// of its internal locks.
pub trait DurableCatalog: Send + Sync {
    /// Finds the record `target` resolved to at `ts` (`None` = latest).
    fn scan_at(&self, target: &CollectionRef, ts: Option<Timestamp>) -> Result<Option<DurableEntry>>;

    /// Reads the record at `catalog_id` as of `ts`.
    fn fetch_at(&self, catalog_id: CatalogId, ts: Option<Timestamp>) -> Result<Option<DurableEntry>>;

    /// Every live record as of `ts`.
    fn list_at(&self, ts: Option<Timestamp>) -> Result<Vec<DurableEntry>>;

    /// Whether the storage ident still physically exists.
    fn ident_exists(&self, ident: &Ident) -> bool;

    /// Raw view records of `db`, in storage order.
    fn load_views(&self, db: &DatabaseName) -> Result<Vec<Value>>;

    /// Writes or replaces a view record.
    fn upsert_view(&self, view: &ViewDefinition) -> Result<()>;

    /// Deletes a view record.
    fn remove_view(&self, name: &Namespace) -> Result<()>;

    /// Raw record stored for view `name`, if any.
    fn view_record(&self, name: &Namespace) -> Result<Option<Value>> {
        let id = name.to_string();
        Ok(self
            .load_views(name.db())?
            .into_iter()
            .find(|record| record.get("_id").and_then(Value::as_str) == Some(id.as_str())))
    }

    /// Puts back a record previously returned by
    /// [`DurableCatalog::view_record`]; `None` removes the view.
    fn restore_view_record(&self, name: &Namespace, record: Option<Value>) -> Result<()>;
}

/// One change in a [`DurableDump`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DurableEvent {
    /// Writes a record version.
    Put {
        /// Commit timestamp.
        ts: Timestamp,
        /// Record contents.
        entry: DurableEntry,
    },
    /// Deletes the record at `catalog_id`.
    Remove {
        /// Commit timestamp.
        ts: Timestamp,
        /// Record location.
        catalog_id: CatalogId,
    },
    /// Physically removes an ident.
    DropIdent {
        /// Removed ident.
        ident: Ident,
    },
}

/// JSON form of a durable catalog, used by the CLI and tests.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DurableDump {
    /// Timestamp the catalog is opened at.
    #[serde(default)]
    pub stable_timestamp: Option<Timestamp>,
    /// Record history in commit order.
    #[serde(default)]
    pub events: Vec<DurableEvent>,
    /// Raw view records per database.
    #[serde(default)]
    pub views: BTreeMap<String, Vec<Value>>,
}

type RecordVersions = Vec<(Timestamp, Option<DurableEntry>)>;

/// Timestamped in-memory durable catalog.
#[derive(Debug, Default)]
pub struct MemoryDurableCatalog {
    records: RwLock<BTreeMap<CatalogId, RecordVersions>>,
    idents: RwLock<HashSet<Ident>>,
    views: RwLock<BTreeMap<DatabaseName, Vec<Value>>>,
    next_catalog_id: AtomicU64,
    scans: AtomicU64,
}

fn version_at(versions: &RecordVersions, ts: Option<Timestamp>) -> Option<&DurableEntry> {
    let visible = match ts {
        Some(ts) => versions.partition_point(|(written, _)| *written <= ts),
        None => versions.len(),
    };
    visible
        .checked_sub(1)
        .and_then(|pos| versions[pos].1.as_ref())
}

impl MemoryDurableCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog by replaying `dump`.
    pub fn from_dump(dump: &DurableDump) -> Result<Self> {
        let catalog = Self::new();
        for event in &dump.events {
            match event {
                DurableEvent::Put { ts, entry } => catalog.put(entry.clone(), *ts)?,
                DurableEvent::Remove { ts, catalog_id } => catalog.remove(*catalog_id, *ts)?,
                DurableEvent::DropIdent { ident } => catalog.drop_ident(ident),
            }
        }
        for (db, records) in &dump.views {
            let db = DatabaseName::new(db)?;
            catalog.views.write().insert(db, records.clone());
        }
        debug!(events = dump.events.len(), "catalog.durable.load");
        Ok(catalog)
    }

    /// Reads a JSON dump from `path`.
    pub fn load_dump(path: &Path) -> Result<(Self, DurableDump)> {
        let text = fs::read_to_string(path)?;
        let dump: DurableDump = serde_json::from_str(&text)?;
        Ok((Self::from_dump(&dump)?, dump))
    }

    /// Hands out a fresh record location.
    pub fn next_catalog_id(&self) -> CatalogId {
        CatalogId(self.next_catalog_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Writes a record version at `ts`.
    pub fn put(&self, entry: DurableEntry, ts: Timestamp) -> Result<()> {
        let mut records = self.records.write();
        let versions = records.entry(entry.catalog_id).or_default();
        if versions.last().is_some_and(|(last, _)| *last > ts) {
            return Err(CatalogError::Durable(format!(
                "record {} written at {ts} after a later version",
                entry.catalog_id
            )));
        }
        self.next_catalog_id
            .fetch_max(entry.catalog_id.0, Ordering::Relaxed);
        {
            let mut idents = self.idents.write();
            idents.insert(entry.ident.clone());
            idents.extend(entry.indexes.iter().map(|index| index.ident.clone()));
        }
        trace!(catalog_id = %entry.catalog_id, ns = %entry.namespace, ts = %ts, "catalog.durable.put");
        versions.push((ts, Some(entry)));
        Ok(())
    }

    /// Deletes the record at `catalog_id` as of `ts`. Its idents stay until
    /// [`MemoryDurableCatalog::drop_ident`].
    pub fn remove(&self, catalog_id: CatalogId, ts: Timestamp) -> Result<()> {
        let mut records = self.records.write();
        let versions = records
            .get_mut(&catalog_id)
            .ok_or_else(|| CatalogError::Durable(format!("no record at {catalog_id}")))?;
        versions.push((ts, None));
        Ok(())
    }

    /// Physically removes an ident.
    pub fn drop_ident(&self, ident: &Ident) {
        self.idents.write().remove(ident);
    }

    /// Appends a raw view record, bypassing validation.
    pub fn put_raw_view(&self, db: &DatabaseName, record: Value) {
        self.views
            .write()
            .entry(db.clone())
            .or_default()
            .push(record);
    }

    /// Number of [`DurableCatalog::scan_at`] calls served.
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }
}

impl DurableCatalog for MemoryDurableCatalog {
    fn scan_at(&self, target: &CollectionRef, ts: Option<Timestamp>) -> Result<Option<DurableEntry>> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read();
        Ok(records
            .values()
            .filter_map(|versions| version_at(versions, ts))
            .find(|entry| entry.matches(target))
            .cloned())
    }

    fn fetch_at(&self, catalog_id: CatalogId, ts: Option<Timestamp>) -> Result<Option<DurableEntry>> {
        let records = self.records.read();
        Ok(records
            .get(&catalog_id)
            .and_then(|versions| version_at(versions, ts))
            .cloned())
    }

    fn list_at(&self, ts: Option<Timestamp>) -> Result<Vec<DurableEntry>> {
        let records = self.records.read();
        Ok(records
            .values()
            .filter_map(|versions| version_at(versions, ts))
            .cloned()
            .collect())
    }

    fn ident_exists(&self, ident: &Ident) -> bool {
        self.idents.read().contains(ident)
    }

    fn load_views(&self, db: &DatabaseName) -> Result<Vec<Value>> {
        Ok(self.views.read().get(db).cloned().unwrap_or_default())
    }

    fn upsert_view(&self, view: &ViewDefinition) -> Result<()> {
        let record = view.to_record();
        let id = view.name.to_string();
        let mut views = self.views.write();
        let records = views.entry(view.name.db().clone()).or_default();
        match records
            .iter_mut()
            .find(|existing| existing.get("_id").and_then(Value::as_str) == Some(id.as_str()))
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    fn remove_view(&self, name: &Namespace) -> Result<()> {
        let id = name.to_string();
        if let Some(records) = self.views.write().get_mut(name.db()) {
            records.retain(|record| record.get("_id").and_then(Value::as_str) != Some(id.as_str()));
        }
        Ok(())
    }

    fn restore_view_record(&self, name: &Namespace, record: Option<Value>) -> Result<()> {
        let Some(record) = record else {
            return self.remove_view(name);
        };
        let id = name.to_string();
        let mut views = self.views.write();
        let records = views.entry(name.db().clone()).or_default();
        match records
            .iter_mut()
            .find(|existing| existing.get("_id").and_then(Value::as_str) == Some(id.as_str()))
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        trace!(view = %name, "catalog.durable.view_restored");
        Ok(())
    }
}
