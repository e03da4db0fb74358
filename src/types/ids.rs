use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{CatalogError, Result};

/// Logical commit time. Ordered, copyable, and opaque to the catalog beyond
/// its ordering.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Smallest representable timestamp.
    pub const MIN: Timestamp = Timestamp(0);
    /// Largest representable timestamp; used as "no watermark".
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-stable collection identifier. Survives renames, reassigned only
/// when a collection is dropped and recreated.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CollectionId(pub Uuid);

impl CollectionId {
    /// Lowest identifier in sort order.
    pub const MIN: CollectionId = CollectionId(Uuid::from_u128(0));
    /// Highest identifier in sort order.
    pub const MAX: CollectionId = CollectionId(Uuid::from_u128(u128::MAX));

    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an identifier from a raw 128-bit value.
    pub const fn from_u128(raw: u128) -> Self {
        Self(Uuid::from_u128(raw))
    }
}

impl Default for CollectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CollectionId {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(CollectionId)
            .map_err(|err| CatalogError::InvalidNamespace(format!("bad collection id {s}: {err}")))
    }
}

/// Location token of a collection's record in the durable catalog.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CatalogId(pub u64);

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage-engine ident backing a collection or index.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ident(Arc<str>);

impl Ident {
    /// Creates an ident from its textual form.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Arc::from(raw.as_ref()))
    }

    /// Returns the ident text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Ident {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction identifier handed out to every [`crate::catalog::OpContext`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxnId(pub u64);

static NEXT_TXN: AtomicU64 = AtomicU64::new(1);

impl TxnId {
    /// Allocates the next process-unique transaction id.
    pub fn next() -> Self {
        Self(NEXT_TXN.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

const INTERNAL_DATABASES: [&str; 3] = ["admin", "local", "config"];

/// Database name.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DatabaseName(Arc<str>);

impl DatabaseName {
    /// Validates and builds a database name.
    pub fn new(name: impl AsRef<str>) -> Result<Self> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(CatalogError::InvalidNamespace("empty database name".into()));
        }
        if let Some(bad) = name.chars().find(|c| matches!(c, '.' | '/' | '\\' | ' ' | '"' | '$' | '\0')) {
            return Err(CatalogError::InvalidNamespace(format!(
                "database name {name:?} contains {bad:?}"
            )));
        }
        Ok(Self(Arc::from(name)))
    }

    /// Returns the name text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `admin`, `local` and `config` hold server-internal data.
    pub fn is_internal(&self) -> bool {
        INTERNAL_DATABASES.contains(&self.as_str())
    }
}

impl TryFrom<String> for DatabaseName {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DatabaseName> for String {
    fn from(value: DatabaseName) -> Self {
        value.0.to_string()
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A `(database, collection)` pair naming a collection or view.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    db: DatabaseName,
    coll: Arc<str>,
}

impl Namespace {
    /// Builds a namespace from its parts.
    pub fn new(db: impl AsRef<str>, coll: impl AsRef<str>) -> Result<Self> {
        let db = DatabaseName::new(db)?;
        let coll = coll.as_ref();
        if coll.is_empty() {
            return Err(CatalogError::InvalidNamespace(format!(
                "empty collection name in database {db}"
            )));
        }
        if coll.contains('\0') || coll.starts_with('.') {
            return Err(CatalogError::InvalidNamespace(format!(
                "collection name {coll:?} is not allowed"
            )));
        }
        Ok(Self {
            db,
            coll: Arc::from(coll),
        })
    }

    /// Parses `db.coll`; everything after the first dot is the collection name.
    pub fn parse(text: &str) -> Result<Self> {
        let (db, coll) = text
            .split_once('.')
            .ok_or_else(|| CatalogError::InvalidNamespace(format!("{text:?} has no '.'")))?;
        Self::new(db, coll)
    }

    /// Database half.
    pub fn db(&self) -> &DatabaseName {
        &self.db
    }

    /// Collection half.
    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// `system.*` collections.
    pub fn is_system(&self) -> bool {
        self.coll.starts_with("system.")
    }

    /// System collections and anything in an internal database.
    pub fn is_internal(&self) -> bool {
        self.is_system() || self.db.is_internal()
    }
}

impl TryFrom<String> for Namespace {
    type Error = CatalogError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Namespace> for String {
    fn from(value: Namespace) -> Self {
        value.to_string()
    }
}

impl FromStr for Namespace {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Either side of a collection lookup.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum CollectionRef {
    /// Look up by namespace.
    Namespace(Namespace),
    /// Look up by stable identifier.
    Id(CollectionId),
}

impl From<Namespace> for CollectionRef {
    fn from(value: Namespace) -> Self {
        CollectionRef::Namespace(value)
    }
}

impl From<CollectionId> for CollectionRef {
    fn from(value: CollectionId) -> Self {
        CollectionRef::Id(value)
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionRef::Namespace(ns) => write!(f, "{ns}"),
            CollectionRef::Id(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for CollectionRef {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(id) = Uuid::parse_str(s) {
            return Ok(CollectionRef::Id(CollectionId(id)));
        }
        Namespace::parse(s).map(CollectionRef::Namespace)
    }
}
