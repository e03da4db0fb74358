//! Strata: a versioned, point-in-time collection catalog.
//!
//! Readers take immutable [`CatalogVersion`] snapshots without locking;
//! writers stage changes on an [`OpContext`] and publish them as a new
//! version when their write unit commits. History kept alongside each version
//! answers which collection a namespace or id referred to at a past
//! timestamp, falling back to the [`DurableCatalog`] when it cannot.

#![warn(missing_docs)]

pub mod catalog;
pub mod options;
pub mod types;

pub use catalog::{
    Catalog, CatalogVersion, Collection, DurableCatalog, IndexEntry, LockMode, LockResource,
    MemoryDurableCatalog, OpContext, VersionManager, WriteUnit,
};
pub use options::{CatalogConfig, CatalogOptions};
pub use types::{
    CatalogError, CatalogId, CollectionId, CollectionRef, DatabaseName, Ident, Namespace, Result,
    Timestamp, TxnId,
};
