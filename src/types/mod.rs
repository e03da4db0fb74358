//! Identifiers, timestamps and the crate-wide error type.

mod error;
mod ids;

pub use error::{CatalogError, Result};
pub use ids::{
    CatalogId, CollectionId, CollectionRef, DatabaseName, Ident, Namespace, Timestamp, TxnId,
};
