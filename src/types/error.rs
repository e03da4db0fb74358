use thiserror::Error;
use tracing::error;

use super::ids::{CollectionId, Namespace};

/// Result alias used throughout the catalog.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors surfaced by catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The namespace is already taken by a collection, view, or an
    /// uncommitted registration of another transaction.
    #[error("namespace {0} already exists")]
    NamespaceExists(Namespace),
    /// The collection identifier is already registered.
    #[error("collection id {0} already registered")]
    CollectionIdExists(CollectionId),
    /// A namespace that was required to resolve does not exist.
    #[error("namespace {0} not found")]
    NamespaceNotFound(String),
    /// A collection identifier that was required to resolve does not exist.
    #[error("collection {0} not found")]
    CollectionNotFound(CollectionId),
    /// The named index does not exist on the collection.
    #[error("index {index} not found on {namespace}")]
    IndexNotFound {
        /// Collection the index was looked up on.
        namespace: Namespace,
        /// Requested index name.
        index: String,
    },
    /// Namespace text could not be parsed or violates naming rules.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),
    /// A view definition failed validation.
    #[error("invalid view definition: {0}")]
    InvalidViewDefinition(String),
    /// A view pipeline is malformed.
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    /// Profiling level outside `0..=2`.
    #[error("invalid profiling level: {0}")]
    InvalidProfileLevel(i32),
    /// A caller broke a catalog contract. Not recoverable by retrying.
    #[error("catalog invariant violated: {0}")]
    Invariant(String),
    /// The durable catalog store reported a failure.
    #[error("durable catalog error: {0}")]
    Durable(String),
    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    /// Builds an [`CatalogError::Invariant`] and logs it, since these point at
    /// a caller bug rather than a runtime condition.
    pub fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        error!(reason = %msg, "catalog.invariant");
        CatalogError::Invariant(msg)
    }

    /// Returns `true` for errors the surrounding server should treat as
    /// non-continuable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CatalogError::Invariant(_))
    }

    /// Returns `true` when the error is a namespace or identifier conflict,
    /// which callers typically retry.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            CatalogError::NamespaceExists(_) | CatalogError::CollectionIdExists(_)
        )
    }
}
