//! Catalog tuning knobs and their file form.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::metrics::CatalogMetrics;
use crate::catalog::views::{default_view_validator, ProfileFilter, ProfileSettings, ViewValidator};
use crate::types::Result;

/// Options applied when a [`Catalog`](crate::catalog::Catalog) is created.
#[derive(Clone)]
pub struct CatalogOptions {
    /// Whether durable scans answering historical lookups are remembered in
    /// history until the next cleanup.
    pub cache_scan_results: bool,
    /// Whether drop-pending handles may answer historical lookups.
    pub reuse_drop_pending: bool,
    /// Profiling settings of databases that never set their own.
    pub default_profile: ProfileSettings,
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn CatalogMetrics>>,
    /// Validation applied to every view definition.
    pub view_validator: ViewValidator,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            cache_scan_results: true,
            reuse_drop_pending: true,
            default_profile: ProfileSettings::default(),
            metrics: None,
            view_validator: Arc::new(default_view_validator),
        }
    }
}

impl fmt::Debug for CatalogOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogOptions")
            .field("cache_scan_results", &self.cache_scan_results)
            .field("reuse_drop_pending", &self.reuse_drop_pending)
            .field("default_profile", &self.default_profile)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl CatalogOptions {
    /// Options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables caching of durable scan results.
    pub fn cache_scan_results(mut self, enabled: bool) -> Self {
        self.cache_scan_results = enabled;
        self
    }

    /// Enables or disables reuse of drop-pending handles.
    pub fn reuse_drop_pending(mut self, enabled: bool) -> Self {
        self.reuse_drop_pending = enabled;
        self
    }

    /// Sets the profiling defaults.
    pub fn default_profile(mut self, settings: ProfileSettings) -> Self {
        self.default_profile = settings;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn CatalogMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replaces the view validator.
    pub fn view_validator(mut self, validator: ViewValidator) -> Self {
        self.view_validator = validator;
        self
    }
}

/// Serializable subset of [`CatalogOptions`], as read from a TOML file.
///
/// ```toml
/// cache_scan_results = true
/// reuse_drop_pending = true
///
/// [profile]
/// level = 1
/// filter = '{"millis": {"$gt": 100}}'
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// See [`CatalogOptions::cache_scan_results`].
    pub cache_scan_results: bool,
    /// See [`CatalogOptions::reuse_drop_pending`].
    pub reuse_drop_pending: bool,
    /// Default profiling settings.
    pub profile: ProfileConfig,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_scan_results: true,
            reuse_drop_pending: true,
            profile: ProfileConfig::default(),
        }
    }
}

/// `[profile]` section of [`CatalogConfig`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Profiling level, 0 to 2.
    pub level: i32,
    /// Filter predicate as JSON text.
    pub filter: Option<String>,
}

impl CatalogConfig {
    /// Validates the file form and builds options from it.
    pub fn to_options(&self) -> Result<CatalogOptions> {
        let filter = match &self.profile.filter {
            Some(text) => {
                let value: Value = serde_json::from_str(text)?;
                Some(Arc::new(ProfileFilter(value)))
            }
            None => None,
        };
        let profile = ProfileSettings::new(self.profile.level, filter)?;
        Ok(CatalogOptions::new()
            .cache_scan_results(self.cache_scan_results)
            .reuse_drop_pending(self.reuse_drop_pending)
            .default_profile(profile))
    }
}
