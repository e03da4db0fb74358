use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strata::options::CatalogConfig;
use thiserror::Error;

/// Contents of `strata.toml`.
///
/// ```toml
/// dump = "/var/lib/strata/catalog.json"
///
/// [catalog]
/// cache_scan_results = false
///
/// [catalog.profile]
/// level = 1
/// ```
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CliConfig {
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(default)]
    dump: Option<PathBuf>,
    #[serde(default)]
    catalog: CatalogConfig,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let mut config = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => CliConfig::default(),
        };
        config.path = path;
        Ok(config)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_dump(&self) -> Option<&PathBuf> {
        self.dump.as_ref()
    }

    pub fn catalog(&self) -> &CatalogConfig {
        &self.catalog
    }
}

fn read_file(path: &Path) -> Result<CliConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("no catalog dump given; pass --dump or set `dump` in the config file")]
    NoDump,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("strata").join("strata.toml"))
}
