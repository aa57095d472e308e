//! Driver repository catalog
//!
//! Indexes on-disk driver artifacts by database type. The repository is a
//! two-level tree: one subdirectory per [`DbType`] (named by its lowercase
//! identifier), containing the vendor driver artifact files. The index is
//! built once at scan time, sorted by artifact name for deterministic
//! default selection, and read-only thereafter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::descriptor::DbType;
use crate::error::{Error, Result};

/// Environment variable pointing at the driver artifact repository root
pub const DRIVER_DIR_ENV: &str = "FLOWLINK_DRIVER_DIR";
/// Environment variable pointing at the vendor plugin repository root
pub const PLUGIN_DIR_ENV: &str = "FLOWLINK_PLUGIN_DIR";

/// Repository roots, read once at catalog scan time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogConfig {
    /// Root of the driver artifact tree
    pub artifact_root: PathBuf,
    /// Root of the vendor plugin tree
    pub plugin_root: PathBuf,
}

impl CatalogConfig {
    /// Create a config from explicit roots
    pub fn new(artifact_root: impl Into<PathBuf>, plugin_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
            plugin_root: plugin_root.into(),
        }
    }

    /// Read both roots from the environment
    pub fn from_env() -> Result<Self> {
        let artifact_root = std::env::var_os(DRIVER_DIR_ENV)
            .ok_or_else(|| Error::config(format!("{DRIVER_DIR_ENV} is not set")))?;
        let plugin_root = std::env::var_os(PLUGIN_DIR_ENV)
            .ok_or_else(|| Error::config(format!("{PLUGIN_DIR_ENV} is not set")))?;
        Ok(Self::new(
            PathBuf::from(artifact_root),
            PathBuf::from(plugin_root),
        ))
    }
}

/// Read-only index of on-disk driver artifacts, keyed by database type.
///
/// A missing or unreadable repository root yields an empty catalog rather
/// than an error; resolution then falls through to per-type defaults.
pub struct DriverCatalog {
    index: BTreeMap<DbType, BTreeMap<String, PathBuf>>,
    plugin_root: PathBuf,
}

impl DriverCatalog {
    /// Scan the repository roots and build the index.
    pub fn scan(config: &CatalogConfig) -> Self {
        let mut index: BTreeMap<DbType, BTreeMap<String, PathBuf>> = BTreeMap::new();

        let entries = match std::fs::read_dir(&config.artifact_root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    root = %config.artifact_root.display(),
                    error = %e,
                    "driver repository root unreadable, starting with empty catalog"
                );
                return Self {
                    index,
                    plugin_root: config.plugin_root.clone(),
                };
            }
        };

        for entry in entries.flatten() {
            let type_dir = entry.path();
            if !type_dir.is_dir() {
                continue;
            }
            let Some(dir_name) = type_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(db_type) = dir_name.parse::<DbType>() else {
                tracing::debug!(dir = dir_name, "skipping unrecognized repository directory");
                continue;
            };

            let inner = index.entry(db_type).or_default();
            if let Ok(artifacts) = std::fs::read_dir(&type_dir) {
                for artifact in artifacts.flatten() {
                    let path = artifact.path();
                    if !path.is_file() {
                        continue;
                    }
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        inner.insert(name.to_string(), path.clone());
                    }
                }
            }
            tracing::info!(
                db_type = %db_type,
                artifacts = inner.len(),
                "cataloged driver artifacts"
            );
        }

        Self {
            index,
            plugin_root: config.plugin_root.clone(),
        }
    }

    /// Number of cataloged artifacts for a type
    pub fn artifact_count(&self, db_type: DbType) -> usize {
        self.index.get(&db_type).map_or(0, BTreeMap::len)
    }

    /// Whether the catalog has no entries at all
    pub fn is_empty(&self) -> bool {
        self.index.values().all(BTreeMap::is_empty)
    }

    /// Default driver artifact for a type: the lexicographically-first
    /// cataloged entry.
    ///
    /// Session-engine types with no cataloged entries fall back to the
    /// environment-derived `<engine home>/jdbc` directory; any other type
    /// with no entries fails with `NotFound`.
    pub fn default_artifact(&self, db_type: DbType) -> Result<PathBuf> {
        if let Some(inner) = self.index.get(&db_type) {
            if let Some((name, path)) = inner.iter().next() {
                tracing::debug!(db_type = %db_type, artifact = name, "selected default driver artifact");
                return Ok(path.clone());
            }
        }

        if db_type.is_session_engine() {
            if let Some(fallback) = session_engine_env_path() {
                tracing::info!(
                    db_type = %db_type,
                    path = %fallback.display(),
                    "catalog empty, using environment-derived driver path"
                );
                return Ok(fallback);
            }
        }

        Err(Error::not_found(format!(
            "no driver artifact cataloged for '{db_type}'"
        )))
    }

    /// Vendor plugin directory for a type: `<plugin_root>/<db_type>`
    pub fn plugin_path(&self, db_type: DbType) -> PathBuf {
        self.plugin_root.join(db_type.as_str())
    }
}

/// Environment-derived driver path for session engines: `$HIVE_HOME/jdbc`,
/// falling back to `$HIVE_CLIENT/jdbc`.
fn session_engine_env_path() -> Option<PathBuf> {
    std::env::var_os("HIVE_HOME")
        .or_else(|| std::env::var_os("HIVE_CLIENT"))
        .map(|home| Path::new(&home).join("jdbc"))
}
