//! Database configuration via `quarry.toml`
//!
//! On first open a commented default `quarry.toml` is created in the data
//! directory. To change settings, edit the file and reopen the database.

use crate::worker::{MapErrorPolicy, WorkerOptions};
use quarry_core::{Error, Result};
use quarry_storage::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the database data directory.
pub const CONFIG_FILE_NAME: &str = "quarry.toml";

fn default_durability_str() -> String {
    "standard".to_string()
}

fn default_map_batch_size() -> usize {
    1024
}

fn default_on_map_error() -> String {
    "skip".to_string()
}

fn default_max_stored_errors() -> usize {
    100
}

/// `[indexing]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexingConfig {
    /// Items per map batch, 0 for unbounded
    #[serde(default = "default_map_batch_size")]
    pub map_batch_size: usize,
    /// Optional time budget per batch in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_duration_ms: Option<u64>,
    /// `"skip"` or `"abort"`
    #[serde(default = "default_on_map_error")]
    pub on_map_error: String,
    /// Error log capacity per index
    #[serde(default = "default_max_stored_errors")]
    pub max_stored_errors: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            map_batch_size: default_map_batch_size(),
            max_batch_duration_ms: None,
            on_map_error: default_on_map_error(),
            max_stored_errors: default_max_stored_errors(),
        }
    }
}

/// Database configuration loaded from `quarry.toml`.
///
/// # Example
///
/// ```toml
/// durability = "standard"
///
/// [indexing]
/// map_batch_size = 1024
/// on_map_error = "skip"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarryConfig {
    /// Durability mode: `"standard"` or `"always"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Indexing pipeline settings
    #[serde(default)]
    pub indexing: IndexingConfig,
}

impl Default for QuarryConfig {
    fn default() -> Self {
        Self {
            durability: default_durability_str(),
            indexing: IndexingConfig::default(),
        }
    }
}

impl QuarryConfig {
    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the string is not `"standard"` or `"always"`.
    pub fn durability_mode(&self) -> Result<DurabilityMode> {
        match self.durability.as_str() {
            "standard" => Ok(DurabilityMode::Standard),
            "always" => Ok(DurabilityMode::Always),
            other => Err(Error::Config(format!(
                "invalid durability mode '{}' in {}, expected \"standard\" or \"always\"",
                other, CONFIG_FILE_NAME
            ))),
        }
    }

    /// Parse `indexing.on_map_error`.
    pub fn map_error_policy(&self) -> Result<MapErrorPolicy> {
        MapErrorPolicy::from_config_str(&self.indexing.on_map_error)
    }

    /// Worker options described by the `[indexing]` section.
    pub fn worker_options(&self) -> Result<WorkerOptions> {
        let page_size = match self.indexing.map_batch_size {
            0 => None,
            n => Some(n),
        };
        Ok(WorkerOptions {
            page_size,
            max_batch_duration: self.indexing.max_batch_duration_ms.map(Duration::from_millis),
            on_map_error: self.map_error_policy()?,
            max_stored_errors: self.indexing.max_stored_errors,
        })
    }

    /// Check every field that has a restricted spelling.
    pub fn validate(&self) -> Result<()> {
        self.durability_mode()?;
        self.map_error_policy()?;
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Quarry database configuration
#
# Durability mode: "standard" (default) or "always"
#   "standard" = journal flushed on every commit, fsync left to the OS
#   "always"   = fsync every commit
durability = "standard"

[indexing]
# Documents per map batch; each batch is one write transaction (0 = unbounded)
map_batch_size = 1024

# Cut a batch short after this many milliseconds (default: no limit)
# max_batch_duration_ms = 500

# Map function failures: "skip" records the error and continues,
# "abort" stops the cycle after committing what preceded the failure
on_map_error = "skip"

# Failures kept in each index's error log
max_stored_errors = 100
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: QuarryConfig = toml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_standard() {
        let config = QuarryConfig::default();
        assert_eq!(config.durability_mode().unwrap(), DurabilityMode::Standard);
        assert_eq!(config.worker_options().unwrap(), WorkerOptions::default());
    }

    #[test]
    fn default_toml_matches_default() {
        let config: QuarryConfig = toml::from_str(QuarryConfig::default_toml()).unwrap();
        assert_eq!(config, QuarryConfig::default());
    }

    #[test]
    fn parse_indexing_section() {
        let config: QuarryConfig = toml::from_str(
            r#"
durability = "always"

[indexing]
map_batch_size = 0
max_batch_duration_ms = 250
on_map_error = "abort"
"#,
        )
        .unwrap();
        assert_eq!(config.durability_mode().unwrap(), DurabilityMode::Always);
        let options = config.worker_options().unwrap();
        assert_eq!(options.page_size, None);
        assert_eq!(options.max_batch_duration, Some(Duration::from_millis(250)));
        assert_eq!(options.on_map_error, MapErrorPolicy::Abort);
        assert_eq!(options.max_stored_errors, 100);
    }

    #[test]
    fn invalid_values_rejected() {
        let config: QuarryConfig = toml::from_str("durability = \"turbo\"").unwrap();
        assert!(matches!(config.durability_mode(), Err(Error::Config(_))));

        let config: QuarryConfig = toml::from_str("[indexing]\non_map_error = \"retry\"").unwrap();
        assert!(config.worker_options().is_err());
    }

    #[test]
    fn write_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        QuarryConfig::write_default_if_missing(&path).unwrap();
        assert!(path.exists());
        assert_eq!(QuarryConfig::from_file(&path).unwrap(), QuarryConfig::default());
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "durability = \"always\"\n").unwrap();

        QuarryConfig::write_default_if_missing(&path).unwrap();
        let config = QuarryConfig::from_file(&path).unwrap();
        assert_eq!(config.durability, "always");
        assert_eq!(config.indexing, IndexingConfig::default());
    }

    #[test]
    fn from_file_rejects_bad_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "durability = [").unwrap();
        assert!(matches!(QuarryConfig::from_file(&path), Err(Error::Config(_))));

        std::fs::write(&path, "[indexing]\non_map_error = \"never\"\n").unwrap();
        assert!(QuarryConfig::from_file(&path).is_err());
    }

    #[test]
    fn write_to_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = QuarryConfig::default();
        config.indexing.map_batch_size = 16;
        config.indexing.max_batch_duration_ms = Some(10);
        config.write_to_file(&path).unwrap();
        assert_eq!(QuarryConfig::from_file(&path).unwrap(), config);
    }
}
