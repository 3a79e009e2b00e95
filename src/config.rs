//! Store configuration
//!
//! Settings are plain serde structs with defaults, so a store can be
//! configured in code or from a TOML file:
//!
//! ```toml
//! prefix = "snapshots"
//! object_cache_capacity = 10000
//! chunk_cache_max_chunks = 1000
//! chunk_rows = 100
//! missing_type_policy = "fail"
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// What `save` does with a snapshot whose descriptor has no sub-store yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingTypePolicy {
    /// Register a sub-store for the descriptor and save into it
    #[default]
    Create,
    /// Record the identity with a "no sub-store" marker and carry on
    Ignore,
    /// Refuse with `Error::MissingTypeSupport`
    Fail,
}

impl FromStr for MissingTypePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "ignore" => Ok(Self::Ignore),
            "fail" => Ok(Self::Fail),
            other => Err(Error::Config(format!(
                "Unknown missing type policy '{}', expected one of create, ignore, fail",
                other
            ))),
        }
    }
}

impl fmt::Display for MissingTypePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Ignore => "ignore",
            Self::Fail => "fail",
        };
        f.write_str(name)
    }
}

/// Configuration for one open `SnapshotStorage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Name prefix of the wrapper store's own columns
    pub prefix: String,
    /// Strong capacity of the weak object cache (0 disables it)
    pub object_cache_capacity: usize,
    /// Maximum number of resident column chunks (0 disables the chunk cache)
    pub chunk_cache_max_chunks: usize,
    /// Rows per chunk for snapshot columns
    pub chunk_rows: usize,
    /// Rows per chunk for derived value columns
    pub cv_chunk_rows: usize,
    /// Behaviour for snapshots of unregistered descriptors
    pub missing_type_policy: MissingTypePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: "snapshots".to_string(),
            object_cache_capacity: 10_000,
            chunk_cache_max_chunks: 1000,
            chunk_rows: 100,
            cv_chunk_rows: 100,
            missing_type_policy: MissingTypePolicy::Create,
        }
    }
}

impl StoreConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::Config(format!("Failed to parse store config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read store config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(Error::Config("prefix must not be empty".to_string()));
        }
        if self.chunk_rows == 0 || self.cv_chunk_rows == 0 {
            return Err(Error::Config("chunk rows must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Same settings with both caches switched off
    pub fn without_caches(mut self) -> Self {
        self.object_cache_capacity = 0;
        self.chunk_cache_max_chunks = 0;
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_missing_type_policy(mut self, policy: MissingTypePolicy) -> Self {
        self.missing_type_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.object_cache_capacity, 10_000);
        assert_eq!(config.chunk_cache_max_chunks, 1000);
        assert_eq!(config.missing_type_policy, MissingTypePolicy::Create);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() -> Result<()> {
        let config = StoreConfig::from_toml_str(
            r#"
            object_cache_capacity = 16
            missing_type_policy = "fail"
            "#,
        )?;
        assert_eq!(config.object_cache_capacity, 16);
        assert_eq!(config.missing_type_policy, MissingTypePolicy::Fail);
        assert_eq!(config.chunk_rows, 100);
        assert_eq!(config.prefix, "snapshots");
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            StoreConfig::from_toml_str("chunk_rows = 0"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml_str("missing_type_policy = \"sometimes\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("ignore".parse::<MissingTypePolicy>().ok(), Some(MissingTypePolicy::Ignore));
        assert!("Create".parse::<MissingTypePolicy>().is_err());
        assert_eq!(MissingTypePolicy::Fail.to_string(), "fail");
    }

    #[test]
    fn test_without_caches() {
        let config = StoreConfig::default().without_caches();
        assert_eq!(config.object_cache_capacity, 0);
        assert_eq!(config.chunk_cache_max_chunks, 0);
    }
}
