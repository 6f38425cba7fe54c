//! Engine configuration parsing and validation.
//!
//! Tunables are deliberately few: the allocator's behavior is mostly
//! fixed by product attributes and consumer facts. Configuration files
//! are TOML with every field optional.

use serde::{Deserialize, Serialize};
use thiserror::Error;


/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed configuration is inconsistent.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Allocation engine tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How many times a reservation lost to a concurrent bind is
    /// retried against a refreshed snapshot before the product is
    /// reported uncovered.
    pub bind_retry_limit: u32,

    /// Socket count assumed for consumers missing the socket fact.
    pub default_socket_count: u32,

    /// Upper bound on entitlements created by a single heal request.
    pub max_entitlements_per_request: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_retry_limit: 1,
            default_socket_count: 1,
            max_entitlements_per_request: 64,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or
    /// validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the TOML is invalid or fails
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] when a bound is zero that
    /// must not be.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_socket_count == 0 {
            return Err(ConfigError::Validation(
                "default_socket_count must be positive".to_string(),
            ));
        }
        if self.max_entitlements_per_request == 0 {
            return Err(ConfigError::Validation(
                "max_entitlements_per_request must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
