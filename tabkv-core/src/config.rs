//! Configuration types

use crate::error::{ConfigError, TabKvResult};
use crate::pattern;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serializable cache settings, as loaded from a host's configuration.
///
/// `flush_delay_ms` is required; it stays optional here so that a missing
/// value is reported as [`ConfigError::MissingRequired`] rather than a
/// generic deserialization failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Delay between the first buffered write and the automatic flush.
    #[serde(default)]
    pub flush_delay_ms: Option<u64>,
    /// Initial cache-inclusion patterns.
    #[serde(default)]
    pub cached_keys: Vec<String>,
}

impl CacheSettings {
    /// Parse settings from a JSON document and validate them.
    pub fn from_json(json: &str) -> TabKvResult<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read settings from environment variables.
    ///
    /// Environment variables:
    /// - `TABKV_FLUSH_DELAY_MS`: flush delay in milliseconds (required)
    /// - `TABKV_CACHED_KEYS`: comma-separated cache-inclusion patterns
    pub fn from_env() -> TabKvResult<Self> {
        let flush_delay_ms = match std::env::var("TABKV_FLUSH_DELAY_MS") {
            Ok(raw) => Some(raw.trim().parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue {
                    field: "flush_delay_ms".to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?),
            Err(_) => None,
        };
        let cached_keys = std::env::var("TABKV_CACHED_KEYS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let settings = Self {
            flush_delay_ms,
            cached_keys,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// The configured flush delay.
    pub fn flush_delay(&self) -> Result<Duration, ConfigError> {
        match self.flush_delay_ms {
            None => Err(ConfigError::MissingRequired {
                field: "flush_delay_ms".to_string(),
            }),
            Some(0) => Err(ConfigError::InvalidValue {
                field: "flush_delay_ms".to_string(),
                value: "0".to_string(),
                reason: "flush_delay_ms must be greater than 0".to_string(),
            }),
            Some(ms) => Ok(Duration::from_millis(ms)),
        }
    }

    /// Validate the settings.
    ///
    /// Validates:
    /// - flush_delay_ms is present and positive
    /// - every cached key pattern is well formed
    pub fn validate(&self) -> TabKvResult<()> {
        self.flush_delay()?;
        for p in &self.cached_keys {
            pattern::validate(p)?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
