//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```json
//! {
//!   "cache": { "enabled": true, "ttl_secs": 3600, "entity_ttl_secs": 3600, "prefix": "unit_conversion_" },
//!   "fallback_locale": "en",
//!   "base_units": { "mass": "g", "volume": "L", "length": "m" }
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// ============================================================================
// DEFAULT FUNCTIONS
// ============================================================================

fn default_enabled() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_entity_ttl_secs() -> Option<u64> {
    Some(3600)
}

fn default_prefix() -> String {
    "unit_conversion_".to_string()
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_fallback_locale() -> String {
    "en".to_string()
}

fn default_base_units() -> BTreeMap<String, String> {
    [("mass", "g"), ("volume", "L"), ("length", "m")]
        .into_iter()
        .map(|(t, code)| (t.to_string(), code.to_string()))
        .collect()
}

// ============================================================================
// CACHE CONFIG
// ============================================================================

/// Cross-request cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false, unit records and conversion maps always come from storage.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// TTL for unit records, in seconds.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// TTL for per-entity conversion maps. `null` falls back to `ttl_secs`.
    #[serde(default = "default_entity_ttl_secs")]
    pub entity_ttl_secs: Option<u64>,

    /// Prefix for every cache key.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Capacity of each in-process cache tier.
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            ttl_secs: default_ttl_secs(),
            entity_ttl_secs: default_entity_ttl_secs(),
            prefix: default_prefix(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    pub fn unit_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_secs.unwrap_or(self.ttl_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.max_entries == 0 {
            return Err(Error::InvalidConfig("cache.max_entries must be > 0 when enabled".into()));
        }
        if self.prefix.is_empty() {
            return Err(Error::InvalidConfig("cache.prefix must not be empty".into()));
        }
        Ok(())
    }
}

// ============================================================================
// CONVERSION CONFIG
// ============================================================================

/// Top-level configuration for [`UnitConversion`](crate::UnitConversion).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    /// Locale used for display names when no translation exists for the
    /// requested one.
    #[serde(default = "default_fallback_locale")]
    pub fallback_locale: String,

    /// Locale used when the caller does not ask for one.
    #[serde(default)]
    pub default_locale: Option<String>,

    /// Measurement type → code of its value-1 standard unit.
    #[serde(default = "default_base_units")]
    pub base_units: BTreeMap<String, String>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            fallback_locale: default_fallback_locale(),
            default_locale: None,
            base_units: default_base_units(),
        }
    }
}

impl ConversionConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()
    }

    /// Locale to use for display: explicit, then `default_locale`, then
    /// `fallback_locale`.
    pub fn locale<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .or(self.default_locale.as_deref())
            .unwrap_or(&self.fallback_locale)
    }
}
