//! # unitconv: Per-entity unit conversion with closure expansion
//!
//! Users declare a few conversions per entity ("1 ctn = 6 bag",
//! "1 bag = 1.8 twct"); the crate derives every reachable pair through a
//! graph closure, persists the full set, and answers conversions from a
//! two-tier cache.
//!
//! ## Design Principles
//!
//! 1. **Trait-first**: `UnitCatalog` + `ConversionStore` are the contract between
//!    the conversion core and storage
//! 2. **Clean DTOs**: `Unit`, `ConversionEdge`, `ConversionMap` cross all boundaries
//! 3. **Pure core**: graph building and closure touch no storage
//! 4. **Atomic rewrites**: one transaction per expansion, one lock per entity
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use unitconv::{ConversionRequest, EntityRef, PrimaryConversion, Unit, UnitConversion};
//!
//! # async fn example() -> unitconv::Result<()> {
//! let uc = UnitConversion::open_memory([
//!     Unit::new("ctn", "count"),
//!     Unit::new("bag", "count"),
//!     Unit::standard("twct", "mass", 600.0),
//!     Unit::standard("kg", "mass", 1000.0),
//! ])
//! .await?;
//!
//! let product = EntityRef::new("product", 42);
//! uc.expand(&product, &[
//!     PrimaryConversion::new("ctn", "bag", 6.0),
//!     PrimaryConversion::new("bag", "twct", 1.8),
//! ])
//! .await?;
//!
//! let kg = uc
//!     .convert(&ConversionRequest::new(2.0, "ctn", "kg").for_entity(product))
//!     .await?;
//! assert!((kg - 12.96).abs() < 1e-9);
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage Backends
//!
//! | Backend | Description |
//! |---------|-------------|
//! | Memory | In-memory catalog and conversion table for testing/embedding |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod tx;
pub mod storage;
pub mod graph;
pub mod cache;
pub mod config;
pub mod expand;
pub mod resolve;
pub mod entity;

use std::sync::Arc;

// ============================================================================
// Re-exports
// ============================================================================

pub use model::{
    Unit, EntityRef, ConversionEdge, ConversionId, ConversionMap,
    ConversionRequest, NewConversion, PrimaryConversion,
};
pub use storage::{StorageBackend, UnitCatalog, ConversionStore, UnitFilter, MemoryBackend};
pub use tx::{Transaction, TxMode, TxId};
pub use cache::{CacheLayer, CacheStore};
pub use config::{CacheConfig, ConversionConfig};
pub use expand::ExpansionSummary;
pub use resolve::Session;
pub use entity::EntityConversions;

use expand::EntityLocks;

// ============================================================================
// Top-level handle
// ============================================================================

/// The primary entry point. Wraps a storage backend with the cache layer,
/// configuration and per-entity write locks.
pub struct UnitConversion<B: StorageBackend> {
    backend: B,
    cache: CacheLayer,
    config: ConversionConfig,
    locks: EntityLocks,
}

impl<B: StorageBackend> UnitConversion<B> {
    /// Default configuration: caching on, one hour TTL.
    pub fn new(backend: B) -> Self {
        let config = ConversionConfig::default();
        Self {
            backend,
            cache: CacheLayer::from_config(&config.cache),
            config,
            locks: EntityLocks::default(),
        }
    }

    pub fn with_config(backend: B, config: ConversionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            cache: CacheLayer::from_config(&config.cache),
            config,
            locks: EntityLocks::default(),
        })
    }

    /// Replace the cache layer (e.g. with stores shared between handles).
    pub fn with_cache_layer(mut self, cache: CacheLayer) -> Self {
        self.cache = cache;
        self
    }

    /// Access the underlying backend (for advanced use).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    // ========================================================================
    // Conversion
    // ========================================================================

    /// Start a logical operation with its own conversion-map memo.
    pub fn session(&self) -> Session<'_, B> {
        Session::new(self)
    }

    /// One-shot conversion in a fresh session.
    pub async fn convert(&self, request: &ConversionRequest) -> Result<f64> {
        self.session().convert(request).await
    }

    /// Replace `entity`'s records with the closure of `primaries`.
    pub async fn expand(
        &self,
        entity: &EntityRef,
        primaries: &[PrimaryConversion],
    ) -> Result<ExpansionSummary> {
        let _guard = self.locks.acquire(entity).await;
        let summary = expand::expand(&self.backend, entity, primaries).await?;
        self.cache.forget_entity(entity);
        Ok(summary)
    }

    /// The entity's flattened active conversions, through the cross-request cache.
    pub async fn conversion_map(&self, entity: &EntityRef) -> Result<Arc<ConversionMap>> {
        self.session().conversion_map(entity).await
    }

    /// Per-entity operations.
    pub fn entity(&self, entity: EntityRef) -> EntityConversions<'_, B> {
        EntityConversions::new(self, entity)
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Units of `unit_type` (all types when `None`), by `(sort_order, code)`.
    pub async fn units(&self, unit_type: Option<&str>, active_only: bool) -> Result<Vec<Unit>> {
        let filter = UnitFilter {
            unit_type: unit_type.map(str::to_string),
            active_only,
            standard_only: false,
        };
        self.backend.list_units(&filter).await
    }

    /// Active standard units of `unit_type` (all types when `None`).
    pub async fn standard_units(&self, unit_type: Option<&str>) -> Result<Vec<Unit>> {
        let filter = UnitFilter {
            unit_type: unit_type.map(str::to_string),
            active_only: true,
            standard_only: true,
        };
        self.backend.list_units(&filter).await
    }

    /// The configured base unit of `unit_type`, if it is an active catalog unit.
    pub async fn base_unit(&self, unit_type: &str) -> Result<Option<Unit>> {
        let Some(code) = self.config.base_units.get(unit_type) else {
            return Ok(None);
        };
        Ok(self
            .cached_unit(code)
            .await?
            .filter(|u| u.is_active && u.unit_type == unit_type))
    }

    /// Forget the cached record of every catalog unit. Returns the number of
    /// keys forgotten.
    pub async fn clear_unit_cache(&self) -> Result<usize> {
        let units = self.backend.list_units(&UnitFilter::default()).await?;
        for unit in &units {
            self.cache.forget_unit(&unit.code);
        }
        tracing::info!(units = units.len(), "unit cache cleared");
        Ok(units.len())
    }

    /// Display name of `code` in `locale` (configured default when `None`).
    pub async fn display_name(&self, code: &str, locale: Option<&str>) -> Result<String> {
        let unit = self.require_unit(code).await?;
        Ok(unit
            .name(self.config.locale(locale), &self.config.fallback_locale)
            .to_string())
    }

    /// `"{code} {name}"` for `code` in `locale`.
    pub async fn unit_label(&self, code: &str, locale: Option<&str>) -> Result<String> {
        let unit = self.require_unit(code).await?;
        Ok(unit.label(self.config.locale(locale), &self.config.fallback_locale))
    }

    async fn cached_unit(&self, code: &str) -> Result<Option<Unit>> {
        let backend = &self.backend;
        self.cache.unit(code, || backend.find_unit(code)).await
    }

    async fn require_unit(&self, code: &str) -> Result<Unit> {
        self.cached_unit(code)
            .await?
            .ok_or_else(|| Error::UnitNotFound(code.to_string()))
    }
}

/// In-memory catalog and conversion table for testing and embedding.
impl UnitConversion<MemoryBackend> {
    pub async fn open_memory(units: impl IntoIterator<Item = Unit>) -> Result<Self> {
        Ok(Self::new(MemoryBackend::with_units(units)))
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid conversion: {0}")]
    InvalidConversion(String),

    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("No conversion path found from {from} to {to}")]
    ConversionNotFound { from: String, to: String },

    #[error("Cannot convert between different types: {from} and {to}")]
    UnitTypeMismatch { from: String, to: String },

    #[error("Non-standard unit requires an entity conversion: {0}")]
    NonStandardUnit(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Transaction error: {0}")]
    TxError(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn catalog() -> Vec<Unit> {
        vec![
            Unit::standard("g", "mass", 1.0).with_sort_order(2).with_translation("en", "gram"),
            Unit::standard("kg", "mass", 1000.0)
                .with_sort_order(1)
                .with_translation("en", "kilogram")
                .with_translation("zh_TW", "公斤"),
            Unit::standard("lb", "mass", 453.59237).inactive(),
            Unit::standard("L", "volume", 1.0),
            Unit::new("bag", "count").with_sort_order(5),
        ]
    }

    #[tokio::test]
    async fn test_listings() {
        let uc = UnitConversion::open_memory(catalog()).await.unwrap();

        let mass: Vec<String> = uc.units(Some("mass"), false).await.unwrap().into_iter().map(|u| u.code).collect();
        assert_eq!(mass, vec!["lb", "kg", "g"]);

        let active: Vec<String> = uc.units(Some("mass"), true).await.unwrap().into_iter().map(|u| u.code).collect();
        assert_eq!(active, vec!["kg", "g"]);

        let standard: Vec<String> = uc.standard_units(None).await.unwrap().into_iter().map(|u| u.code).collect();
        assert_eq!(standard, vec!["L", "kg", "g"]);
    }

    #[tokio::test]
    async fn test_base_unit() {
        let uc = UnitConversion::open_memory(catalog()).await.unwrap();
        assert_eq!(uc.base_unit("mass").await.unwrap().map(|u| u.code), Some("g".to_string()));
        assert_eq!(uc.base_unit("volume").await.unwrap().map(|u| u.code), Some("L".to_string()));
        // configured as "m" but not in the catalog
        assert!(uc.base_unit("length").await.unwrap().is_none());
        assert!(uc.base_unit("count").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_display_names() {
        let uc = UnitConversion::open_memory(catalog()).await.unwrap();
        assert_eq!(uc.display_name("kg", Some("zh_TW")).await.unwrap(), "公斤");
        assert_eq!(uc.display_name("kg", Some("ja")).await.unwrap(), "kilogram");
        assert_eq!(uc.display_name("bag", None).await.unwrap(), "bag");
        assert_eq!(uc.unit_label("g", None).await.unwrap(), "g gram");
        assert!(matches!(uc.display_name("ton", None).await, Err(Error::UnitNotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_unit_cache_reloads() {
        let backend = MemoryBackend::with_units(catalog());
        let uc = UnitConversion::new(backend.clone());

        uc.display_name("kg", None).await.unwrap();
        backend.put_unit(Unit::standard("kg", "mass", 1000.0).with_translation("en", "kilo"));
        assert_eq!(uc.display_name("kg", None).await.unwrap(), "kilogram");

        assert_eq!(uc.clear_unit_cache().await.unwrap(), 5);
        assert_eq!(uc.display_name("kg", None).await.unwrap(), "kilo");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ConversionConfig {
            cache: CacheConfig { prefix: String::new(), ..CacheConfig::default() },
            ..ConversionConfig::default()
        };
        assert!(matches!(
            UnitConversion::with_config(MemoryBackend::new(), config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
