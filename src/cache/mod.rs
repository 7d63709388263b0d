//! # Cache Layer
//!
//! Two tiers for conversion maps, one for unit records:
//!
//! ```text
//! Session (RequestMemo, one logical operation)
//!   → CacheLayer.maps (cross-request, TTL, explicit forget on rewrite)
//!     → ConversionStore
//! CacheLayer.units (cross-request, TTL only) → UnitCatalog
//! ```
//!
//! TTL bounds staleness. Correctness for conversion maps comes from
//! forgetting the entity's key whenever its records are rewritten. A map
//! loaded while its key was being forgotten is returned to its caller but
//! never stored.

pub mod store;

use std::future::Future;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::model::{ConversionMap, EntityRef, Unit};
use crate::Result;

pub use store::{MokaStore, NoopStore};

// ============================================================================
// CacheStore port
// ============================================================================

/// Key/value cache with per-entry TTL.
pub trait CacheStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;
    fn set(&self, key: &str, value: V, ttl: Duration);
    fn forget(&self, key: &str);
}

/// Return the cached value for `key`, or run `producer` and cache a `Some`
/// result. `None` results are not cached.
pub async fn remember<V, F, Fut>(
    store: &dyn CacheStore<V>,
    key: &str,
    ttl: Duration,
    producer: F,
) -> Result<Option<V>>
where
    V: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<V>>>,
{
    if let Some(hit) = store.get(key) {
        tracing::debug!(key, "cache hit");
        return Ok(Some(hit));
    }
    tracing::debug!(key, "cache miss");
    let produced = producer().await?;
    if let Some(value) = &produced {
        store.set(key, value.clone(), ttl);
    }
    Ok(produced)
}

// ============================================================================
// Keys
// ============================================================================

/// Deterministic cache keys under a configurable prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// `{prefix}unit_{code}`
    pub fn unit(&self, code: &str) -> String {
        format!("{}unit_{}", self.prefix, code)
    }

    /// `{prefix}entity_{kind}_{id}`
    pub fn entity(&self, entity: &EntityRef) -> String {
        format!("{}entity_{}_{}", self.prefix, entity.kind, entity.id)
    }
}

// ============================================================================
// CacheLayer
// ============================================================================

const GENERATION_STRIPES: usize = 64;

/// The cross-request tier: unit records and per-entity conversion maps.
pub struct CacheLayer {
    keys: CacheKeys,
    units: Arc<dyn CacheStore<Unit>>,
    maps: Arc<dyn CacheStore<Arc<ConversionMap>>>,
    unit_ttl: Duration,
    entity_ttl: Duration,
    /// Bumped by `forget_entity`, striped by key hash.
    generations: [AtomicU64; GENERATION_STRIPES],
    hasher: DefaultHashBuilder,
}

impl CacheLayer {
    /// moka-backed stores, or no-op stores when caching is disabled.
    pub fn from_config(config: &CacheConfig) -> Self {
        if config.enabled {
            Self::with_stores(
                config,
                Arc::new(MokaStore::<Unit>::new(config.max_entries)),
                Arc::new(MokaStore::<Arc<ConversionMap>>::new(config.max_entries)),
            )
        } else {
            tracing::info!("unit conversion cache disabled, every lookup goes to storage");
            Self::with_stores(
                config,
                Arc::new(NoopStore::<Unit>::new()),
                Arc::new(NoopStore::<Arc<ConversionMap>>::new()),
            )
        }
    }

    /// Inject custom stores (e.g. a shared external cache).
    pub fn with_stores(
        config: &CacheConfig,
        units: Arc<dyn CacheStore<Unit>>,
        maps: Arc<dyn CacheStore<Arc<ConversionMap>>>,
    ) -> Self {
        Self {
            keys: CacheKeys::new(config.prefix.clone()),
            units,
            maps,
            unit_ttl: config.unit_ttl(),
            entity_ttl: config.entity_ttl(),
            generations: std::array::from_fn(|_| AtomicU64::new(0)),
            hasher: DefaultHashBuilder::default(),
        }
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    /// Cached unit record, loading through `load` on a miss.
    pub async fn unit<F, Fut>(&self, code: &str, load: F) -> Result<Option<Unit>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Unit>>>,
    {
        remember(self.units.as_ref(), &self.keys.unit(code), self.unit_ttl, load).await
    }

    /// Cached conversion map for `entity`, building through `load` on a miss.
    ///
    /// The loaded map is stored only if `forget_entity` was not called for
    /// the entity while `load` ran.
    pub async fn conversion_map<F, Fut>(&self, entity: &EntityRef, load: F) -> Result<Arc<ConversionMap>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConversionMap>>,
    {
        let key = self.keys.entity(entity);
        if let Some(hit) = self.maps.get(&key) {
            tracing::debug!(key = %key, "cache hit");
            return Ok(hit);
        }
        tracing::debug!(key = %key, "cache miss");

        let generation = self.generation(&key).load(Ordering::Acquire);
        let map = Arc::new(load().await?);
        if self.generation(&key).load(Ordering::Acquire) == generation {
            self.maps.set(&key, map.clone(), self.entity_ttl);
        } else {
            tracing::debug!(entity = %entity, "records rewritten during load, map not cached");
        }
        Ok(map)
    }

    pub fn forget_unit(&self, code: &str) {
        self.units.forget(&self.keys.unit(code));
    }

    pub fn forget_entity(&self, entity: &EntityRef) {
        tracing::debug!(entity = %entity, "conversion map cache forgotten");
        let key = self.keys.entity(entity);
        self.generation(&key).fetch_add(1, Ordering::AcqRel);
        self.maps.forget(&key);
    }

    fn generation(&self, key: &str) -> &AtomicU64 {
        let stripe = self.hasher.hash_one(key) as usize % GENERATION_STRIPES;
        &self.generations[stripe]
    }
}

// ============================================================================
// RequestMemo
// ============================================================================

/// Conversion maps memoized for one logical operation.
///
/// Owned by a [`Session`](crate::resolve::Session); dropped with it.
#[derive(Default)]
pub struct RequestMemo {
    maps: Mutex<HashMap<EntityRef, Arc<ConversionMap>>>,
}

impl RequestMemo {
    pub fn get(&self, entity: &EntityRef) -> Option<Arc<ConversionMap>> {
        self.maps.lock().get(entity).cloned()
    }

    pub fn insert(&self, entity: &EntityRef, map: Arc<ConversionMap>) {
        self.maps.lock().insert(entity.clone(), map);
    }

    pub fn forget(&self, entity: &EntityRef) {
        self.maps.lock().remove(entity);
    }
}
