//! Cache backends.

use std::marker::PhantomData;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;

use super::CacheStore;

// ============================================================================
// MokaStore
// ============================================================================

/// Value plus the TTL it was stored with.
#[derive(Clone)]
struct Expiring<V> {
    value: V,
    ttl: Duration,
}

/// Expire each entry after the TTL given to `set`, restarting on overwrite.
struct PerEntryTtl;

impl<V> Expiry<String, Expiring<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Expiring<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Expiring<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Process-wide concurrent cache backed by moka.
pub struct MokaStore<V> {
    inner: Cache<String, Expiring<V>>,
}

impl<V> MokaStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { inner }
    }
}

impl<V> CacheStore<V> for MokaStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).map(|entry| entry.value)
    }

    fn set(&self, key: &str, value: V, ttl: Duration) {
        self.inner.insert(key.to_string(), Expiring { value, ttl });
    }

    fn forget(&self, key: &str) {
        self.inner.invalidate(key);
    }
}

// ============================================================================
// NoopStore
// ============================================================================

/// Stores nothing; every `get` misses. Used when caching is disabled.
pub struct NoopStore<V>(PhantomData<fn() -> V>);

impl<V> NoopStore<V> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<V> Default for NoopStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> CacheStore<V> for NoopStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, _key: &str) -> Option<V> {
        None
    }

    fn set(&self, _key: &str, _value: V, _ttl: Duration) {}

    fn forget(&self, _key: &str) {}
}
