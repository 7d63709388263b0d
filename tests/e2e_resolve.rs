//! End-to-end integration tests for conversion resolution.
//!
//! Covers the standard-unit path, per-entity records, the one-hop fallback for
//! records written without expansion, and cache invalidation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use approx::assert_relative_eq;
use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::Notify;
use unitconv::storage::memory::MemoryTx;
use unitconv::{
    CacheConfig, ConversionConfig, ConversionEdge, ConversionRequest, ConversionStore, EntityRef,
    Error, MemoryBackend, NewConversion, PrimaryConversion, Result, TxMode, Unit, UnitCatalog,
    UnitConversion, UnitFilter,
};

fn catalog() -> Vec<Unit> {
    vec![
        Unit::new("ctn", "count"),
        Unit::new("bag", "count"),
        Unit::standard("g", "mass", 1.0),
        Unit::standard("kg", "mass", 1000.0),
        Unit::standard("twct", "mass", 600.0),
        Unit::standard("L", "volume", 1.0),
        Unit::standard("mL", "volume", 0.001),
    ]
}

fn product() -> EntityRef {
    EntityRef::new("product", 42)
}

async fn expanded() -> (MemoryBackend, UnitConversion<MemoryBackend>) {
    let backend = MemoryBackend::with_units(catalog());
    let uc = UnitConversion::new(backend.clone());
    uc.expand(
        &product(),
        &[
            PrimaryConversion::new("ctn", "bag", 6.0),
            PrimaryConversion::new("bag", "twct", 1.8),
        ],
    )
    .await
    .unwrap();
    (backend, uc)
}

// ============================================================================
// 1. Standard units need no entity
// ============================================================================

#[tokio::test]
async fn test_standard_conversion() {
    let uc = UnitConversion::open_memory(catalog()).await.unwrap();

    let q = uc.convert(&ConversionRequest::new(2.5, "kg", "g")).await.unwrap();
    assert_relative_eq!(q, 2500.0);

    let q = uc.convert(&ConversionRequest::new(3.0, "twct", "kg")).await.unwrap();
    assert_relative_eq!(q, 1.8);

    let q = uc.convert(&ConversionRequest::new(250.0, "mL", "L")).await.unwrap();
    assert_relative_eq!(q, 0.25);
}

#[tokio::test]
async fn test_same_unit_returns_quantity_without_lookup() {
    let backend = MemoryBackend::new();
    let uc = UnitConversion::new(backend.clone());

    let q = uc
        .convert(&ConversionRequest::new(7.25, "ctn", "ctn").for_entity(product()))
        .await
        .unwrap();
    assert_eq!(q, 7.25);
    assert_eq!(backend.catalog_lookups(), 0);
    assert_eq!(backend.store_reads(), 0);
}

#[tokio::test]
async fn test_cross_type_is_not_found() {
    let (_, uc) = expanded().await;

    let err = uc.convert(&ConversionRequest::new(1.0, "kg", "L")).await;
    assert!(matches!(err, Err(Error::ConversionNotFound { from, to }) if from == "kg" && to == "L"));

    let err = uc
        .convert(&ConversionRequest::new(1.0, "ctn", "mL").for_entity(product()))
        .await;
    assert!(matches!(err, Err(Error::ConversionNotFound { .. })));
}

#[tokio::test]
async fn test_unknown_unit() {
    let (_, uc) = expanded().await;
    let err = uc
        .convert(&ConversionRequest::new(1.0, "ctn", "pallet").for_entity(product()))
        .await;
    assert!(matches!(err, Err(Error::UnitNotFound(code)) if code == "pallet"));
}

// ============================================================================
// 2. Entity records
// ============================================================================

#[tokio::test]
async fn test_entity_conversions() {
    let (_, uc) = expanded().await;
    let uc = &uc;
    let convert = |q: f64, from: &str, to: &str| {
        let request = ConversionRequest::new(q, from, to).for_entity(product());
        async move { uc.convert(&request).await.unwrap() }
    };

    assert_relative_eq!(convert(1.0, "ctn", "twct").await, 10.8, epsilon = 1e-9);
    assert_relative_eq!(convert(2.0, "ctn", "kg").await, 12.96, epsilon = 1e-9);
    assert_relative_eq!(convert(12.0, "bag", "ctn").await, 2.0, epsilon = 1e-9);
    assert_relative_eq!(convert(1080.0, "g", "bag").await, 1.0, epsilon = 1e-9);
}

#[tokio::test]
async fn test_other_entity_has_no_records() {
    let (_, uc) = expanded().await;
    let err = uc
        .convert(&ConversionRequest::new(1.0, "ctn", "bag").for_entity(EntityRef::new("product", 43)))
        .await;
    assert!(matches!(err, Err(Error::ConversionNotFound { .. })));
}

#[tokio::test]
async fn test_non_standard_without_entity_is_not_found() {
    let (_, uc) = expanded().await;
    let err = uc.convert(&ConversionRequest::new(1.0, "ctn", "bag")).await;
    assert!(matches!(err, Err(Error::ConversionNotFound { .. })));
}

// ============================================================================
// 3. Fallback for records written without expansion
// ============================================================================

#[tokio::test]
async fn test_fallback_bridges_through_standard_unit() {
    let backend = MemoryBackend::with_units(catalog());
    let uc = UnitConversion::new(backend.clone());

    let mut tx = backend.begin_tx(TxMode::ReadWrite).await.unwrap();
    backend
        .insert_conversion(&mut tx, NewConversion::primary(&product(), "bag", "twct", 1.8))
        .await
        .unwrap();
    backend.commit_tx(tx).await.unwrap();

    let request = ConversionRequest::new(2.0, "bag", "kg").for_entity(product());
    assert_relative_eq!(uc.convert(&request).await.unwrap(), 2.16, epsilon = 1e-9);

    let request = ConversionRequest::new(2.0, "bag", "twct").for_entity(product());
    assert_relative_eq!(uc.convert(&request).await.unwrap(), 3.6, epsilon = 1e-9);

    // one hop only: nothing from kg
    let request = ConversionRequest::new(1.0, "kg", "bag").for_entity(product());
    assert!(matches!(uc.convert(&request).await, Err(Error::ConversionNotFound { .. })));
}

#[tokio::test]
async fn test_fallback_ignores_inactive_records() {
    let backend = MemoryBackend::with_units(catalog());
    let uc = UnitConversion::new(backend.clone());

    let mut tx = backend.begin_tx(TxMode::ReadWrite).await.unwrap();
    let mut inactive = NewConversion::primary(&product(), "bag", "twct", 1.8);
    inactive.is_active = false;
    backend.insert_conversion(&mut tx, inactive).await.unwrap();
    backend.commit_tx(tx).await.unwrap();

    let request = ConversionRequest::new(1.0, "bag", "kg").for_entity(product());
    assert!(matches!(uc.convert(&request).await, Err(Error::ConversionNotFound { .. })));
}

// ============================================================================
// 4. Caching
// ============================================================================

#[tokio::test]
async fn test_map_cached_across_requests() {
    let (backend, uc) = expanded().await;
    let request = ConversionRequest::new(1.0, "ctn", "bag").for_entity(product());

    let before = backend.store_reads();
    for _ in 0..3 {
        assert_eq!(uc.convert(&request).await.unwrap(), 6.0);
    }
    assert_eq!(backend.store_reads() - before, 1);
}

#[tokio::test]
async fn test_reexpansion_invalidates_cached_map() {
    let (_, uc) = expanded().await;
    let request = ConversionRequest::new(1.0, "ctn", "bag").for_entity(product());
    assert_eq!(uc.convert(&request).await.unwrap(), 6.0);

    uc.expand(&product(), &[PrimaryConversion::new("ctn", "bag", 8.0)])
        .await
        .unwrap();
    assert_eq!(uc.convert(&request).await.unwrap(), 8.0);
}

#[tokio::test]
async fn test_session_expand_drops_memo() {
    let (_, uc) = expanded().await;
    let session = uc.session();
    let request = ConversionRequest::new(1.0, "ctn", "bag").for_entity(product());
    assert_eq!(session.convert(&request).await.unwrap(), 6.0);

    session
        .expand(&product(), &[PrimaryConversion::new("ctn", "bag", 10.0)])
        .await
        .unwrap();
    assert_eq!(session.convert(&request).await.unwrap(), 10.0);
}

#[tokio::test]
async fn test_disabled_cache_reads_store_every_request() {
    let backend = MemoryBackend::with_units(catalog());
    let config = ConversionConfig {
        cache: CacheConfig { enabled: false, ..CacheConfig::default() },
        ..ConversionConfig::default()
    };
    let uc = UnitConversion::with_config(backend.clone(), config).unwrap();
    uc.expand(&product(), &[PrimaryConversion::new("ctn", "bag", 6.0)])
        .await
        .unwrap();

    let request = ConversionRequest::new(1.0, "ctn", "bag").for_entity(product());
    let before = backend.store_reads();
    for _ in 0..3 {
        uc.convert(&request).await.unwrap();
    }
    assert_eq!(backend.store_reads() - before, 3);
}

/// MemoryBackend whose next `conversions` read can be held after the rows
/// are fetched, so a write can land between the read and its caching.
#[derive(Clone)]
struct HeldReads {
    inner: MemoryBackend,
    armed: Arc<AtomicBool>,
    reached: Arc<Notify>,
    release: Arc<Notify>,
}

impl HeldReads {
    fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            armed: Arc::new(AtomicBool::new(false)),
            reached: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
        }
    }

    fn hold_next_read(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UnitCatalog for HeldReads {
    async fn find_unit(&self, code: &str) -> Result<Option<Unit>> {
        self.inner.find_unit(code).await
    }

    async fn standard_units_of_types(&self, types: &BTreeSet<String>) -> Result<Vec<Unit>> {
        self.inner.standard_units_of_types(types).await
    }

    async fn list_units(&self, filter: &UnitFilter) -> Result<Vec<Unit>> {
        self.inner.list_units(filter).await
    }
}

#[async_trait]
impl ConversionStore for HeldReads {
    type Tx = MemoryTx;

    async fn begin_tx(&self, mode: TxMode) -> Result<MemoryTx> {
        self.inner.begin_tx(mode).await
    }

    async fn commit_tx(&self, tx: MemoryTx) -> Result<()> {
        self.inner.commit_tx(tx).await
    }

    async fn rollback_tx(&self, tx: MemoryTx) -> Result<()> {
        self.inner.rollback_tx(tx).await
    }

    async fn delete_all_for_entity(&self, tx: &mut MemoryTx, entity: &EntityRef) -> Result<()> {
        self.inner.delete_all_for_entity(tx, entity).await
    }

    async fn insert_conversion(&self, tx: &mut MemoryTx, conversion: NewConversion) -> Result<()> {
        self.inner.insert_conversion(tx, conversion).await
    }

    async fn upsert_conversion(&self, tx: &mut MemoryTx, conversion: NewConversion) -> Result<()> {
        self.inner.upsert_conversion(tx, conversion).await
    }

    async fn delete_conversions_from(&self, tx: &mut MemoryTx, entity: &EntityRef, from: &str) -> Result<()> {
        self.inner.delete_conversions_from(tx, entity, from).await
    }

    async fn conversions(&self, entity: &EntityRef) -> Result<Vec<ConversionEdge>> {
        let rows = self.inner.conversions(entity).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.release.notified().await;
        }
        Ok(rows)
    }
}

#[tokio::test]
async fn test_map_read_before_reexpansion_is_not_cached() {
    let backend = HeldReads::new(MemoryBackend::with_units(catalog()));
    let uc = UnitConversion::new(backend.clone());
    let entity = product();
    uc.expand(&entity, &[PrimaryConversion::new("ctn", "bag", 6.0)])
        .await
        .unwrap();

    backend.hold_next_read();
    let read = uc.conversion_map(&entity);
    let rewrite = async {
        backend.reached.notified().await;
        uc.expand(&entity, &[PrimaryConversion::new("ctn", "bag", 8.0)])
            .await
            .unwrap();
        backend.release.notify_one();
    };
    let (old, ()) = tokio::join!(read, rewrite);

    // the held read still answers with what it fetched
    assert_eq!(old.unwrap().get("ctn", "bag"), Some(6.0));
    assert_eq!(uc.conversion_map(&entity).await.unwrap().get("ctn", "bag"), Some(8.0));
}

// ============================================================================
// 5. Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_standard_round_trip(q in 0.001f64..1.0e6, a in 0usize..3, b in 0usize..3) {
        let codes = ["g", "kg", "twct"];
        let values = [1.0, 1000.0, 600.0];
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let uc = UnitConversion::new(MemoryBackend::with_units(catalog()));

        let (there, back) = rt.block_on(async {
            let there = uc.convert(&ConversionRequest::new(q, codes[a], codes[b])).await.unwrap();
            let back = uc.convert(&ConversionRequest::new(there, codes[b], codes[a])).await.unwrap();
            (there, back)
        });

        prop_assert!((there - q * values[a] / values[b]).abs() <= 1e-9 * there.abs().max(1.0));
        prop_assert!((back - q).abs() <= 1e-9 * q.max(1.0));
    }
}
