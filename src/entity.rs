//! Per-entity conversion operations.
//!
//! Single-edge writes (`set_conversion`, `remove_conversion`,
//! `sync_conversions`) touch only the edges named and do not expand; use
//! [`EntityConversions::expand_conversions`] for the closure. Every write
//! takes the entity's lock and forgets its cached conversion map.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::expand::ExpansionSummary;
use crate::model::{ConversionEdge, ConversionMap, ConversionRequest, EntityRef, NewConversion, PrimaryConversion};
use crate::storage::StorageBackend;
use crate::tx::{Transaction, TxMode};
use crate::{Result, UnitConversion};

/// Conversion records and lookups scoped to one entity.
pub struct EntityConversions<'c, B: StorageBackend> {
    uc: &'c UnitConversion<B>,
    entity: EntityRef,
}

impl<'c, B: StorageBackend> EntityConversions<'c, B> {
    pub(crate) fn new(uc: &'c UnitConversion<B>, entity: EntityRef) -> Self {
        Self { uc, entity }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Every record, active or not.
    pub async fn conversions(&self) -> Result<Vec<ConversionEdge>> {
        self.uc.backend.conversions(&self.entity).await
    }

    pub async fn active(&self) -> Result<Vec<ConversionEdge>> {
        self.uc.backend.active_conversions(&self.entity).await
    }

    /// Active user-declared records (declarations and their inverses).
    pub async fn primary(&self) -> Result<Vec<ConversionEdge>> {
        let mut edges = self.active().await?;
        edges.retain(|e| !e.is_derived);
        Ok(edges)
    }

    /// Active records produced by the closure.
    pub async fn derived(&self) -> Result<Vec<ConversionEdge>> {
        let mut edges = self.active().await?;
        edges.retain(|e| e.is_derived);
        Ok(edges)
    }

    /// First active record starting at `from`.
    pub async fn conversion_from(&self, from: &str) -> Result<Option<ConversionEdge>> {
        self.uc.backend.find_active_conversion(&self.entity, from, None).await
    }

    /// Distinct from-codes of the active records.
    pub async fn available_unit_codes(&self) -> Result<Vec<String>> {
        let edges = self.active().await?;
        Ok(distinct(edges.iter().map(|e| e.from.as_str())))
    }

    /// Distinct from-codes, then distinct to-codes not already listed.
    pub async fn all_unit_codes(&self) -> Result<Vec<String>> {
        let edges = self.active().await?;
        let froms = edges.iter().map(|e| e.from.as_str());
        let tos = edges.iter().map(|e| e.to.as_str());
        Ok(distinct(froms.chain(tos)))
    }

    pub async fn conversion_map(&self) -> Result<Arc<ConversionMap>> {
        self.uc.conversion_map(&self.entity).await
    }

    /// Factor for `from → to` from the entity's own records. Same code is 1.
    pub async fn conversion_quantity(&self, from: &str, to: &str) -> Result<Option<f64>> {
        if from == to {
            return Ok(Some(1.0));
        }
        Ok(self.conversion_map().await?.get(from, to))
    }

    /// Convert with this entity's records available to the resolver.
    pub async fn convert(&self, quantity: f64, from: &str, to: &str) -> Result<f64> {
        let request = ConversionRequest::new(quantity, from, to).for_entity(self.entity.clone());
        self.uc.convert(&request).await
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Replace every record with the closure of `primaries`.
    pub async fn expand_conversions(&self, primaries: &[PrimaryConversion]) -> Result<ExpansionSummary> {
        self.uc.expand(&self.entity, primaries).await
    }

    /// Insert or update the single record `1 from = quantity to`.
    pub async fn set_conversion(&self, from: &str, to: &str, quantity: f64) -> Result<()> {
        let decl = PrimaryConversion::new(from, to, quantity);
        decl.validate()?;
        let _guard = self.uc.locks.acquire(&self.entity).await;
        self.apply(vec![EdgeWrite::Upsert(decl)]).await
    }

    /// Delete every record starting at `from`. Returns whether any existed.
    pub async fn remove_conversion(&self, from: &str) -> Result<bool> {
        let _guard = self.uc.locks.acquire(&self.entity).await;
        let existed = self
            .conversions()
            .await?
            .iter()
            .any(|e| e.from == from);
        if existed {
            self.apply(vec![EdgeWrite::DeleteFrom(from.to_string())]).await?;
        }
        Ok(existed)
    }

    /// Make the stored from-codes match `conversions` without expanding:
    /// records from unlisted codes are deleted, listed ones upserted.
    pub async fn sync_conversions(&self, conversions: &[PrimaryConversion]) -> Result<()> {
        for decl in conversions {
            decl.validate()?;
        }
        let _guard = self.uc.locks.acquire(&self.entity).await;
        let listed: BTreeSet<&str> = conversions.iter().map(|c| c.from.as_str()).collect();
        let stale: BTreeSet<String> = self
            .conversions()
            .await?
            .into_iter()
            .map(|e| e.from)
            .filter(|from| !listed.contains(from.as_str()))
            .collect();

        let removed = stale.len();
        let writes = stale
            .into_iter()
            .map(EdgeWrite::DeleteFrom)
            .chain(conversions.iter().cloned().map(EdgeWrite::Upsert))
            .collect();
        self.apply(writes).await?;
        tracing::debug!(entity = %self.entity, removed, upserted = conversions.len(), "conversions synced");
        Ok(())
    }

    /// Forget the cached conversion map.
    pub fn clear_cache(&self) {
        self.uc.cache.forget_entity(&self.entity);
    }

    /// Apply `writes` in one transaction, then forget the cached map.
    /// Callers hold the entity lock.
    async fn apply(&self, writes: Vec<EdgeWrite>) -> Result<()> {
        let backend = &self.uc.backend;
        let mut tx = backend.begin_tx(TxMode::ReadWrite).await?;
        let staged: Result<()> = async {
            for write in writes {
                match write {
                    EdgeWrite::Upsert(decl) => {
                        let record = NewConversion::primary(&self.entity, &decl.from, &decl.to, decl.qty);
                        backend.upsert_conversion(&mut tx, record).await?;
                    }
                    EdgeWrite::DeleteFrom(from) => {
                        backend.delete_conversions_from(&mut tx, &self.entity, &from).await?;
                    }
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = staged {
            let id = tx.id();
            if let Err(rollback) = backend.rollback_tx(tx).await {
                tracing::warn!(entity = %self.entity, tx = %id, error = %rollback, "rollback failed");
            }
            return Err(e);
        }
        tracing::debug!(entity = %self.entity, tx = %tx.id(), writes = tx.pending(), "committing edge writes");
        backend.commit_tx(tx).await?;
        self.clear_cache();
        Ok(())
    }
}

enum EdgeWrite {
    Upsert(PrimaryConversion),
    DeleteFrom(String),
}

fn distinct<'a>(codes: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    codes
        .filter(|code| seen.insert(*code))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Unit;
    use crate::storage::MemoryBackend;
    use crate::Error;
    use pretty_assertions::assert_eq;

    fn handle() -> UnitConversion<MemoryBackend> {
        UnitConversion::new(MemoryBackend::with_units([
            Unit::new("ctn", "count"),
            Unit::new("bag", "count"),
            Unit::standard("g", "mass", 1.0),
            Unit::standard("kg", "mass", 1000.0),
        ]))
    }

    #[test]
    fn test_distinct_keeps_first_appearance() {
        assert_eq!(distinct(["b", "a", "b", "c", "a"].into_iter()), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_set_and_remove_single_edge() {
        let uc = handle();
        let product = uc.entity(EntityRef::new("product", 1));

        product.set_conversion("ctn", "bag", 6.0).await.unwrap();
        product.set_conversion("ctn", "bag", 8.0).await.unwrap();
        assert_eq!(product.conversion_quantity("ctn", "bag").await.unwrap(), Some(8.0));
        assert_eq!(product.conversions().await.unwrap().len(), 1);
        // no inverse without expansion
        assert_eq!(product.conversion_quantity("bag", "ctn").await.unwrap(), None);

        assert!(product.remove_conversion("ctn").await.unwrap());
        assert!(!product.remove_conversion("ctn").await.unwrap());
        assert_eq!(product.conversion_quantity("ctn", "bag").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_removes_report_one_deletion() {
        let uc = handle();
        let product = uc.entity(EntityRef::new("product", 1));

        for _ in 0..8 {
            product.set_conversion("ctn", "bag", 6.0).await.unwrap();
            let (a, b) = tokio::join!(product.remove_conversion("ctn"), product.remove_conversion("ctn"));
            let (a, b) = (a.unwrap(), b.unwrap());
            assert!(a ^ b, "exactly one remove deletes: {a} {b}");
            assert!(product.conversions().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_set_rejects_invalid_quantity() {
        let uc = handle();
        let product = uc.entity(EntityRef::new("product", 1));
        let err = product.set_conversion("ctn", "bag", 0.0).await;
        assert!(matches!(err, Err(Error::InvalidConversion(_))));
        assert!(product.conversions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_deletes_unlisted_from_codes() {
        let uc = handle();
        let product = uc.entity(EntityRef::new("product", 1));
        product.set_conversion("ctn", "bag", 6.0).await.unwrap();
        product.set_conversion("bag", "kg", 1.8).await.unwrap();

        product
            .sync_conversions(&[PrimaryConversion::new("bag", "kg", 2.0), PrimaryConversion::new("bag", "g", 2000.0)])
            .await
            .unwrap();

        assert_eq!(product.available_unit_codes().await.unwrap(), vec!["bag"]);
        assert_eq!(product.all_unit_codes().await.unwrap(), vec!["bag", "kg", "g"]);
        assert_eq!(product.conversion_quantity("bag", "kg").await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn test_primary_and_derived_lists() {
        let uc = handle();
        let product = uc.entity(EntityRef::new("product", 1));
        let summary = product
            .expand_conversions(&[PrimaryConversion::new("ctn", "bag", 6.0), PrimaryConversion::new("bag", "kg", 1.8)])
            .await
            .unwrap();

        let primary = product.primary().await.unwrap();
        let derived = product.derived().await.unwrap();
        assert_eq!(primary.len(), summary.primary);
        assert_eq!(derived.len(), summary.derived);
        assert_eq!(primary.len() + derived.len(), 12);
        assert_eq!(product.conversion_from("ctn").await.unwrap().map(|e| e.to), Some("bag".to_string()));
        assert_eq!(product.conversion_quantity("kg", "kg").await.unwrap(), Some(1.0));
    }
}
