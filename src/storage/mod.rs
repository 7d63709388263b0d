//! # Storage Ports
//!
//! The contracts between the conversion core and whatever holds unit master
//! data and per-entity conversion records (a relational store in production).
//!
//! ## Implementations
//!
//! | Backend | Module | Description |
//! |---------|--------|-------------|
//! | `MemoryBackend` | `memory` | In-memory for testing/embedding |

pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::model::*;
use crate::tx::{Transaction, TxMode};
use crate::Result;

pub use memory::MemoryBackend;

// ============================================================================
// Unit filter
// ============================================================================

/// Selection for catalog listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub unit_type: Option<String>,
    pub active_only: bool,
    pub standard_only: bool,
}

impl UnitFilter {
    pub fn matches(&self, unit: &Unit) -> bool {
        self.unit_type.as_deref().is_none_or(|t| unit.unit_type == t)
            && (!self.active_only || unit.is_active)
            && (!self.standard_only || unit.is_standard)
    }
}

// ============================================================================
// UnitCatalog
// ============================================================================

/// Read-only view of unit master data.
#[async_trait]
pub trait UnitCatalog: Send + Sync + 'static {
    /// Look up one unit by code, active or not.
    async fn find_unit(&self, code: &str) -> Result<Option<Unit>>;

    /// Every active standard unit whose type is in `types`.
    async fn standard_units_of_types(&self, types: &BTreeSet<String>) -> Result<Vec<Unit>>;

    /// Units matching `filter`, ordered by `(sort_order, code)`.
    async fn list_units(&self, filter: &UnitFilter) -> Result<Vec<Unit>>;

    /// Look up several units. Missing codes are skipped.
    ///
    /// Default falls back to sequential `find_unit` calls.
    async fn find_units(&self, codes: &[String]) -> Result<Vec<Unit>> {
        let mut units = Vec::with_capacity(codes.len());
        for code in codes {
            if let Some(unit) = self.find_unit(code).await? {
                units.push(unit);
            }
        }
        Ok(units)
    }
}

// ============================================================================
// ConversionStore
// ============================================================================

/// Per-entity conversion records, unique per (entity, from, to).
///
/// Writes go through a transaction and become visible on commit. Reads see
/// committed state only.
#[async_trait]
pub trait ConversionStore: Send + Sync + 'static {
    /// The transaction type for this backend.
    type Tx: Transaction;

    // ========================================================================
    // Transactions
    // ========================================================================

    async fn begin_tx(&self, mode: TxMode) -> Result<Self::Tx>;

    /// Commit a transaction. All of its writes land, or none do.
    async fn commit_tx(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback_tx(&self, tx: Self::Tx) -> Result<()>;

    // ========================================================================
    // Writes
    // ========================================================================

    /// Delete every record (derived or not, active or not) owned by `entity`.
    async fn delete_all_for_entity(&self, tx: &mut Self::Tx, entity: &EntityRef) -> Result<()>;

    /// Insert a record. Committing a duplicate (entity, from, to) fails.
    async fn insert_conversion(&self, tx: &mut Self::Tx, conversion: NewConversion) -> Result<()>;

    /// Insert or update the record keyed by (entity, from, to).
    async fn upsert_conversion(&self, tx: &mut Self::Tx, conversion: NewConversion) -> Result<()>;

    /// Delete every record of `entity` starting at `from`.
    async fn delete_conversions_from(
        &self,
        tx: &mut Self::Tx,
        entity: &EntityRef,
        from: &str,
    ) -> Result<()>;

    /// Batch insert.
    ///
    /// Default falls back to sequential `insert_conversion` calls.
    async fn insert_conversions_batch(
        &self,
        tx: &mut Self::Tx,
        conversions: Vec<NewConversion>,
    ) -> Result<()> {
        for conversion in conversions {
            self.insert_conversion(tx, conversion).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Every record owned by `entity`, in insertion order.
    async fn conversions(&self, entity: &EntityRef) -> Result<Vec<ConversionEdge>>;

    /// Active records owned by `entity`, in insertion order.
    async fn active_conversions(&self, entity: &EntityRef) -> Result<Vec<ConversionEdge>> {
        let mut edges = self.conversions(entity).await?;
        edges.retain(|e| e.is_active);
        Ok(edges)
    }

    /// First active record from `from` (to `to`, when given).
    async fn find_active_conversion(
        &self,
        entity: &EntityRef,
        from: &str,
        to: Option<&str>,
    ) -> Result<Option<ConversionEdge>> {
        let edges = self.active_conversions(entity).await?;
        Ok(edges
            .into_iter()
            .find(|e| e.from == from && to.is_none_or(|t| e.to == t)))
    }
}

// ============================================================================
// StorageBackend
// ============================================================================

/// Everything the conversion core needs from the outside world.
pub trait StorageBackend: UnitCatalog + ConversionStore {}

impl<T: UnitCatalog + ConversionStore> StorageBackend for T {}
