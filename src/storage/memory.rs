//! In-memory storage backend.
//!
//! This is the reference implementation of `UnitCatalog` + `ConversionStore`.
//! It keeps units and conversion records in maps protected by RwLock.
//!
//! ## Transactions
//!
//! Writes are staged on the `MemoryTx` and applied on `commit_tx()` under a
//! single write lock, against a copy of the table that only replaces the live
//! one if every staged operation succeeds. `rollback_tx()` drops the staged
//! writes. Reads always see committed state.
//!
//! Lookup counters (`catalog_lookups`, `store_reads`) are exposed so tests can
//! assert which paths touched the backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::model::*;
use crate::tx::{Transaction, TxMode, TxId};
use crate::{Error, Result};
use super::{ConversionStore, UnitCatalog, UnitFilter};

// ============================================================================
// MemoryBackend
// ============================================================================

/// In-memory unit catalog and conversion store.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    units: RwLock<BTreeMap<String, Unit>>,
    conversions: RwLock<ConversionTable>,
    next_tx_id: AtomicU64,
    catalog_lookups: AtomicU64,
    store_reads: AtomicU64,
}

/// Committed conversion rows plus the (entity, from, to) unique index.
#[derive(Clone, Default)]
struct ConversionTable {
    rows: BTreeMap<ConversionId, ConversionEdge>,
    unique: HashMap<(EntityRef, String, String), ConversionId>,
    next_id: u64,
}

impl ConversionTable {
    fn key(entity: &EntityRef, from: &str, to: &str) -> (EntityRef, String, String) {
        (entity.clone(), from.to_string(), to.to_string())
    }

    fn insert(&mut self, conversion: NewConversion) -> Result<ConversionId> {
        let key = Self::key(&conversion.entity, &conversion.from, &conversion.to);
        if self.unique.contains_key(&key) {
            return Err(Error::ConstraintViolation(format!(
                "duplicate conversion {} -> {} for {}",
                conversion.from, conversion.to, conversion.entity
            )));
        }
        self.next_id += 1;
        let id = ConversionId(self.next_id);
        let now = Utc::now();
        self.rows.insert(id, ConversionEdge {
            id,
            entity: conversion.entity,
            from: conversion.from,
            to: conversion.to,
            quantity: conversion.quantity,
            is_derived: conversion.is_derived,
            is_active: conversion.is_active,
            created_at: now,
            updated_at: now,
        });
        self.unique.insert(key, id);
        Ok(id)
    }

    fn upsert(&mut self, conversion: NewConversion) -> Result<ConversionId> {
        let key = Self::key(&conversion.entity, &conversion.from, &conversion.to);
        let Some(id) = self.unique.get(&key).copied() else {
            return self.insert(conversion);
        };
        let row = self.rows.get_mut(&id)
            .ok_or_else(|| Error::StorageError(format!("dangling index entry for conversion {id}")))?;
        row.quantity = conversion.quantity;
        row.is_derived = conversion.is_derived;
        row.is_active = conversion.is_active;
        row.updated_at = Utc::now();
        Ok(id)
    }

    fn delete_where(&mut self, pred: impl Fn(&ConversionEdge) -> bool) {
        let doomed: Vec<ConversionId> = self.rows.values()
            .filter(|row| pred(row))
            .map(|row| row.id)
            .collect();
        for id in doomed {
            if let Some(row) = self.rows.remove(&id) {
                self.unique.remove(&(row.entity, row.from, row.to));
            }
        }
    }

    fn apply(&mut self, op: PendingOp) -> Result<()> {
        match op {
            PendingOp::DeleteEntity(entity) => self.delete_where(|r| r.entity == entity),
            PendingOp::DeleteFrom(entity, from) => {
                self.delete_where(|r| r.entity == entity && r.from == from)
            }
            PendingOp::Insert(conversion) => {
                self.insert(conversion)?;
            }
            PendingOp::Upsert(conversion) => {
                self.upsert(conversion)?;
            }
        }
        Ok(())
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                units: RwLock::new(BTreeMap::new()),
                conversions: RwLock::new(ConversionTable::default()),
                next_tx_id: AtomicU64::new(1),
                catalog_lookups: AtomicU64::new(0),
                store_reads: AtomicU64::new(0),
            }),
        }
    }

    /// A backend pre-loaded with `units`.
    pub fn with_units(units: impl IntoIterator<Item = Unit>) -> Self {
        let backend = Self::new();
        for unit in units {
            backend.put_unit(unit);
        }
        backend
    }

    /// Catalog management: insert or replace a unit.
    pub fn put_unit(&self, unit: Unit) {
        self.inner.units.write().insert(unit.code.clone(), unit);
    }

    /// Catalog management: remove a unit. Returns true if it existed.
    pub fn remove_unit(&self, code: &str) -> bool {
        self.inner.units.write().remove(code).is_some()
    }

    /// Number of catalog reads served so far.
    pub fn catalog_lookups(&self) -> u64 {
        self.inner.catalog_lookups.load(Ordering::Relaxed)
    }

    /// Number of conversion-store reads served so far.
    pub fn store_reads(&self) -> u64 {
        self.inner.store_reads.load(Ordering::Relaxed)
    }

    /// Total committed conversion records, across all entities.
    pub fn conversion_count(&self) -> usize {
        self.inner.conversions.read().rows.len()
    }

    fn touch_catalog(&self) {
        self.inner.catalog_lookups.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MemoryTx
// ============================================================================

enum PendingOp {
    DeleteEntity(EntityRef),
    DeleteFrom(EntityRef, String),
    Insert(NewConversion),
    Upsert(NewConversion),
}

/// In-memory transaction: an ordered list of staged writes.
pub struct MemoryTx {
    id: TxId,
    mode: TxMode,
    ops: Vec<PendingOp>,
}

impl MemoryTx {
    fn stage(&mut self, op: PendingOp) -> Result<()> {
        self.ensure_writable()?;
        self.ops.push(op);
        Ok(())
    }
}

impl Transaction for MemoryTx {
    fn id(&self) -> TxId { self.id }
    fn mode(&self) -> TxMode { self.mode }
    fn pending(&self) -> usize { self.ops.len() }
}

// ============================================================================
// UnitCatalog impl
// ============================================================================

#[async_trait]
impl UnitCatalog for MemoryBackend {
    async fn find_unit(&self, code: &str) -> Result<Option<Unit>> {
        self.touch_catalog();
        Ok(self.inner.units.read().get(code).cloned())
    }

    async fn standard_units_of_types(&self, types: &BTreeSet<String>) -> Result<Vec<Unit>> {
        self.touch_catalog();
        Ok(self.inner.units.read()
            .values()
            .filter(|u| u.is_standard && u.is_active && types.contains(&u.unit_type))
            .cloned()
            .collect())
    }

    async fn list_units(&self, filter: &UnitFilter) -> Result<Vec<Unit>> {
        self.touch_catalog();
        let mut units: Vec<Unit> = self.inner.units.read()
            .values()
            .filter(|u| filter.matches(u))
            .cloned()
            .collect();
        units.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.code.cmp(&b.code)));
        Ok(units)
    }
}

// ============================================================================
// ConversionStore impl
// ============================================================================

#[async_trait]
impl ConversionStore for MemoryBackend {
    type Tx = MemoryTx;

    async fn begin_tx(&self, mode: TxMode) -> Result<MemoryTx> {
        let id = TxId(self.inner.next_tx_id.fetch_add(1, Ordering::Relaxed));
        Ok(MemoryTx { id, mode, ops: Vec::new() })
    }

    async fn commit_tx(&self, tx: MemoryTx) -> Result<()> {
        if tx.ops.is_empty() {
            return Ok(());
        }
        let mut live = self.inner.conversions.write();
        let mut staged = live.clone();
        let op_count = tx.ops.len();
        for op in tx.ops {
            staged.apply(op).map_err(|e| {
                tracing::debug!(tx = %tx.id, error = %e, "commit aborted");
                e
            })?;
        }
        *live = staged;
        tracing::trace!(tx = %tx.id, ops = op_count, "committed");
        Ok(())
    }

    async fn rollback_tx(&self, tx: MemoryTx) -> Result<()> {
        tracing::trace!(tx = %tx.id, discarded = tx.ops.len(), "rolled back");
        Ok(())
    }

    async fn delete_all_for_entity(&self, tx: &mut MemoryTx, entity: &EntityRef) -> Result<()> {
        tx.stage(PendingOp::DeleteEntity(entity.clone()))
    }

    async fn insert_conversion(&self, tx: &mut MemoryTx, conversion: NewConversion) -> Result<()> {
        tx.stage(PendingOp::Insert(conversion))
    }

    async fn upsert_conversion(&self, tx: &mut MemoryTx, conversion: NewConversion) -> Result<()> {
        tx.stage(PendingOp::Upsert(conversion))
    }

    async fn delete_conversions_from(
        &self,
        tx: &mut MemoryTx,
        entity: &EntityRef,
        from: &str,
    ) -> Result<()> {
        tx.stage(PendingOp::DeleteFrom(entity.clone(), from.to_string()))
    }

    async fn conversions(&self, entity: &EntityRef) -> Result<Vec<ConversionEdge>> {
        self.inner.store_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.conversions.read()
            .rows
            .values()
            .filter(|row| &row.entity == entity)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
