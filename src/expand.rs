//! # Expansion
//!
//! Replace one entity's conversion records with the closure of its primary
//! declarations:
//!
//! ```text
//! declarations → validate → load units (+ same-type standards)
//!   → build_graph → closure::compute
//!   → ReadWrite tx { delete all; insert primaries + inverses; insert derived }
//! ```
//!
//! The whole write set lands in one transaction. Expansions for the same
//! entity are serialized by [`EntityLocks`]; different entities run freely.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::graph::{self, Closure};
use crate::model::{EntityRef, NewConversion, PrimaryConversion, Unit};
use crate::storage::StorageBackend;
use crate::tx::{Transaction, TxMode};
use crate::{Error, Result};

/// Record counts written by one expansion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpansionSummary {
    /// Units in the working set (declared + related standard units).
    pub units: usize,
    /// Non-derived records: each declaration and its inverse.
    pub primary: usize,
    /// Derived records from the closure.
    pub derived: usize,
}

// ============================================================================
// Per-entity locks
// ============================================================================

/// One async mutex per entity with an expansion in flight.
#[derive(Default)]
pub struct EntityLocks {
    locks: parking_lot::Mutex<HashMap<EntityRef, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub async fn acquire(&self, entity: &EntityRef) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // entries nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(entity.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

// ============================================================================
// Expansion
// ============================================================================

/// Expand `primaries` for `entity` and persist the result.
///
/// An empty declaration list clears every record of the entity.
pub async fn expand<B: StorageBackend>(
    backend: &B,
    entity: &EntityRef,
    primaries: &[PrimaryConversion],
) -> Result<ExpansionSummary> {
    for decl in primaries {
        decl.validate()?;
    }

    if primaries.is_empty() {
        let mut tx = backend.begin_tx(TxMode::ReadWrite).await?;
        backend.delete_all_for_entity(&mut tx, entity).await?;
        backend.commit_tx(tx).await?;
        tracing::info!(entity = %entity, "conversions cleared");
        return Ok(ExpansionSummary::default());
    }

    let units = working_units(backend, primaries).await?;
    let graph = graph::build_graph(primaries, &units)?;
    let closure = graph::compute(&graph);

    let records = plan_records(entity, primaries, &closure);
    let summary = ExpansionSummary {
        units: closure.codes().len(),
        primary: records.iter().filter(|r| !r.is_derived).count(),
        derived: records.iter().filter(|r| r.is_derived).count(),
    };

    let mut tx = backend.begin_tx(TxMode::ReadWrite).await?;
    let staged: Result<()> = async {
        backend.delete_all_for_entity(&mut tx, entity).await?;
        backend.insert_conversions_batch(&mut tx, records).await
    }
    .await;
    if let Err(e) = staged {
        let id = tx.id();
        if let Err(rollback) = backend.rollback_tx(tx).await {
            tracing::warn!(entity = %entity, tx = %id, error = %rollback, "rollback failed");
        }
        return Err(e);
    }
    tracing::debug!(entity = %entity, tx = %tx.id(), writes = tx.pending(), "committing expansion");
    backend.commit_tx(tx).await?;

    tracing::info!(
        entity = %entity,
        units = summary.units,
        primary = summary.primary,
        derived = summary.derived,
        "conversions expanded"
    );
    Ok(summary)
}

/// Declared units plus every active standard unit sharing a type with them.
///
/// Every declared code must name an active catalog unit.
async fn working_units<B: StorageBackend>(
    backend: &B,
    primaries: &[PrimaryConversion],
) -> Result<Vec<Unit>> {
    let codes = graph::declared_codes(primaries);
    let mut units: BTreeMap<String, Unit> = backend
        .find_units(&codes)
        .await?
        .into_iter()
        .filter(|u| u.is_active)
        .map(|u| (u.code.clone(), u))
        .collect();

    if let Some(missing) = codes.iter().find(|code| !units.contains_key(code.as_str())) {
        return Err(Error::UnitNotFound(missing.clone()));
    }

    let types: BTreeSet<String> = graph::measurement_types(units.values());
    if !types.is_empty() {
        for standard in backend.standard_units_of_types(&types).await? {
            units.entry(standard.code.clone()).or_insert(standard);
        }
    }
    Ok(units.into_values().collect())
}

/// The full record set for one entity.
///
/// Primary records come first, in declaration order, each followed by its
/// inverse. A pair declared more than once (directly or as an inverse) is
/// written once, with the quantity of its last declaration. Every other
/// closure pair becomes a derived record.
fn plan_records(
    entity: &EntityRef,
    primaries: &[PrimaryConversion],
    closure: &Closure,
) -> Vec<NewConversion> {
    let mut latest: BTreeMap<(&str, &str), f64> = BTreeMap::new();
    for decl in primaries {
        for (from, to, qty) in decl.with_inverse() {
            latest.insert((from, to), qty);
        }
    }

    let mut records = Vec::with_capacity(closure.pair_count());
    let mut written: BTreeSet<(&str, &str)> = BTreeSet::new();
    for decl in primaries {
        for (from, to, _) in decl.with_inverse() {
            if written.insert((from, to)) {
                records.push(NewConversion::primary(entity, from, to, latest[&(from, to)]));
            }
        }
    }

    for (from, to, factor) in closure.pairs() {
        if !latest.contains_key(&(from, to)) {
            records.push(NewConversion::derived(entity, from, to, factor));
        }
    }
    records
}
