//! Conversion edges, declarations, requests and the flattened per-entity map.

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use super::EntityRef;
use crate::{Error, Result};

/// Opaque conversion record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversionId(pub u64);

impl std::fmt::Display for ConversionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Primary declarations
// ============================================================================

/// A user-declared rule: `1 from = qty to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryConversion {
    pub from: String,
    pub to: String,
    pub qty: f64,
}

impl PrimaryConversion {
    pub fn new(from: impl Into<String>, to: impl Into<String>, qty: f64) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            qty,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.qty.is_finite() || self.qty <= 0.0 {
            return Err(Error::InvalidConversion(format!(
                "{} -> {}: quantity must be positive, got {}",
                self.from, self.to, self.qty
            )));
        }
        if self.from == self.to {
            return Err(Error::InvalidConversion(format!(
                "{} -> {}: a unit cannot be declared against itself",
                self.from, self.to
            )));
        }
        Ok(())
    }

    /// The forward edge followed by its algebraic inverse.
    pub fn with_inverse(&self) -> SmallVec<[(&str, &str, f64); 2]> {
        smallvec![
            (self.from.as_str(), self.to.as_str(), self.qty),
            (self.to.as_str(), self.from.as_str(), 1.0 / self.qty),
        ]
    }
}

// ============================================================================
// Stored edges
// ============================================================================

/// A persisted conversion record: `1 from = quantity to` for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionEdge {
    pub id: ConversionId,
    pub entity: EntityRef,
    pub from: String,
    pub to: String,
    pub quantity: f64,
    /// `false` for user input (and its inverse), `true` for closure output.
    pub is_derived: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a conversion record; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversion {
    pub entity: EntityRef,
    pub from: String,
    pub to: String,
    pub quantity: f64,
    pub is_derived: bool,
    pub is_active: bool,
}

impl NewConversion {
    pub fn primary(entity: &EntityRef, from: &str, to: &str, quantity: f64) -> Self {
        Self {
            entity: entity.clone(),
            from: from.to_string(),
            to: to.to_string(),
            quantity,
            is_derived: false,
            is_active: true,
        }
    }

    pub fn derived(entity: &EntityRef, from: &str, to: &str, quantity: f64) -> Self {
        Self {
            is_derived: true,
            ..Self::primary(entity, from, to, quantity)
        }
    }
}

// ============================================================================
// ConversionMap
// ============================================================================

/// Flattened view of one entity's active edges: `from → (to → factor)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionMap {
    factors: HashMap<String, HashMap<String, f64>>,
}

impl ConversionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored edges, ignoring inactive ones.
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = &'a ConversionEdge>) -> Self {
        let mut map = Self::new();
        for edge in edges.into_iter().filter(|e| e.is_active) {
            map.insert(&edge.from, &edge.to, edge.quantity);
        }
        map
    }

    pub fn insert(&mut self, from: &str, to: &str, factor: f64) {
        self.factors
            .entry_ref(from)
            .or_default()
            .insert(to.to_string(), factor);
    }

    pub fn get(&self, from: &str, to: &str) -> Option<f64> {
        self.factors.get(from)?.get(to).copied()
    }

    /// Number of (from, to) pairs.
    pub fn len(&self) -> usize {
        self.factors.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.factors.iter().flat_map(|(from, targets)| {
            targets
                .iter()
                .map(move |(to, factor)| (from.as_str(), to.as_str(), *factor))
        })
    }
}

// ============================================================================
// Requests
// ============================================================================

/// One resolve call: convert `quantity` of `from` into `to`, optionally in
/// the context of an entity's private rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub entity: Option<EntityRef>,
    pub quantity: f64,
    pub from: String,
    pub to: String,
}

impl ConversionRequest {
    pub fn new(quantity: f64, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            entity: None,
            quantity,
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn for_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }
}
