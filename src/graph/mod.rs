//! # Conversion Graph
//!
//! Transient weighted digraph for one expansion call. An edge `a → b = f`
//! means `1 a = f b`. Built fresh by [`builder::build_graph`], consumed by
//! [`closure::compute`], then dropped. Never persisted.

pub mod builder;
pub mod closure;

use std::collections::{BTreeMap, BTreeSet};

pub use builder::{build_graph, declared_codes, measurement_types};
pub use closure::{Closure, compute};

/// Adjacency map `from → (to → factor)` plus the node set.
///
/// Both are ordered so every traversal over the graph is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionGraph {
    edges: BTreeMap<String, BTreeMap<String, f64>>,
    units: BTreeSet<String>,
}

impl ConversionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node without edges.
    pub fn add_unit(&mut self, code: &str) {
        if !self.units.contains(code) {
            self.units.insert(code.to_string());
        }
    }

    /// Add or overwrite `from → to`.
    pub fn set_edge(&mut self, from: &str, to: &str, factor: f64) {
        self.add_unit(from);
        self.add_unit(to);
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string(), factor);
    }

    pub fn factor(&self, from: &str, to: &str) -> Option<f64> {
        self.edges.get(from)?.get(to).copied()
    }

    /// Node codes in ascending order.
    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(String::as_str)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }
}
