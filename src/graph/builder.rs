//! Graph Builder: primary declarations + standard-unit cliques.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{PrimaryConversion, Unit};
use crate::Result;
use super::ConversionGraph;

/// Unit codes referenced by `primaries`, deduplicated in first-appearance order.
pub fn declared_codes(primaries: &[PrimaryConversion]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut codes = Vec::new();
    for decl in primaries {
        for code in [&decl.from, &decl.to] {
            if seen.insert(code.as_str()) {
                codes.push(code.clone());
            }
        }
    }
    codes
}

/// Measurement types represented among `units`.
pub fn measurement_types<'a>(units: impl IntoIterator<Item = &'a Unit>) -> BTreeSet<String> {
    units
        .into_iter()
        .filter(|u| !u.unit_type.is_empty())
        .map(|u| u.unit_type.clone())
        .collect()
}

/// Build the expansion graph.
///
/// `units` is the working unit set: the declared units plus every active
/// standard unit sharing a type with them. Declarations are applied in
/// order (a repeated ordered pair takes the later quantity), then every
/// ordered pair of standard units of one type gets `value(x) / value(y)`,
/// overwriting any declared edge between them.
pub fn build_graph(primaries: &[PrimaryConversion], units: &[Unit]) -> Result<ConversionGraph> {
    let mut graph = ConversionGraph::new();

    for decl in primaries {
        decl.validate()?;
        for (from, to, factor) in decl.with_inverse() {
            graph.set_edge(from, to, factor);
        }
    }

    let mut standards_by_type: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for unit in units {
        graph.add_unit(&unit.code);
        if !unit.is_standard {
            continue;
        }
        match unit.standard_value() {
            Some(value) => {
                standards_by_type
                    .entry(unit.unit_type.as_str())
                    .or_default()
                    .insert(unit.code.as_str(), value);
            }
            None => tracing::warn!(
                unit = %unit.code,
                value = ?unit.value,
                "standard unit has no usable value, skipping standard edges"
            ),
        }
    }

    for standards in standards_by_type.values() {
        for (from, from_value) in standards {
            for (to, to_value) in standards {
                if from != to {
                    graph.set_edge(from, to, from_value / to_value);
                }
            }
        }
    }

    tracing::trace!(
        units = graph.unit_count(),
        edges = graph.edge_count(),
        "conversion graph built"
    );
    Ok(graph)
}
