//! Closure Engine: every reachable ordered pair gets a factor.
//!
//! Floyd–Warshall shaped, but multiplicative and first-found: once a pair has
//! a factor (direct edge or an earlier intermediate) it is never replaced.
//! Nothing is minimized. Intermediates are visited in ascending code order,
//! so the output is deterministic even when the declared edges contain
//! inconsistent cycles; in that case the chosen factor reflects that order,
//! not any notion of the physically correct value.

use hashbrown::HashMap;

use super::ConversionGraph;

/// All-pairs result over the graph's units.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    codes: Vec<String>,
    index: HashMap<String, usize>,
    /// Row-major `n × n`; `None` = no path.
    dist: Vec<Option<f64>>,
}

impl Closure {
    pub fn factor(&self, from: &str, to: &str) -> Option<f64> {
        let i = *self.index.get(from)?;
        let j = *self.index.get(to)?;
        self.dist[i * self.codes.len() + j]
    }

    /// Unit codes in the order they were indexed.
    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    /// Every resolved `(from, to, factor)` with `from != to`, row by row.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str, f64)> + '_ {
        let n = self.codes.len();
        (0..n).flat_map(move |i| {
            (0..n).filter(move |&j| j != i).filter_map(move |j| {
                self.dist[i * n + j]
                    .map(|f| (self.codes[i].as_str(), self.codes[j].as_str(), f))
            })
        })
    }

    /// Number of resolved off-diagonal pairs.
    pub fn pair_count(&self) -> usize {
        self.pairs().count()
    }
}

/// Run the closure over every unit in `graph`.
pub fn compute(graph: &ConversionGraph) -> Closure {
    let codes: Vec<String> = graph.units().map(str::to_string).collect();
    let n = codes.len();
    let index: HashMap<String, usize> = codes
        .iter()
        .enumerate()
        .map(|(i, code)| (code.clone(), i))
        .collect();

    let mut dist = vec![None; n * n];
    for i in 0..n {
        for j in 0..n {
            dist[i * n + j] = if i == j {
                Some(1.0)
            } else {
                graph.factor(&codes[i], &codes[j])
            };
        }
    }

    for k in 0..n {
        for i in 0..n {
            let Some(ik) = dist[i * n + k] else { continue };
            for j in 0..n {
                if i == j || dist[i * n + j].is_some() {
                    continue;
                }
                if let Some(kj) = dist[k * n + j] {
                    dist[i * n + j] = Some(ik * kj);
                }
            }
        }
    }

    Closure { codes, index, dist }
}
