//! Damped structural importance.
//!
//! Each node starts at the baseline and is repeatedly re-scored as
//!
//! ```text
//! s'(n) = (1 - d) * baseline + d * Σ s(m) / deg(m)     for m in parents(n) ∪ children(n)
//! ```
//!
//! where `deg(m)` is the total degree of `m`. Iteration runs per weakly
//! connected component (components never influence each other) until the
//! largest change drops below the tolerance or the iteration cap is hit.
//! Raw scores are finally min-max rescaled into `[0, 1]` over the whole graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::CentralityConfig;

pub type Adjacency = BTreeMap<String, Vec<String>>;

fn neighbors<'a>(
    node: &str,
    parents: &'a Adjacency,
    children: &'a Adjacency,
) -> impl Iterator<Item = &'a String> {
    parents
        .get(node)
        .into_iter()
        .flatten()
        .chain(children.get(node).into_iter().flatten())
}

fn degree(node: &str, parents: &Adjacency, children: &Adjacency) -> usize {
    parents.get(node).map_or(0, |v| v.len()) + children.get(node).map_or(0, |v| v.len())
}

/// Weakly connected components containing any of `seeds`, each sorted.
pub fn components_of<'a>(
    seeds: impl IntoIterator<Item = &'a String>,
    parents: &Adjacency,
    children: &Adjacency,
) -> Vec<BTreeSet<String>> {
    let mut assigned: BTreeSet<String> = BTreeSet::new();
    let mut components = Vec::new();

    for seed in seeds {
        if assigned.contains(seed) {
            continue;
        }
        let mut component = BTreeSet::new();
        let mut queue = VecDeque::from([seed.clone()]);
        component.insert(seed.clone());
        while let Some(node) = queue.pop_front() {
            for next in neighbors(&node, parents, children) {
                if component.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        assigned.extend(component.iter().cloned());
        components.push(component);
    }
    components
}

/// Raw scores for one component.
pub fn score_component(
    component: &BTreeSet<String>,
    parents: &Adjacency,
    children: &Adjacency,
    config: &CentralityConfig,
) -> BTreeMap<String, f64> {
    let d = config.damping;
    let base = (1.0 - d) * config.baseline;
    let mut scores: BTreeMap<String, f64> = component
        .iter()
        .map(|n| (n.clone(), config.baseline))
        .collect();

    for _ in 0..config.max_iterations {
        let mut next = BTreeMap::new();
        let mut max_delta: f64 = 0.0;
        for node in component {
            let mut sum = 0.0;
            for m in neighbors(node, parents, children) {
                let deg = degree(m, parents, children);
                if deg > 0 {
                    sum += scores.get(m).copied().unwrap_or(0.0) / deg as f64;
                }
            }
            let value = base + d * sum;
            max_delta = max_delta.max((value - scores[node]).abs());
            next.insert(node.clone(), value);
        }
        scores = next;
        if max_delta < config.tolerance {
            break;
        }
    }
    scores
}

/// Min-max rescale into `[0, 1]`; all zeros when every score is equal.
pub fn rescale(raw: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let min = raw.values().copied().fold(f64::INFINITY, f64::min);
    let max = raw.values().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    raw.iter()
        .map(|(k, v)| {
            let scaled = if range > 0.0 { (v - min) / range } else { 0.0 };
            (k.clone(), scaled)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> (Adjacency, Adjacency) {
        let mut parents = Adjacency::new();
        let mut children = Adjacency::new();
        for (p, c) in edges {
            children.entry(p.to_string()).or_default().push(c.to_string());
            parents.entry(c.to_string()).or_default().push(p.to_string());
        }
        (parents, children)
    }

    #[test]
    fn test_components_split_disconnected_regions() {
        let (parents, children) = graph(&[("a", "b"), ("c", "d")]);
        let seeds = vec!["a".to_string(), "b".to_string(), "d".to_string()];
        let comps = components_of(&seeds, &parents, &children);
        assert_eq!(comps.len(), 2);
        assert!(comps[0].contains("b"));
        assert!(comps[1].contains("c"));
    }

    #[test]
    fn test_hub_scores_highest() {
        let (parents, children) = graph(&[("a", "hub"), ("b", "hub"), ("hub", "c"), ("hub", "d")]);
        let all: Vec<String> = ["a", "b", "c", "d", "hub"].iter().map(|s| s.to_string()).collect();
        let comp = &components_of(&all, &parents, &children)[0];
        let raw = score_component(comp, &parents, &children, &CentralityConfig::default());
        let scaled = rescale(&raw);
        assert_eq!(scaled["hub"], 1.0);
        assert!(scaled["a"] < 1.0);
        assert!((scaled["a"] - scaled["c"]).abs() < 1e-9);
    }

    #[test]
    fn test_isolated_node_keeps_base_score() {
        let (parents, children) = graph(&[]);
        let comp: BTreeSet<String> = ["solo".to_string()].into_iter().collect();
        let cfg = CentralityConfig::default();
        let raw = score_component(&comp, &parents, &children, &cfg);
        assert!((raw["solo"] - (1.0 - cfg.damping) * cfg.baseline).abs() < 1e-12);
    }

    #[test]
    fn test_rescale_equal_scores_is_zero() {
        let raw: BTreeMap<String, f64> = [("a".to_string(), 0.3), ("b".to_string(), 0.3)]
            .into_iter()
            .collect();
        assert!(rescale(&raw).values().all(|v| *v == 0.0));
    }
}
