//! Bounded lineage traversal.
//!
//! Breadth-first expansion from a set of pivots, run once per direction
//! as a single multi-source search. Each node is visited at most once per
//! direction and keeps the distance at which it was first reached; when a
//! node is reached both upstream and downstream it keeps the shorter of the
//! two. The visited set also guards against cycles that slipped past
//! ingestion.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::RetrievalConfig;
use crate::error::{EngineError, EngineResult};
use crate::snapshot::GraphSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upstream,
    Downstream,
    Both,
}

impl Direction {
    pub fn parse(s: &str) -> EngineResult<Direction> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upstream" | "up" => Ok(Direction::Upstream),
            "downstream" | "down" => Ok(Direction::Downstream),
            "both" => Ok(Direction::Both),
            other => Err(EngineError::validation(
                "direction",
                format!("'{}' is not one of upstream, downstream, both", other),
            )),
        }
    }
}

/// Which side of the pivots a node was reached on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Pivot,
    Upstream,
    Downstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Visit {
    pub distance: usize,
    pub side: Side,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Subgraph {
    pub nodes: BTreeMap<String, Visit>,
    /// Edges whose endpoints are both in `nodes`, as `(parent, child)`.
    pub edges: Vec<(String, String)>,
}

impl Subgraph {
    pub fn distance(&self, id: &str) -> Option<usize> {
        self.nodes.get(id).map(|v| v.distance)
    }
}

fn expand(
    snapshot: &GraphSnapshot,
    pivots: &BTreeSet<String>,
    max_depth: usize,
    upstream: bool,
) -> BTreeMap<String, usize> {
    let mut seen: BTreeMap<String, usize> = pivots.iter().map(|p| (p.clone(), 0)).collect();
    let mut queue: VecDeque<(String, usize)> = pivots.iter().map(|p| (p.clone(), 0)).collect();

    while let Some((node, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let next = if upstream {
            snapshot.parents(&node)
        } else {
            snapshot.children(&node)
        };
        for n in next {
            if !seen.contains_key(n) {
                seen.insert(n.clone(), depth + 1);
                queue.push_back((n.clone(), depth + 1));
            }
        }
    }
    seen
}

/// Expand from `pivots` up to `max_upstream` parents-deep and
/// `max_downstream` children-deep. Pivots unknown to the graph are ignored.
pub fn traverse(
    snapshot: &GraphSnapshot,
    pivots: &[String],
    direction: Direction,
    max_upstream: usize,
    max_downstream: usize,
) -> Subgraph {
    let pivots: BTreeSet<String> = pivots
        .iter()
        .filter(|p| snapshot.contains_node(p))
        .cloned()
        .collect();

    let mut nodes: BTreeMap<String, Visit> = pivots
        .iter()
        .map(|p| {
            (
                p.clone(),
                Visit {
                    distance: 0,
                    side: Side::Pivot,
                },
            )
        })
        .collect();

    let mut merge = |found: BTreeMap<String, usize>, side: Side| {
        for (id, distance) in found {
            if distance == 0 {
                continue;
            }
            let visit = Visit { distance, side };
            nodes
                .entry(id)
                .and_modify(|v| {
                    if distance < v.distance {
                        *v = visit;
                    }
                })
                .or_insert(visit);
        }
    };

    if matches!(direction, Direction::Upstream | Direction::Both) {
        merge(expand(snapshot, &pivots, max_upstream, true), Side::Upstream);
    }
    if matches!(direction, Direction::Downstream | Direction::Both) {
        merge(
            expand(snapshot, &pivots, max_downstream, false),
            Side::Downstream,
        );
    }

    let edges = snapshot
        .edges
        .iter()
        .filter(|e| nodes.contains_key(&e.parent_id) && nodes.contains_key(&e.child_id))
        .map(|e| (e.parent_id.clone(), e.child_id.clone()))
        .collect();

    Subgraph { nodes, edges }
}

/// A node in a lineage answer.
#[derive(Debug, Clone, Serialize)]
pub struct LineageNode {
    pub unique_id: String,
    pub name: String,
    pub kind: &'static str,
    pub layer: &'static str,
    pub distance: usize,
    pub materialization: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LineageResult {
    pub model: String,
    pub unique_id: String,
    pub direction: Direction,
    pub depth: usize,
    pub upstream: Vec<LineageNode>,
    pub downstream: Vec<LineageNode>,
    pub edges: Vec<(String, String)>,
}

/// `get_lineage(model_name, direction?, depth?)`.
pub fn get_lineage(
    snapshot: &GraphSnapshot,
    config: &RetrievalConfig,
    model_name: &str,
    direction: Option<&str>,
    depth: Option<i64>,
) -> EngineResult<LineageResult> {
    let direction = match direction {
        Some(d) => Direction::parse(d)?,
        None => Direction::Both,
    };
    let depth = depth.unwrap_or(config.default_lineage_depth);
    if depth < 0 {
        return Err(EngineError::validation(
            "depth",
            format!("must be >= 0, got {}", depth),
        ));
    }
    let depth = depth.min(config.max_lineage_depth) as usize;

    let model = snapshot
        .find_model(model_name)
        .ok_or_else(|| EngineError::not_found("model", model_name))?;

    let subgraph = traverse(
        snapshot,
        std::slice::from_ref(&model.unique_id),
        direction,
        depth,
        depth,
    );

    let mut upstream = Vec::new();
    let mut downstream = Vec::new();
    for (id, visit) in &subgraph.nodes {
        let Some(node) = snapshot.node(id) else {
            continue;
        };
        let entry = LineageNode {
            unique_id: id.clone(),
            name: node.name(),
            kind: node.kind().as_str(),
            layer: node.layer_label(),
            distance: visit.distance,
            materialization: match node {
                crate::models::GraphNode::Model(m) => Some(m.materialization.clone()),
                _ => None,
            },
        };
        match visit.side {
            Side::Upstream => upstream.push(entry),
            Side::Downstream => downstream.push(entry),
            Side::Pivot => {}
        }
    }
    let order = |a: &LineageNode, b: &LineageNode| {
        a.distance.cmp(&b.distance).then_with(|| a.name.cmp(&b.name))
    };
    upstream.sort_by(order);
    downstream.sort_by(order);

    Ok(LineageResult {
        model: model.name.clone(),
        unique_id: model.unique_id.clone(),
        direction,
        depth,
        upstream,
        downstream,
        edges: subgraph.edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CentralityConfig;
    use crate::models::{test_model, Edge};
    use crate::snapshot::StagedGraph;

    fn snapshot(names: &[&str], edges: &[(&str, &str)]) -> GraphSnapshot {
        let mut staged = StagedGraph::default();
        for n in names {
            let m = test_model(&format!("model.p.{}", n), n);
            staged.models.insert(m.unique_id.clone(), m);
        }
        for (p, c) in edges {
            staged
                .edges
                .insert(Edge::new(format!("model.p.{}", p), format!("model.p.{}", c)));
        }
        GraphSnapshot::publish(staged, None, None, &CentralityConfig::default(), 1)
    }

    fn ids(sub: &Subgraph) -> Vec<&str> {
        sub.nodes.keys().map(|k| k.as_str()).collect()
    }

    #[test]
    fn test_depth_zero_returns_pivots_only() {
        let snap = snapshot(&["a", "b"], &[("a", "b")]);
        let sub = traverse(&snap, &["model.p.a".into()], Direction::Both, 0, 0);
        assert_eq!(ids(&sub), vec!["model.p.a"]);
    }

    #[test]
    fn test_first_reached_distance_wins() {
        // diamond: a -> b -> d, a -> c -> d, a -> d
        let snap = snapshot(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("a", "d")],
        );
        let sub = traverse(&snap, &["model.p.a".into()], Direction::Downstream, 0, 5);
        assert_eq!(sub.distance("model.p.d"), Some(1));
        assert_eq!(sub.nodes.len(), 4);
    }

    #[test]
    fn test_bounded_by_depth_per_direction() {
        let snap = snapshot(
            &["a", "b", "c", "d", "e"],
            &[("a", "b"), ("b", "c"), ("c", "d"), ("d", "e")],
        );
        let sub = traverse(&snap, &["model.p.c".into()], Direction::Both, 1, 2);
        assert_eq!(
            ids(&sub),
            vec!["model.p.b", "model.p.c", "model.p.d", "model.p.e"]
        );
        assert_eq!(sub.nodes["model.p.b"].side, Side::Upstream);
        assert_eq!(sub.edges.len(), 3);
    }

    #[test]
    fn test_cycle_guard_terminates() {
        let mut staged = StagedGraph::default();
        for n in ["a", "b"] {
            let m = test_model(&format!("model.p.{}", n), n);
            staged.models.insert(m.unique_id.clone(), m);
        }
        staged.edges.insert(Edge::new("model.p.a", "model.p.b"));
        staged.edges.insert(Edge::new("model.p.b", "model.p.a"));
        let snap = GraphSnapshot::publish(staged, None, None, &CentralityConfig::default(), 1);
        let sub = traverse(&snap, &["model.p.a".into()], Direction::Both, 10, 10);
        assert_eq!(sub.nodes.len(), 2);
    }

    #[test]
    fn test_get_lineage_validation() {
        let snap = snapshot(&["a", "b", "c"], &[("a", "b"), ("b", "c")]);
        let cfg = RetrievalConfig::default();

        let down = get_lineage(&snap, &cfg, "b", Some("downstream"), Some(1)).unwrap();
        let names: Vec<&str> = down.downstream.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["c"]);
        assert!(down.upstream.is_empty());

        assert!(matches!(
            get_lineage(&snap, &cfg, "b", Some("sideways"), None),
            Err(EngineError::Validation { .. })
        ));
        assert!(matches!(
            get_lineage(&snap, &cfg, "b", None, Some(-1)),
            Err(EngineError::Validation { .. })
        ));
        assert!(matches!(
            get_lineage(&snap, &cfg, "zzz", None, None),
            Err(EngineError::NotFound { .. })
        ));
        let clamped = get_lineage(&snap, &cfg, "b", None, Some(999)).unwrap();
        assert_eq!(clamped.depth, 10);
    }
}
