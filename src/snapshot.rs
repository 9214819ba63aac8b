//! The normalized graph store.
//!
//! A [`GraphSnapshot`] is an immutable, fully derived view of the graph:
//! entities, edges, adjacency, centrality and the lexical index. Writers
//! build a [`StagedGraph`] with structural data only, then call
//! [`GraphSnapshot::publish`], which runs the recompute pass (degrees,
//! centrality, key-column flags, search index) over the staged data. The
//! result replaces the current snapshot in a [`SnapshotCell`] in one swap,
//! so readers never see edges without their recomputed centrality.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use crate::centrality::{self, Adjacency};
use crate::config::CentralityConfig;
use crate::lexical::SearchIndex;
use crate::models::{Edge, Exposure, GraphNode, Macro, Model, Source, TestKind, TestNode};

/// Structural graph content before derived fields are computed.
#[derive(Debug, Clone, Default)]
pub struct StagedGraph {
    pub models: BTreeMap<String, Model>,
    pub sources: BTreeMap<String, Source>,
    pub tests: BTreeMap<String, TestNode>,
    pub macros: BTreeMap<String, Macro>,
    pub exposures: BTreeMap<String, Exposure>,
    pub edges: BTreeSet<Edge>,
    pub metadata: BTreeMap<String, String>,
}

impl StagedGraph {
    pub fn contains_node(&self, id: &str) -> bool {
        self.models.contains_key(id)
            || self.sources.contains_key(id)
            || self.macros.contains_key(id)
            || self.exposures.contains_key(id)
    }

    fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.models
            .keys()
            .chain(self.sources.keys())
            .chain(self.macros.keys())
            .chain(self.exposures.keys())
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub models: BTreeMap<String, Model>,
    pub sources: BTreeMap<String, Source>,
    pub tests: BTreeMap<String, TestNode>,
    pub macros: BTreeMap<String, Macro>,
    pub exposures: BTreeMap<String, Exposure>,
    pub edges: BTreeSet<Edge>,
    pub metadata: BTreeMap<String, String>,
    pub generation: i64,
    parents: Adjacency,
    children: Adjacency,
    raw_centrality: BTreeMap<String, f64>,
    centrality: BTreeMap<String, f64>,
    tests_by_model: BTreeMap<String, Vec<String>>,
    index: SearchIndex,
}

impl GraphSnapshot {
    /// Run the recompute pass over `staged` and produce a publishable snapshot.
    ///
    /// With `affected = Some(ids)` and a previous snapshot, centrality is
    /// recomputed only for the weakly connected components containing those
    /// ids; every other node keeps its previous raw score. Rescaling is
    /// always global.
    pub fn publish(
        staged: StagedGraph,
        previous: Option<&GraphSnapshot>,
        affected: Option<&BTreeSet<String>>,
        config: &CentralityConfig,
        generation: i64,
    ) -> GraphSnapshot {
        let mut parents = Adjacency::new();
        let mut children = Adjacency::new();
        for edge in &staged.edges {
            children
                .entry(edge.parent_id.clone())
                .or_default()
                .push(edge.child_id.clone());
            parents
                .entry(edge.child_id.clone())
                .or_default()
                .push(edge.parent_id.clone());
        }

        let mut raw: BTreeMap<String, f64> = BTreeMap::new();
        let seeds: Vec<String> = match (previous, affected) {
            (Some(prev), Some(affected)) => staged
                .node_ids()
                .filter(|id| affected.contains(*id) || !prev.raw_centrality.contains_key(*id))
                .cloned()
                .collect(),
            _ => staged.node_ids().cloned().collect(),
        };
        for component in centrality::components_of(&seeds, &parents, &children) {
            raw.extend(centrality::score_component(
                &component, &parents, &children, config,
            ));
        }
        if let Some(prev) = previous {
            for id in staged.node_ids() {
                if !raw.contains_key(id) {
                    if let Some(score) = prev.raw_centrality.get(id) {
                        raw.insert(id.clone(), *score);
                    }
                }
            }
        }
        let scaled = centrality::rescale(&raw);

        let StagedGraph {
            mut models,
            sources,
            tests,
            macros,
            exposures,
            edges,
            metadata,
        } = staged;

        let mut tests_by_model: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for test in tests.values() {
            if let Some(model_id) = &test.model_id {
                tests_by_model
                    .entry(model_id.clone())
                    .or_default()
                    .push(test.unique_id.clone());
            }
        }

        for (id, model) in models.iter_mut() {
            model.upstream_count = parents.get(id).map_or(0, |v| v.len()) as i64;
            model.downstream_count = children.get(id).map_or(0, |v| v.len()) as i64;
            model.centrality = scaled.get(id).copied().unwrap_or(0.0);

            let model_tests: Vec<&TestNode> = tests_by_model
                .get(id)
                .into_iter()
                .flatten()
                .filter_map(|t| tests.get(t))
                .collect();
            for column in model.columns.iter_mut() {
                let has = |kind: TestKind| {
                    model_tests
                        .iter()
                        .any(|t| t.kind == kind && t.column_name.eq_ignore_ascii_case(&column.name))
                };
                let primary = has(TestKind::Unique) && has(TestKind::NotNull);
                let foreign = has(TestKind::Relationships);
                column.is_primary_key = primary;
                column.is_foreign_key = foreign;
            }
        }

        let index = SearchIndex::build(&models, previous.map(|p| &p.index));

        GraphSnapshot {
            models,
            sources,
            tests,
            macros,
            exposures,
            edges,
            metadata,
            generation,
            parents,
            children,
            raw_centrality: raw,
            centrality: scaled,
            tests_by_model,
            index,
        }
    }

    /// Structural content of this snapshot, for staging the next pass.
    pub fn to_staged(&self) -> StagedGraph {
        StagedGraph {
            models: self.models.clone(),
            sources: self.sources.clone(),
            tests: self.tests.clone(),
            macros: self.macros.clone(),
            exposures: self.exposures.clone(),
            edges: self.edges.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn node(&self, id: &str) -> Option<GraphNode<'_>> {
        if let Some(m) = self.models.get(id) {
            return Some(GraphNode::Model(m));
        }
        if let Some(s) = self.sources.get(id) {
            return Some(GraphNode::Source(s));
        }
        if let Some(m) = self.macros.get(id) {
            return Some(GraphNode::Macro(m));
        }
        self.exposures.get(id).map(GraphNode::Exposure)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn parents(&self, id: &str) -> &[String] {
        self.parents.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.children.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Rescaled centrality of any graph node.
    pub fn centrality(&self, id: &str) -> f64 {
        self.centrality.get(id).copied().unwrap_or(0.0)
    }

    pub fn tests_for_model(&self, model_id: &str) -> Vec<&TestNode> {
        self.tests_by_model
            .get(model_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tests.get(id))
            .collect()
    }

    pub fn index(&self) -> &SearchIndex {
        &self.index
    }

    /// Resolve a model by unique id, exact name, or case-insensitive name.
    pub fn find_model(&self, name_or_id: &str) -> Option<&Model> {
        let needle = name_or_id.trim();
        self.models
            .get(needle)
            .or_else(|| self.models.values().find(|m| m.name == needle))
            .or_else(|| {
                self.models
                    .values()
                    .find(|m| m.name.eq_ignore_ascii_case(needle))
            })
    }

    /// Number of entities across all kinds (edges excluded).
    pub fn entity_count(&self) -> usize {
        self.models.len()
            + self.sources.len()
            + self.tests.len()
            + self.macros.len()
            + self.exposures.len()
    }
}

/// Holder of the current published snapshot.
///
/// Readers clone the `Arc` and work against it for the rest of the request;
/// the writer replaces it wholesale.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Arc<GraphSnapshot>>,
}

impl SnapshotCell {
    pub fn new(snapshot: GraphSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<GraphSnapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn swap(&self, snapshot: Arc<GraphSnapshot>) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{test_model, Column};

    fn column(name: &str) -> Column {
        Column {
            name: name.into(),
            data_type: "int".into(),
            description: String::new(),
            meta: serde_json::json!({}),
            tags: vec![],
            is_primary_key: false,
            is_foreign_key: false,
        }
    }

    fn test_node(id: &str, model: &str, column: &str, kind: TestKind) -> TestNode {
        TestNode {
            unique_id: id.into(),
            name: id.into(),
            kind,
            model_id: Some(model.into()),
            column_name: column.into(),
            depends_on: vec![model.into()],
            severity: "error".into(),
            last_run: None,
            content_hash: id.into(),
        }
    }

    fn chain() -> StagedGraph {
        let mut staged = StagedGraph::default();
        for name in ["a", "b", "c"] {
            let mut m = test_model(&format!("model.p.{}", name), name);
            m.content_hash = name.into();
            staged.models.insert(m.unique_id.clone(), m);
        }
        staged.edges.insert(Edge::new("model.p.a", "model.p.b"));
        staged.edges.insert(Edge::new("model.p.b", "model.p.c"));
        staged
    }

    #[test]
    fn test_publish_derives_counts_and_centrality() {
        let snap = GraphSnapshot::publish(chain(), None, None, &CentralityConfig::default(), 1);
        let b = &snap.models["model.p.b"];
        assert_eq!((b.upstream_count, b.downstream_count), (1, 1));
        assert_eq!(b.centrality, 1.0);
        assert_eq!(snap.parents("model.p.b"), ["model.p.a".to_string()]);
        assert_eq!(snap.children("model.p.c").len(), 0);
    }

    #[test]
    fn test_publish_infers_key_columns() {
        let mut staged = chain();
        let model = staged.models.get_mut("model.p.a").unwrap();
        model.columns = vec![column("id"), column("customer_id")];
        for t in [
            test_node("test.u", "model.p.a", "id", TestKind::Unique),
            test_node("test.n", "model.p.a", "ID", TestKind::NotNull),
            test_node("test.r", "model.p.a", "customer_id", TestKind::Relationships),
            test_node("test.n2", "model.p.a", "customer_id", TestKind::NotNull),
        ] {
            staged.tests.insert(t.unique_id.clone(), t);
        }
        let snap = GraphSnapshot::publish(staged, None, None, &CentralityConfig::default(), 1);
        let cols = &snap.models["model.p.a"].columns;
        assert!(cols[0].is_primary_key && !cols[0].is_foreign_key);
        assert!(!cols[1].is_primary_key && cols[1].is_foreign_key);
        assert_eq!(snap.tests_for_model("model.p.a").len(), 4);
    }

    #[test]
    fn test_partial_recompute_matches_full() {
        let cfg = CentralityConfig::default();
        let mut staged = chain();
        let mut lone = test_model("model.p.z", "z");
        lone.content_hash = "z".into();
        staged.models.insert(lone.unique_id.clone(), lone);
        let base = GraphSnapshot::publish(staged.clone(), None, None, &cfg, 1);

        staged.edges.insert(Edge::new("model.p.c", "model.p.z"));
        let affected: BTreeSet<String> =
            ["model.p.c".to_string(), "model.p.z".to_string()].into();
        let partial = GraphSnapshot::publish(staged.clone(), Some(&base), Some(&affected), &cfg, 2);
        let full = GraphSnapshot::publish(staged, None, None, &cfg, 2);
        for (id, m) in &full.models {
            assert_eq!(m.centrality, partial.models[id].centrality, "{}", id);
        }
    }

    #[test]
    fn test_find_model_by_name_or_id() {
        let snap = GraphSnapshot::publish(chain(), None, None, &CentralityConfig::default(), 1);
        assert_eq!(snap.find_model("B").map(|m| m.name.as_str()), Some("b"));
        assert_eq!(
            snap.find_model("model.p.c").map(|m| m.name.as_str()),
            Some("c")
        );
        assert!(snap.find_model("missing").is_none());
    }

    #[test]
    fn test_cell_swap_is_visible_to_new_readers() {
        let cell = SnapshotCell::default();
        let before = cell.load();
        let snap = GraphSnapshot::publish(chain(), None, None, &CentralityConfig::default(), 7);
        cell.swap(Arc::new(snap));
        assert_eq!(before.generation, 0);
        assert_eq!(cell.load().generation, 7);
    }
}
