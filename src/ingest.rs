//! Ingestion staging.
//!
//! [`stage`] turns a [`RecordBundle`] into the structural content of the
//! next snapshot, comparing it against the currently published one:
//!
//! 1. decode every record on its own, collecting malformed and duplicate
//!    records as [`IngestionError`]s;
//! 2. in incremental mode, keep the published entity for every record whose
//!    content hash is unchanged;
//! 3. drop tests, edges and overlays that point at unknown identifiers;
//! 4. reject the pass when the edge set contains a directed cycle;
//! 5. reset and reapply the warehouse-stats and test-result overlays.
//!
//! The result carries the set of node ids whose neighborhood must have its
//! centrality recomputed. Staging is pure CPU work; the engine runs it on
//! the blocking pool and then publishes and persists the outcome.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{IngestionError, IngestionErrorKind};
use crate::records::{
    decode, EdgeRecord, ExposureRecord, MacroRecord, ModelRecord, ModelStatsRecord, RecordBundle,
    SourceRecord, TestRecord, TestResultRecord,
};
use crate::models::Edge;
use crate::snapshot::{GraphSnapshot, StagedGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Full,
    Incremental,
}

impl IndexMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexMode::Full => "full",
            IndexMode::Incremental => "incremental",
        }
    }
}

/// Outcome of one ingestion pass.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub mode: IndexMode,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
    pub errors: Vec<IngestionError>,
    /// False when the pass was rejected (cycle) and nothing was published.
    pub committed: bool,
    pub duration_ms: u64,
    pub generation: i64,
}

impl IndexReport {
    fn new(mode: IndexMode) -> Self {
        Self {
            mode,
            added: 0,
            updated: 0,
            removed: 0,
            unchanged: 0,
            edges_added: 0,
            edges_removed: 0,
            errors: Vec::new(),
            committed: false,
            duration_ms: 0,
            generation: 0,
        }
    }

    fn error(&mut self, kind: IngestionErrorKind, record: impl Into<String>, message: impl Into<String>) {
        self.errors.push(IngestionError::new(kind, record, message));
    }
}

/// Staged structural content plus what changed relative to the published snapshot.
#[derive(Debug)]
pub struct StagedPass {
    pub graph: StagedGraph,
    /// Node ids whose components need centrality recomputed.
    pub affected: BTreeSet<String>,
    pub report: IndexReport,
    pub rejected: bool,
}

/// Entities that carry a unique id and a content hash.
trait Hashed {
    fn id(&self) -> &str;
    fn hash(&self) -> &str;
    /// Clear overlay fields so they can be reapplied.
    fn reset_overlay(&mut self) {}
}

macro_rules! impl_hashed {
    ($ty:ty) => {
        impl Hashed for $ty {
            fn id(&self) -> &str {
                &self.unique_id
            }
            fn hash(&self) -> &str {
                &self.content_hash
            }
        }
    };
    ($ty:ty, $field:ident) => {
        impl Hashed for $ty {
            fn id(&self) -> &str {
                &self.unique_id
            }
            fn hash(&self) -> &str {
                &self.content_hash
            }
            fn reset_overlay(&mut self) {
                self.$field = None;
            }
        }
    };
}

impl_hashed!(crate::models::Model, stats);
impl_hashed!(crate::models::TestNode, last_run);
impl_hashed!(crate::models::Source);
impl_hashed!(crate::models::Macro);
impl_hashed!(crate::models::Exposure);

struct Stager {
    mode: IndexMode,
    report: IndexReport,
    seen: HashSet<String>,
    changed: BTreeSet<String>,
}

impl Stager {
    /// Decode one record array into an id-keyed map, classifying every
    /// entity as added, updated or unchanged.
    fn collect<R, T, F>(
        &mut self,
        kind: &str,
        values: &[Value],
        previous: &BTreeMap<String, T>,
        convert: F,
    ) -> BTreeMap<String, T>
    where
        R: serde::de::DeserializeOwned,
        T: Hashed + Clone,
        F: Fn(R, &Value) -> Result<T, IngestionError>,
    {
        let mut out = BTreeMap::new();
        for (position, value) in values.iter().enumerate() {
            let entity = match decode::<R>(kind, position, value).and_then(|r| convert(r, value)) {
                Ok(e) => e,
                Err(e) => {
                    self.report.errors.push(e);
                    continue;
                }
            };
            let id = entity.id().to_string();
            if !self.seen.insert(id.clone()) {
                self.report.error(
                    IngestionErrorKind::Duplicate,
                    &id,
                    format!("identifier already staged; {} record ignored", kind),
                );
                continue;
            }

            let mut entity = match previous.get(&id) {
                Some(old) if self.mode == IndexMode::Incremental && old.hash() == entity.hash() => {
                    self.report.unchanged += 1;
                    old.clone()
                }
                Some(_) => {
                    self.report.updated += 1;
                    self.changed.insert(id.clone());
                    entity
                }
                None => {
                    self.report.added += 1;
                    self.changed.insert(id.clone());
                    entity
                }
            };
            entity.reset_overlay();
            out.insert(id, entity);
        }

        for id in previous.keys() {
            if !out.contains_key(id) {
                self.report.removed += 1;
                self.changed.insert(id.clone());
            }
        }
        out
    }
}

/// Stage `bundle` against the published snapshot `previous`.
pub fn stage(bundle: &RecordBundle, previous: &GraphSnapshot, mode: IndexMode) -> StagedPass {
    let mut stager = Stager {
        mode,
        report: IndexReport::new(mode),
        seen: HashSet::new(),
        changed: BTreeSet::new(),
    };

    let mut graph = StagedGraph {
        models: stager.collect("models", &bundle.models, &previous.models, |r: ModelRecord, v| {
            r.into_model(v)
        }),
        sources: stager.collect("sources", &bundle.sources, &previous.sources, |r: SourceRecord, v| {
            r.into_source(v)
        }),
        macros: stager.collect("macros", &bundle.macros, &previous.macros, |r: MacroRecord, v| {
            r.into_macro(v)
        }),
        exposures: stager.collect(
            "exposures",
            &bundle.exposures,
            &previous.exposures,
            |r: ExposureRecord, v| r.into_exposure(v),
        ),
        tests: BTreeMap::new(),
        edges: BTreeSet::new(),
        metadata: bundle.metadata_strings(),
    };
    let tests = stager.collect("tests", &bundle.tests, &previous.tests, |r: TestRecord, v| {
        r.into_test(v)
    });

    let Stager {
        mut report,
        changed,
        ..
    } = stager;

    // Tests attach to models; a dangling attachment is dropped with the model.
    for (id, test) in tests {
        match &test.model_id {
            Some(model_id) if !graph.models.contains_key(model_id) => {
                report.error(
                    IngestionErrorKind::Unresolved,
                    &id,
                    format!("test references unknown model '{}'", model_id),
                );
            }
            _ => {
                graph.tests.insert(id, test);
            }
        }
    }

    let mut rejected = false;
    for (position, value) in bundle.edges.iter().enumerate() {
        let record: EdgeRecord = match decode("edges", position, value) {
            Ok(r) => r,
            Err(e) => {
                report.errors.push(e);
                continue;
            }
        };
        let label = format!("{} -> {}", record.parent_id, record.child_id);
        if record.parent_id == record.child_id {
            report.error(IngestionErrorKind::Cycle, label, "edge is a self-loop");
            rejected = true;
            continue;
        }
        let missing: Vec<&str> = [&record.parent_id, &record.child_id]
            .into_iter()
            .filter(|id| !graph.contains_node(id))
            .map(|id| id.as_str())
            .collect();
        if !missing.is_empty() {
            report.error(
                IngestionErrorKind::Unresolved,
                label,
                format!("unknown endpoint(s): {}", missing.join(", ")),
            );
            continue;
        }
        graph.edges.insert(Edge::new(record.parent_id, record.child_id));
    }

    if let Some(cycle) = find_cycle(&graph.edges) {
        report.error(IngestionErrorKind::Cycle, &cycle, "dependency cycle detected");
        rejected = true;
    }

    apply_overlays(&mut graph, bundle, &mut report);

    let mut affected = changed;
    for edge in graph.edges.symmetric_difference(&previous.edges) {
        affected.insert(edge.parent_id.clone());
        affected.insert(edge.child_id.clone());
    }
    report.edges_added = graph.edges.difference(&previous.edges).count();
    report.edges_removed = previous.edges.difference(&graph.edges).count();

    StagedPass {
        graph,
        affected,
        report,
        rejected,
    }
}

fn apply_overlays(graph: &mut StagedGraph, bundle: &RecordBundle, report: &mut IndexReport) {
    for (position, value) in bundle.model_stats.iter().enumerate() {
        match decode::<ModelStatsRecord>("model_stats", position, value) {
            Ok(record) => match graph.models.get_mut(&record.model_id) {
                Some(model) => model.stats = Some(record.into_stats()),
                None => report.error(
                    IngestionErrorKind::Unresolved,
                    &record.model_id,
                    "statistics for unknown model",
                ),
            },
            Err(e) => report.errors.push(e),
        }
    }

    for (position, value) in bundle.test_results.iter().enumerate() {
        match decode::<TestResultRecord>("test_results", position, value) {
            Ok(record) => match graph.tests.get_mut(&record.test_id) {
                Some(test) => test.last_run = Some(record.into_run()),
                None => report.error(
                    IngestionErrorKind::Unresolved,
                    &record.test_id,
                    "result for unknown test",
                ),
            },
            Err(e) => report.errors.push(e),
        }
    }
}

/// Render a cycle path when the edge set is not a DAG.
pub fn find_cycle(edges: &BTreeSet<Edge>) -> Option<String> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for edge in edges {
        let p = *nodes
            .entry(edge.parent_id.as_str())
            .or_insert_with(|| graph.add_node(edge.parent_id.as_str()));
        let c = *nodes
            .entry(edge.child_id.as_str())
            .or_insert_with(|| graph.add_node(edge.child_id.as_str()));
        graph.add_edge(p, c, ());
    }

    let start = match toposort(&graph, None) {
        Ok(_) => return None,
        Err(cycle) => cycle.node_id(),
    };

    // Walk forward until a node repeats; the repeated suffix is the cycle.
    let mut path = vec![start];
    let mut visited = HashSet::from([start]);
    let mut current = start;
    loop {
        let next = graph
            .edges(current)
            .map(|e| e.target())
            .find(|t| has_path(&graph, *t, start) || visited.contains(t));
        let Some(next) = next else { break };
        path.push(next);
        if !visited.insert(next) {
            break;
        }
        current = next;
    }

    Some(
        path.iter()
            .map(|idx| graph[*idx])
            .collect::<Vec<_>>()
            .join(" -> "),
    )
}

fn has_path(graph: &DiGraph<&str, ()>, from: NodeIndex, to: NodeIndex) -> bool {
    petgraph::algo::has_path_connecting(graph, from, to, None)
}
