//! Detail tiers, cost estimation and greedy budget selection.
//!
//! | Distance | Tier | Content |
//! |----------|------|---------|
//! | 0 | full | complete text, all columns with their tests, all tests |
//! | 1 | adjacent | column names and types, no text |
//! | ≥ 2 | distant | name, column count, up to five key columns |
//!
//! Costs are a deterministic estimate: serialized JSON length / 4, plus one.
//! Pivots are always rendered in full. The rest are added in rank order
//! until the first node that no longer fits; that node and everything
//! ranked below it are dropped.

use serde::Serialize;

use crate::models::{Column, GraphNode, Model, TestNode};
use crate::search::RankedNode;
use crate::snapshot::GraphSnapshot;
use crate::traversal::{Side, Subgraph};

const KEY_COLUMN_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Full,
    Adjacent,
    Distant,
}

impl Tier {
    pub fn for_distance(distance: usize) -> Tier {
        match distance {
            0 => Tier::Full,
            1 => Tier::Adjacent,
            _ => Tier::Distant,
        }
    }
}

/// Approximate token cost of any serializable payload.
pub fn estimate_tokens<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0) / 4 + 1
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnDetail {
    pub name: String,
    pub data_type: String,
    pub description: String,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub tests: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestSummary {
    pub name: String,
    pub kind: String,
    pub column_name: String,
    pub severity: String,
    pub last_status: Option<String>,
}

impl TestSummary {
    pub fn from_test(test: &TestNode) -> Self {
        Self {
            name: test.name.clone(),
            kind: test.kind.as_str().to_string(),
            column_name: test.column_name.clone(),
            severity: test.severity.clone(),
            last_status: test.last_run.as_ref().map(|r| r.status.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FullModel {
    pub unique_id: String,
    pub name: String,
    pub layer: &'static str,
    pub materialization: String,
    pub file_path: String,
    pub description: String,
    pub compiled_sql: String,
    pub columns: Vec<ColumnDetail>,
    pub tests: Vec<TestSummary>,
    pub tags: Vec<String>,
    pub depends_on: Vec<String>,
    pub row_count: Option<i64>,
}

impl FullModel {
    pub fn project(snapshot: &GraphSnapshot, model: &Model) -> Self {
        let tests = snapshot.tests_for_model(&model.unique_id);
        let columns = model
            .columns
            .iter()
            .map(|c| ColumnDetail {
                name: c.name.clone(),
                data_type: model.column_type(c).to_string(),
                description: c.description.clone(),
                is_primary_key: c.is_primary_key,
                is_foreign_key: c.is_foreign_key,
                tests: tests
                    .iter()
                    .filter(|t| t.column_name.eq_ignore_ascii_case(&c.name))
                    .map(|t| t.kind.as_str().to_string())
                    .collect(),
            })
            .collect();
        let depends_on = snapshot
            .parents(&model.unique_id)
            .iter()
            .filter_map(|p| snapshot.node(p).map(|n| n.name()))
            .collect();

        Self {
            unique_id: model.unique_id.clone(),
            name: model.name.clone(),
            layer: model.layer.as_str(),
            materialization: model.materialization.clone(),
            file_path: model.file_path.clone(),
            description: model.description.clone(),
            compiled_sql: model.sql_text().to_string(),
            columns,
            tests: tests.into_iter().map(TestSummary::from_test).collect(),
            tags: model.tags.clone(),
            depends_on,
            row_count: model.stats.as_ref().and_then(|s| s.row_count),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnShape {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjacentNode {
    pub unique_id: String,
    pub name: String,
    pub kind: &'static str,
    pub layer: &'static str,
    pub side: Side,
    pub distance: usize,
    pub columns: Vec<ColumnShape>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistantNode {
    pub unique_id: String,
    pub name: String,
    pub kind: &'static str,
    pub layer: &'static str,
    pub side: Side,
    pub distance: usize,
    pub column_count: usize,
    pub key_columns: Vec<String>,
}

fn key_columns(columns: &[Column]) -> Vec<String> {
    let flagged = columns
        .iter()
        .filter(|c| c.is_primary_key || c.is_foreign_key);
    let id_like = columns.iter().filter(|c| {
        let n = c.name.to_lowercase();
        !(c.is_primary_key || c.is_foreign_key) && (n == "id" || n.ends_with("_id"))
    });
    flagged
        .chain(id_like)
        .take(KEY_COLUMN_LIMIT)
        .map(|c| c.name.clone())
        .collect()
}

fn effective_type(node: &GraphNode<'_>, column: &Column) -> String {
    match node {
        GraphNode::Model(m) => m.column_type(column).to_string(),
        _ => column.data_type.clone(),
    }
}

/// A node rendered at a reduced tier.
#[derive(Debug, Clone)]
pub enum Projected {
    Adjacent(AdjacentNode),
    Distant(DistantNode),
}

impl Projected {
    pub fn cost(&self) -> usize {
        match self {
            Projected::Adjacent(n) => estimate_tokens(n),
            Projected::Distant(n) => estimate_tokens(n),
        }
    }
}

/// Render a non-pivot node at the tier its distance calls for.
pub fn project_neighbor(node: GraphNode<'_>, side: Side, distance: usize) -> Projected {
    let columns = node.columns();
    match Tier::for_distance(distance) {
        Tier::Full | Tier::Adjacent => Projected::Adjacent(AdjacentNode {
            unique_id: node.id().to_string(),
            name: node.name(),
            kind: node.kind().as_str(),
            layer: node.layer_label(),
            side,
            distance,
            columns: columns
                .iter()
                .map(|c| ColumnShape {
                    name: c.name.clone(),
                    data_type: effective_type(&node, c),
                })
                .collect(),
        }),
        Tier::Distant => Projected::Distant(DistantNode {
            unique_id: node.id().to_string(),
            name: node.name(),
            kind: node.kind().as_str(),
            layer: node.layer_label(),
            side,
            distance,
            column_count: columns.len(),
            key_columns: key_columns(columns),
        }),
    }
}

/// Result of fitting a subgraph into a token budget.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub pivots: Vec<FullModel>,
    pub adjacent: Vec<AdjacentNode>,
    pub distant: Vec<DistantNode>,
    pub used_tokens: usize,
    pub pivot_tokens: usize,
    pub considered: usize,
    pub dropped: usize,
}

impl Selection {
    pub fn included(&self) -> usize {
        self.pivots.len() + self.adjacent.len() + self.distant.len()
    }

    pub fn budget_exceeded(&self, budget: usize) -> bool {
        self.pivot_tokens > budget
    }

    pub fn remaining(&self, budget: usize) -> usize {
        budget.saturating_sub(self.used_tokens)
    }
}

/// Fit `pivots` plus the ranked remainder of `subgraph` into `budget`.
///
/// `ranked` must hold the non-pivot nodes of `subgraph`, best first.
pub fn select(
    snapshot: &GraphSnapshot,
    pivots: &[String],
    subgraph: &Subgraph,
    ranked: &[RankedNode],
    budget: usize,
) -> Selection {
    let mut selection = Selection {
        considered: subgraph.nodes.len(),
        ..Default::default()
    };

    for id in pivots {
        if let Some(model) = snapshot.models.get(id) {
            let full = FullModel::project(snapshot, model);
            selection.pivot_tokens += estimate_tokens(&full);
            selection.pivots.push(full);
        }
    }
    selection.used_tokens = selection.pivot_tokens;

    for node in ranked {
        let (Some(graph_node), Some(visit)) =
            (snapshot.node(&node.unique_id), subgraph.nodes.get(&node.unique_id))
        else {
            continue;
        };
        if visit.distance == 0 {
            continue;
        }
        let projected = project_neighbor(graph_node, visit.side, visit.distance);
        let cost = projected.cost();
        if selection.used_tokens + cost > budget {
            break;
        }
        selection.used_tokens += cost;
        match projected {
            Projected::Adjacent(n) => selection.adjacent.push(n),
            Projected::Distant(n) => selection.distant.push(n),
        }
    }

    selection.dropped = selection.considered.saturating_sub(selection.included());
    selection
}
