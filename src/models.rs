//! Core data models used throughout the engine.
//!
//! These types are the canonical in-process form of the dependency graph:
//! transformation units ([`Model`]), external origins ([`Source`]),
//! validation units ([`TestNode`]), reusable snippets ([`Macro`]),
//! downstream consumers ([`Exposure`]) and the directed [`Edge`]s between
//! them. Fields marked *computed* are always re-derived from the edge set
//! and test records by the snapshot recompute pass.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coarse layer classification of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Staging,
    Intermediate,
    Marts,
    Other,
}

const LAYER_KEYWORDS: &[(Layer, &[&str])] = &[
    (Layer::Staging, &["staging", "stg"]),
    (Layer::Intermediate, &["intermediate", "int"]),
    (
        Layer::Marts,
        &["marts", "mart", "fct", "dim", "agg", "rpt", "report"],
    ),
];

impl Layer {
    pub const ALL: [Layer; 4] = [
        Layer::Staging,
        Layer::Intermediate,
        Layer::Marts,
        Layer::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Staging => "staging",
            Layer::Intermediate => "intermediate",
            Layer::Marts => "marts",
            Layer::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Layer> {
        match s.trim().to_ascii_lowercase().as_str() {
            "staging" => Some(Layer::Staging),
            "intermediate" => Some(Layer::Intermediate),
            "marts" => Some(Layer::Marts),
            "other" => Some(Layer::Other),
            _ => None,
        }
    }

    /// Path and name keywords that mark a model as belonging to this layer.
    pub fn keywords(&self) -> &'static [&'static str] {
        LAYER_KEYWORDS
            .iter()
            .find(|(layer, _)| layer == self)
            .map(|(_, keywords)| *keywords)
            .unwrap_or(&[])
    }

    /// Infer the layer from the qualified path (package segment skipped),
    /// the model name and its tags.
    pub fn detect(fqn: &[String], name: &str, tags: &[String]) -> Layer {
        let path_parts = if fqn.len() > 1 { &fqn[1..] } else { &[] };
        let candidates: Vec<String> = path_parts
            .iter()
            .map(|p| p.to_lowercase())
            .chain(std::iter::once(name.to_lowercase()))
            .chain(tags.iter().map(|t| t.to_lowercase()))
            .collect();

        for (layer, keywords) in LAYER_KEYWORDS {
            let hit = candidates.iter().any(|c| {
                keywords
                    .iter()
                    .any(|kw| c.starts_with(kw) || c.contains(&format!("/{}", kw)))
            });
            if hit {
                return *layer;
            }
        }
        Layer::Other
    }
}

/// Classification of a test record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    NotNull,
    Unique,
    AcceptedValues,
    Relationships,
    Generic,
    Singular,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::NotNull => "not_null",
            TestKind::Unique => "unique",
            TestKind::AcceptedValues => "accepted_values",
            TestKind::Relationships => "relationships",
            TestKind::Generic => "generic",
            TestKind::Singular => "singular",
        }
    }

    /// Classify a raw kind string. Unknown kinds become `generic` when the
    /// record declares itself generic, otherwise `singular`.
    pub fn classify(raw: &str, generic: bool) -> TestKind {
        match raw.trim().to_ascii_lowercase().as_str() {
            "not_null" => TestKind::NotNull,
            "unique" => TestKind::Unique,
            "accepted_values" => TestKind::AcceptedValues,
            "relationships" => TestKind::Relationships,
            "generic" => TestKind::Generic,
            "singular" => TestKind::Singular,
            _ if generic => TestKind::Generic,
            _ => TestKind::Singular,
        }
    }
}

/// Kind of a node participating in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Model,
    Source,
    Macro,
    Exposure,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Model => "model",
            NodeKind::Source => "source",
            NodeKind::Macro => "macro",
            NodeKind::Exposure => "exposure",
        }
    }
}

/// A column of a model or source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    /// Declared type from the project definition.
    pub data_type: String,
    pub description: String,
    pub meta: serde_json::Value,
    pub tags: Vec<String>,
    /// *Computed*: carries both `unique` and `not_null` tests.
    pub is_primary_key: bool,
    /// *Computed*: carries a `relationships` test.
    pub is_foreign_key: bool,
}

/// Warehouse statistics overlay for a model.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ModelStats {
    pub row_count: Option<i64>,
    pub bytes: Option<i64>,
    pub last_modified: Option<String>,
    /// Catalog column types keyed by lowercase column name.
    pub column_types: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Model {
    pub unique_id: String,
    pub name: String,
    pub fqn: Vec<String>,
    pub package_name: String,
    pub database: String,
    pub db_schema: String,
    pub alias: String,
    pub file_path: String,
    pub raw_code: String,
    pub compiled_code: String,
    pub language: String,
    pub description: String,
    pub layer: Layer,
    pub materialization: String,
    pub tags: Vec<String>,
    pub meta: serde_json::Value,
    pub config: serde_json::Value,
    pub depends_on_nodes: Vec<String>,
    pub refs: Vec<String>,
    pub sources: Vec<String>,
    pub columns: Vec<Column>,
    pub stats: Option<ModelStats>,
    /// *Computed*: in-degree in the edge set.
    pub upstream_count: i64,
    /// *Computed*: out-degree in the edge set.
    pub downstream_count: i64,
    /// *Computed*: rescaled structural importance in `[0, 1]`.
    pub centrality: f64,
    pub content_hash: String,
}

impl Model {
    /// Compiled text when present, raw text otherwise.
    pub fn sql_text(&self) -> &str {
        if self.compiled_code.is_empty() {
            &self.raw_code
        } else {
            &self.compiled_code
        }
    }

    /// Effective column type: catalog overlay first, declared type otherwise.
    pub fn column_type<'a>(&'a self, column: &'a Column) -> &'a str {
        self.stats
            .as_ref()
            .and_then(|s| s.column_types.get(&column.name.to_lowercase()))
            .map(|t| t.as_str())
            .unwrap_or(column.data_type.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub unique_id: String,
    pub name: String,
    pub source_name: String,
    pub schema_name: String,
    pub database: String,
    pub description: String,
    pub loader: String,
    pub freshness_warn: Option<serde_json::Value>,
    pub freshness_error: Option<serde_json::Value>,
    pub tags: Vec<String>,
    pub meta: serde_json::Value,
    pub columns: Vec<Column>,
    pub content_hash: String,
}

impl Source {
    /// `source_name.name`, the way the source is referenced in SQL.
    pub fn display_name(&self) -> String {
        if self.source_name.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.source_name, self.name)
        }
    }
}

/// Outcome of the most recent execution of a test (external input).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRun {
    pub status: String,
    pub execution_time: Option<f64>,
    pub failures: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestNode {
    pub unique_id: String,
    pub name: String,
    pub kind: TestKind,
    pub model_id: Option<String>,
    /// Empty for model-level tests.
    pub column_name: String,
    pub depends_on: Vec<String>,
    pub severity: String,
    pub last_run: Option<TestRun>,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Macro {
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub file_path: String,
    pub description: String,
    pub arguments: serde_json::Value,
    pub macro_sql: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exposure {
    pub unique_id: String,
    pub name: String,
    pub label: String,
    pub exposure_type: String,
    pub url: String,
    pub description: String,
    pub owner_name: String,
    pub owner_email: String,
    pub depends_on: Vec<String>,
    pub tags: Vec<String>,
    pub content_hash: String,
}

/// Directed dependency: `parent_id` is upstream of `child_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Edge {
    pub parent_id: String,
    pub child_id: String,
}

impl Edge {
    pub fn new(parent_id: impl Into<String>, child_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            child_id: child_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transformation {
    Direct,
    Renamed,
    Derived,
    Aggregated,
}

impl Transformation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transformation::Direct => "direct",
            Transformation::Renamed => "renamed",
            Transformation::Derived => "derived",
            Transformation::Aggregated => "aggregated",
        }
    }
}

/// Column-level lineage, keyed by the (target, source) column 4-tuple.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnLineage {
    pub model_id: String,
    pub column_name: String,
    pub source_model_id: String,
    pub source_column: String,
    pub transformation: Transformation,
    pub computed_at: String,
}

/// Borrowed view of any node that participates in the graph.
#[derive(Debug, Clone, Copy)]
pub enum GraphNode<'a> {
    Model(&'a Model),
    Source(&'a Source),
    Macro(&'a Macro),
    Exposure(&'a Exposure),
}

impl<'a> GraphNode<'a> {
    pub fn id(&self) -> &'a str {
        match self {
            GraphNode::Model(m) => &m.unique_id,
            GraphNode::Source(s) => &s.unique_id,
            GraphNode::Macro(m) => &m.unique_id,
            GraphNode::Exposure(e) => &e.unique_id,
        }
    }

    pub fn name(&self) -> String {
        match self {
            GraphNode::Model(m) => m.name.clone(),
            GraphNode::Source(s) => s.display_name(),
            GraphNode::Macro(m) => m.name.clone(),
            GraphNode::Exposure(e) => e.name.clone(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            GraphNode::Model(_) => NodeKind::Model,
            GraphNode::Source(_) => NodeKind::Source,
            GraphNode::Macro(_) => NodeKind::Macro,
            GraphNode::Exposure(_) => NodeKind::Exposure,
        }
    }

    /// Layer label: a model's layer, otherwise the node kind.
    pub fn layer_label(&self) -> &'static str {
        match self {
            GraphNode::Model(m) => m.layer.as_str(),
            other => other.kind().as_str(),
        }
    }

    pub fn columns(&self) -> &'a [Column] {
        match self {
            GraphNode::Model(m) => &m.columns,
            GraphNode::Source(s) => &s.columns,
            GraphNode::Macro(_) | GraphNode::Exposure(_) => &[],
        }
    }
}

#[cfg(test)]
pub(crate) fn test_model(unique_id: &str, name: &str) -> Model {
    Model {
        unique_id: unique_id.to_string(),
        name: name.to_string(),
        fqn: vec![],
        package_name: "pkg".to_string(),
        database: String::new(),
        db_schema: String::new(),
        alias: name.to_string(),
        file_path: format!("models/{}.sql", name),
        raw_code: String::new(),
        compiled_code: String::new(),
        language: "sql".to_string(),
        description: String::new(),
        layer: Layer::Other,
        materialization: "view".to_string(),
        tags: vec![],
        meta: serde_json::json!({}),
        config: serde_json::json!({}),
        depends_on_nodes: vec![],
        refs: vec![],
        sources: vec![],
        columns: vec![],
        stats: None,
        upstream_count: 0,
        downstream_count: 0,
        centrality: 0.0,
        content_hash: String::new(),
    }
}
