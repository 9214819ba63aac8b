//! Model detail retrieval.
//!
//! Assembles everything known about a single model: its text, columns with
//! their tests, direct neighbors, macros it calls, test coverage, warehouse
//! statistics and column lineage. Used by both the `capsule get` CLI command
//! and the `get_model_details` tool.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::column_lineage;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::models::{ColumnLineage, GraphNode, Model, ModelStats, NodeKind};
use crate::skeleton::{ColumnDetail, TestSummary};
use crate::snapshot::GraphSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct NeighborRef {
    pub unique_id: String,
    pub name: String,
    pub kind: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestCoverage {
    pub tested_columns: usize,
    pub total_columns: usize,
    pub percentage: f64,
    pub untested_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelDetails {
    pub unique_id: String,
    pub name: String,
    pub fqn: Vec<String>,
    pub package_name: String,
    pub database: String,
    pub schema: String,
    pub alias: String,
    pub file_path: String,
    pub layer: &'static str,
    pub materialization: String,
    pub language: String,
    pub description: String,
    pub tags: Vec<String>,
    pub meta: serde_json::Value,
    pub raw_sql: String,
    pub compiled_sql: String,
    pub columns: Vec<ColumnDetail>,
    pub tests: Vec<TestSummary>,
    pub upstream: Vec<NeighborRef>,
    pub downstream: Vec<NeighborRef>,
    pub sources: Vec<NeighborRef>,
    pub macros_used: Vec<String>,
    pub coverage: TestCoverage,
    pub stats: Option<ModelStats>,
    pub centrality: f64,
    pub column_lineage: Vec<ColumnLineage>,
}

fn neighbor(node: GraphNode<'_>) -> NeighborRef {
    NeighborRef {
        unique_id: node.id().to_string(),
        name: node.name(),
        kind: node.kind().as_str(),
    }
}

/// Names of macros invoked (as identifier tokens) in `sql`.
pub fn macros_called(snapshot: &GraphSnapshot, sql: &str) -> Vec<String> {
    let tokens: BTreeSet<String> = column_lineage::identifiers(sql).into_iter().collect();
    let names: BTreeSet<String> = snapshot
        .macros
        .values()
        .filter(|m| tokens.contains(&m.name.to_ascii_lowercase()))
        .map(|m| m.name.clone())
        .collect();
    names.into_iter().collect()
}

fn coverage(model: &Model, columns: &[ColumnDetail]) -> TestCoverage {
    let untested: Vec<String> = columns
        .iter()
        .filter(|c| c.tests.is_empty())
        .map(|c| c.name.clone())
        .collect();
    let total = model.columns.len();
    let tested = total - untested.len();
    TestCoverage {
        tested_columns: tested,
        total_columns: total,
        percentage: if total == 0 {
            0.0
        } else {
            (tested as f64 / total as f64 * 1000.0).round() / 10.0
        },
        untested_columns: untested,
    }
}

/// Build the detail view from a snapshot. Column lineage is inferred but
/// not persisted.
pub fn model_details(snapshot: &GraphSnapshot, model_name: &str) -> EngineResult<ModelDetails> {
    let model = snapshot
        .find_model(model_name)
        .ok_or_else(|| EngineError::not_found("model", model_name))?;

    let full = crate::skeleton::FullModel::project(snapshot, model);

    let upstream: Vec<NeighborRef> = snapshot
        .parents(&model.unique_id)
        .iter()
        .filter_map(|id| snapshot.node(id))
        .map(neighbor)
        .collect();
    let downstream = snapshot
        .children(&model.unique_id)
        .iter()
        .filter_map(|id| snapshot.node(id))
        .map(neighbor)
        .collect();
    let sources = upstream
        .iter()
        .filter(|n| n.kind == NodeKind::Source.as_str())
        .cloned()
        .collect();

    Ok(ModelDetails {
        unique_id: model.unique_id.clone(),
        name: model.name.clone(),
        fqn: model.fqn.clone(),
        package_name: model.package_name.clone(),
        database: model.database.clone(),
        schema: model.db_schema.clone(),
        alias: model.alias.clone(),
        file_path: model.file_path.clone(),
        layer: model.layer.as_str(),
        materialization: model.materialization.clone(),
        language: model.language.clone(),
        description: model.description.clone(),
        tags: model.tags.clone(),
        meta: model.meta.clone(),
        raw_sql: model.raw_code.clone(),
        compiled_sql: model.compiled_code.clone(),
        coverage: coverage(model, &full.columns),
        columns: full.columns,
        tests: full.tests,
        upstream,
        downstream,
        sources,
        macros_used: macros_called(snapshot, model.sql_text()),
        stats: model.stats.clone(),
        centrality: model.centrality,
        column_lineage: column_lineage::infer(snapshot, model),
    })
}

/// `get_model_details(model_name)`: detail view plus persisted column lineage.
pub async fn get_model_details(engine: &Engine, model_name: &str) -> EngineResult<ModelDetails> {
    let snapshot = engine.snapshot();
    let details = model_details(&snapshot, model_name)?;
    column_lineage::save(engine.pool(), &details.column_lineage).await?;
    Ok(details)
}

/// CLI entry point for `capsule get`.
pub async fn run_get(config: &Config, model_name: &str) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let d = get_model_details(&engine, model_name).await?;
    engine.close().await;

    println!("--- Model ---");
    println!("id:              {}", d.unique_id);
    println!("name:            {}", d.name);
    println!("layer:           {}", d.layer);
    println!("materialization: {}", d.materialization);
    if !d.file_path.is_empty() {
        println!("path:            {}", d.file_path);
    }
    println!("centrality:      {:.3}", d.centrality);
    if let Some(rows) = d.stats.as_ref().and_then(|s| s.row_count) {
        println!("rows:            {}", rows);
    }
    if !d.description.is_empty() {
        println!("\n{}", d.description);
    }

    println!("\n--- Columns ({}) ---", d.columns.len());
    for c in &d.columns {
        let mut flags = Vec::new();
        if c.is_primary_key {
            flags.push("pk");
        }
        if c.is_foreign_key {
            flags.push("fk");
        }
        println!(
            "  {} {}{} [{}]",
            c.name,
            c.data_type,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(","))
            },
            c.tests.join(", ")
        );
    }
    println!(
        "coverage: {}/{} ({:.1}%)",
        d.coverage.tested_columns, d.coverage.total_columns, d.coverage.percentage
    );

    let names = |refs: &[NeighborRef]| {
        refs.iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("\n--- Lineage ---");
    println!("upstream:   {}", names(&d.upstream));
    println!("downstream: {}", names(&d.downstream));
    if !d.macros_used.is_empty() {
        println!("macros:     {}", d.macros_used.join(", "));
    }

    if !d.compiled_sql.is_empty() || !d.raw_sql.is_empty() {
        println!("\n--- SQL ---");
        println!(
            "{}",
            if d.compiled_sql.is_empty() {
                &d.raw_sql
            } else {
                &d.compiled_sql
            }
        );
    }

    Ok(())
}
