//! Context capsule assembly.
//!
//! `get_context_capsule(task, focus_model?, token_budget?)` runs the whole
//! retrieval pipeline against one snapshot:
//!
//! ```text
//! classify(task) ─► depth policy
//!        │
//! focus_model or search(task) ─► pivots ─► traverse ─► rank ─► budget
//!                                                                 │
//!              relevant sources / macros / project patterns / similar ◄──┘
//! ```
//!
//! The token estimate counts every item placed in the capsule and never
//! exceeds the budget unless the pivots alone do, in which case a
//! `budget_exceeded` warning is attached.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::get::macros_called;
use crate::intent::{DepthPolicy, Intent};
use crate::patterns::{project_patterns, LayerConvention};
use crate::search::{score_nodes, search_models};
use crate::skeleton::{self, estimate_tokens, AdjacentNode, DistantNode, FullModel, Selection};
use crate::snapshot::GraphSnapshot;
use crate::traversal::{traverse, Direction};

#[derive(Debug, Clone, Serialize)]
pub struct RelevantSource {
    pub unique_id: String,
    pub name: String,
    pub loader: String,
    pub freshness_warn: Option<serde_json::Value>,
    pub freshness_error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelevantMacro {
    pub unique_id: String,
    pub name: String,
    pub package_name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapsuleWarning {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapsuleSummary {
    pub nodes_considered: usize,
    pub nodes_included: usize,
    pub nodes_dropped: usize,
    pub pivot_count: usize,
    pub token_estimate: usize,
    pub token_budget: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Capsule {
    pub task: String,
    pub intent: Intent,
    pub depth: DepthPolicy,
    pub pivots: Vec<FullModel>,
    pub adjacent: Vec<AdjacentNode>,
    pub distant: Vec<DistantNode>,
    pub relevant_sources: Vec<RelevantSource>,
    pub relevant_macros: Vec<RelevantMacro>,
    pub project_patterns: Vec<LayerConvention>,
    pub similar_models: Vec<String>,
    pub summary: CapsuleSummary,
    pub warnings: Vec<CapsuleWarning>,
}

/// Spends what is left of the budget on optional extras, in order, stopping
/// a category at the first item that does not fit.
struct Spender {
    used: usize,
    budget: usize,
}

impl Spender {
    fn take<T: Serialize>(&mut self, items: Vec<T>) -> Vec<T> {
        let mut kept = Vec::new();
        for item in items {
            let cost = estimate_tokens(&item);
            if self.used + cost > self.budget {
                break;
            }
            self.used += cost;
            kept.push(item);
        }
        kept
    }
}

fn resolve_budget(config: &Config, token_budget: Option<i64>) -> EngineResult<usize> {
    let budget = token_budget.unwrap_or(config.capsule.default_token_budget);
    if budget < 1 {
        return Err(EngineError::validation(
            "token_budget",
            format!("must be >= 1, got {}", budget),
        ));
    }
    Ok(budget as usize)
}

fn choose_pivots(
    snapshot: &GraphSnapshot,
    config: &Config,
    task: &str,
    focus_model: Option<&str>,
) -> EngineResult<(Vec<String>, Vec<String>)> {
    let hits = search_models(
        snapshot,
        &config.retrieval,
        task,
        Some(config.retrieval.max_limit),
        None,
    )?;
    let hits = if task.trim().is_empty() { Vec::new() } else { hits };

    if let Some(focus) = focus_model.map(str::trim).filter(|f| !f.is_empty()) {
        let model = snapshot
            .find_model(focus)
            .ok_or_else(|| EngineError::not_found("model", focus))?;
        let others = hits
            .into_iter()
            .map(|h| h.unique_id)
            .filter(|id| id != &model.unique_id)
            .collect();
        return Ok((vec![model.unique_id.clone()], others));
    }

    let top = hits.first().map(|h| h.score).unwrap_or(0.0);
    let threshold = top * config.capsule.pivot_score_ratio;
    let mut pivots = Vec::new();
    let mut others = Vec::new();
    for (i, hit) in hits.into_iter().enumerate() {
        if i == 0 || (pivots.len() < config.capsule.max_pivots && hit.score >= threshold) {
            pivots.push(hit.unique_id);
        } else {
            others.push(hit.unique_id);
        }
    }
    Ok((pivots, others))
}

/// Build a capsule for `task` from a single consistent snapshot.
pub fn build_capsule(
    snapshot: &GraphSnapshot,
    config: &Config,
    task: &str,
    focus_model: Option<&str>,
    token_budget: Option<i64>,
) -> EngineResult<Capsule> {
    let has_focus = focus_model.is_some_and(|f| !f.trim().is_empty());
    if task.trim().is_empty() && !has_focus {
        return Err(EngineError::validation(
            "task",
            "must not be empty without a focus_model",
        ));
    }
    let budget = resolve_budget(config, token_budget)?;

    let intent = Intent::classify(task);
    let depth = config.capsule.depth_for(intent);
    let (pivots, other_hits) = choose_pivots(snapshot, config, task, focus_model)?;

    let mut warnings = Vec::new();
    if pivots.is_empty() {
        warnings.push(CapsuleWarning {
            kind: "no_pivot",
            message: "no model matched the task; pass focus_model to anchor the capsule"
                .to_string(),
        });
    }

    let subgraph = traverse(
        snapshot,
        &pivots,
        Direction::Both,
        depth.upstream,
        depth.downstream,
    );
    let candidates: Vec<&String> = subgraph
        .nodes
        .iter()
        .filter(|(_, visit)| visit.distance > 0)
        .map(|(id, _)| id)
        .collect();
    let ranked = score_nodes(snapshot, &config.retrieval, task, candidates);
    let selection: Selection = skeleton::select(snapshot, &pivots, &subgraph, &ranked, budget);

    if selection.budget_exceeded(budget) {
        warnings.push(CapsuleWarning {
            kind: "budget_exceeded",
            message: format!(
                "pivots alone need ~{} tokens, over the budget of {}",
                selection.pivot_tokens, budget
            ),
        });
    }

    // Models placed in the capsule, for source and macro relevance.
    let included: Vec<&str> = selection
        .pivots
        .iter()
        .map(|m| m.unique_id.as_str())
        .chain(selection.adjacent.iter().map(|n| n.unique_id.as_str()))
        .chain(selection.distant.iter().map(|n| n.unique_id.as_str()))
        .filter(|id| snapshot.models.contains_key(*id))
        .collect();

    let mut source_ids = BTreeSet::new();
    let mut macro_names = BTreeSet::new();
    for id in &included {
        for parent in snapshot.parents(id) {
            if snapshot.sources.contains_key(parent) {
                source_ids.insert(parent.clone());
            }
        }
        if let Some(model) = snapshot.models.get(*id) {
            macro_names.extend(macros_called(snapshot, model.sql_text()));
        }
    }

    let sources: Vec<RelevantSource> = source_ids
        .iter()
        .filter_map(|id| snapshot.sources.get(id))
        .map(|s| RelevantSource {
            unique_id: s.unique_id.clone(),
            name: s.display_name(),
            loader: s.loader.clone(),
            freshness_warn: s.freshness_warn.clone(),
            freshness_error: s.freshness_error.clone(),
        })
        .collect();
    let macros: Vec<RelevantMacro> = snapshot
        .macros
        .values()
        .filter(|m| macro_names.contains(&m.name))
        .map(|m| RelevantMacro {
            unique_id: m.unique_id.clone(),
            name: m.name.clone(),
            package_name: m.package_name.clone(),
            description: m.description.clone(),
        })
        .collect();
    let similar: Vec<String> = other_hits
        .iter()
        .filter(|id| !subgraph.nodes.contains_key(*id))
        .filter_map(|id| snapshot.models.get(id))
        .take(config.capsule.similar_models)
        .map(|m| m.name.clone())
        .collect();

    let mut spender = Spender {
        used: selection.used_tokens,
        budget,
    };
    let relevant_sources = spender.take(sources);
    let relevant_macros = spender.take(macros);
    let project_patterns = spender.take(project_patterns(snapshot));
    let similar_models = spender.take(similar);

    let summary = CapsuleSummary {
        nodes_considered: selection.considered,
        nodes_included: selection.included(),
        nodes_dropped: selection.dropped,
        pivot_count: selection.pivots.len(),
        token_estimate: spender.used,
        token_budget: budget,
    };

    tracing::debug!(
        intent = intent.as_str(),
        pivots = summary.pivot_count,
        included = summary.nodes_included,
        dropped = summary.nodes_dropped,
        tokens = summary.token_estimate,
        budget,
        "assembled capsule"
    );

    Ok(Capsule {
        task: task.to_string(),
        intent,
        depth,
        pivots: selection.pivots,
        adjacent: selection.adjacent,
        distant: selection.distant,
        relevant_sources,
        relevant_macros,
        project_patterns,
        similar_models,
        summary,
        warnings,
    })
}

/// `get_context_capsule` against the engine's current snapshot.
pub fn get_context_capsule(
    engine: &Engine,
    task: &str,
    focus_model: Option<&str>,
    token_budget: Option<i64>,
) -> EngineResult<Capsule> {
    build_capsule(&engine.snapshot(), engine.config(), task, focus_model, token_budget)
}

/// CLI entry point for `capsule capsule`. Prints the capsule as JSON.
pub async fn run_capsule(
    config: &Config,
    task: &str,
    focus_model: Option<&str>,
    token_budget: Option<i64>,
) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let capsule = get_context_capsule(&engine, task, focus_model, token_budget)?;
    engine.close().await;

    println!("{}", serde_json::to_string_pretty(&capsule)?);
    Ok(())
}
