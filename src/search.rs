//! Hybrid model ranking.
//!
//! ```text
//! score = w * (lexical / max_lexical) + (1 - w) * centrality
//! ```
//!
//! `w` is `[retrieval].lexical_weight`. The lexical part is normalized by
//! the best lexical score among the candidates, so both halves live in
//! `[0, 1]`. Ties are broken by higher centrality, then name, then id.
//! An empty query ranks every model (optionally one layer) by centrality.

use anyhow::Result;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::{Config, RetrievalConfig};
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::lexical::{query_terms, Bm25};
use crate::models::{Layer, Model};
use crate::snapshot::GraphSnapshot;

const DESCRIPTION_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub unique_id: String,
    pub name: String,
    pub layer: Layer,
    pub materialization: String,
    pub description: String,
    pub file_path: String,
    pub score: f64,
    pub lexical_score: f64,
    pub centrality: f64,
}

/// A scored graph node used by the capsule budgeter.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedNode {
    pub unique_id: String,
    pub name: String,
    pub score: f64,
    pub centrality: f64,
}

fn bm25(config: &RetrievalConfig) -> Bm25 {
    Bm25 {
        k1: config.bm25_k1,
        b: config.bm25_b,
    }
}

/// Final ordering: score desc, centrality desc, name asc, id asc.
fn rank_order(a: (f64, f64, &str, &str), b: (f64, f64, &str, &str)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then_with(|| b.1.total_cmp(&a.1))
        .then_with(|| a.2.cmp(b.2))
        .then_with(|| a.3.cmp(b.3))
}

fn preview(text: &str) -> String {
    if text.chars().count() <= DESCRIPTION_PREVIEW_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(DESCRIPTION_PREVIEW_CHARS).collect();
        format!("{}...", cut)
    }
}

fn hit(model: &Model, score: f64, lexical: f64) -> SearchHit {
    SearchHit {
        unique_id: model.unique_id.clone(),
        name: model.name.clone(),
        layer: model.layer,
        materialization: model.materialization.clone(),
        description: preview(&model.description),
        file_path: model.file_path.clone(),
        score,
        lexical_score: lexical,
        centrality: model.centrality,
    }
}

/// Validate and clamp a caller-supplied limit into `1..=max_limit`.
pub fn effective_limit(config: &RetrievalConfig, limit: Option<i64>) -> usize {
    limit
        .unwrap_or(config.default_limit)
        .clamp(1, config.max_limit.max(1)) as usize
}

/// `search_models(query, limit?, layer?)`.
pub fn search_models(
    snapshot: &GraphSnapshot,
    config: &RetrievalConfig,
    query: &str,
    limit: Option<i64>,
    layer: Option<&str>,
) -> EngineResult<Vec<SearchHit>> {
    let layer = match layer.map(str::trim).filter(|l| !l.is_empty()) {
        Some(l) => Some(Layer::parse(l).ok_or_else(|| {
            EngineError::validation(
                "layer",
                format!("'{}' is not one of staging, intermediate, marts, other", l),
            )
        })?),
        None => None,
    };
    let limit = effective_limit(config, limit);
    let w = config.lexical_weight;
    let in_layer = |m: &Model| layer.map_or(true, |l| m.layer == l);

    let terms = query_terms(query);
    let mut hits: Vec<SearchHit> = if terms.is_empty() {
        snapshot
            .models
            .values()
            .filter(|m| in_layer(*m))
            .map(|m| hit(m, (1.0 - w) * m.centrality, 0.0))
            .collect()
    } else {
        let raw = snapshot.index().search(&terms, bm25(config));
        let max = raw.iter().map(|(_, s)| *s).fold(0.0, f64::max);
        raw.into_iter()
            .filter_map(|(id, lexical)| snapshot.models.get(&id).map(|m| (m, lexical)))
            .filter(|(m, _)| in_layer(*m))
            .map(|(m, lexical)| {
                let norm = if max > 0.0 { lexical / max } else { 0.0 };
                hit(m, w * norm + (1.0 - w) * m.centrality, lexical)
            })
            .collect()
    };

    hits.sort_by(|a, b| {
        rank_order(
            (a.score, a.centrality, a.name.as_str(), a.unique_id.as_str()),
            (b.score, b.centrality, b.name.as_str(), b.unique_id.as_str()),
        )
    });
    hits.truncate(limit);
    Ok(hits)
}

/// Score arbitrary graph nodes against `query` with the same formula as
/// [`search_models`]. Non-model nodes have no lexical document and rank on
/// centrality alone.
pub fn score_nodes<'a>(
    snapshot: &GraphSnapshot,
    config: &RetrievalConfig,
    query: &str,
    ids: impl IntoIterator<Item = &'a String>,
) -> Vec<RankedNode> {
    let terms = query_terms(query);
    let params = bm25(config);
    let w = config.lexical_weight;

    let lexical: HashMap<&String, f64> = ids
        .into_iter()
        .map(|id| {
            let s = if terms.is_empty() {
                0.0
            } else {
                snapshot.index().score(id, &terms, params)
            };
            (id, s)
        })
        .collect();
    let max = lexical.values().copied().fold(0.0, f64::max);

    let mut ranked: Vec<RankedNode> = lexical
        .into_iter()
        .filter_map(|(id, lex)| {
            let node = snapshot.node(id)?;
            let centrality = snapshot.centrality(id);
            let norm = if max > 0.0 { lex / max } else { 0.0 };
            Some(RankedNode {
                unique_id: id.clone(),
                name: node.name(),
                score: w * norm + (1.0 - w) * centrality,
                centrality,
            })
        })
        .collect();
    ranked.sort_by(|a, b| {
        rank_order(
            (a.score, a.centrality, a.name.as_str(), a.unique_id.as_str()),
            (b.score, b.centrality, b.name.as_str(), b.unique_id.as_str()),
        )
    });
    ranked
}

/// CLI entry point for `capsule search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    limit: Option<i64>,
    layer: Option<String>,
) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let hits = search_models(
        &engine.snapshot(),
        &config.retrieval,
        query,
        limit,
        layer.as_deref(),
    )?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, h) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} ({}, {})",
            i + 1,
            h.score,
            h.name,
            h.layer.as_str(),
            h.materialization
        );
        println!("    id: {}", h.unique_id);
        if !h.file_path.is_empty() {
            println!("    path: {}", h.file_path);
        }
        if !h.description.is_empty() {
            println!("    {}", h.description);
        }
    }

    engine.close().await;
    Ok(())
}
