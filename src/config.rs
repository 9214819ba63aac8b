//! TOML configuration parsing and validation.
//!
//! Every tunable constant of the engine lives here: the lexical/structural
//! split of the hybrid ranker, BM25 parameters, centrality damping and
//! iteration limits, capsule budgets and the intent depth table.
//!
//! ```toml
//! [db]
//! path = "./data/capsule.sqlite"
//!
//! [ingest]
//! records_path = "./target/capsule_records.json"
//!
//! [retrieval]
//! lexical_weight = 0.7
//!
//! [capsule]
//! default_token_budget = 10000
//!
//! [capsule.intent_depths.debug]
//! upstream = 3
//! downstream = 1
//!
//! [server]
//! bind = "127.0.0.1:8765"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::intent::{DepthPolicy, Intent};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub centrality: CentralityConfig,
    #[serde(default)]
    pub capsule: CapsuleConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_records_path")]
    pub records_path: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            records_path: default_records_path(),
        }
    }
}

fn default_records_path() -> PathBuf {
    PathBuf::from("./target/capsule_records.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Weight of the lexical score: `score = w * lexical + (1 - w) * centrality`.
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
    #[serde(default = "default_lineage_depth")]
    pub default_lineage_depth: i64,
    #[serde(default = "default_max_lineage_depth")]
    pub max_lineage_depth: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            lexical_weight: default_lexical_weight(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            default_lineage_depth: default_lineage_depth(),
            max_lineage_depth: default_max_lineage_depth(),
        }
    }
}

fn default_lexical_weight() -> f64 {
    0.7
}
fn default_bm25_k1() -> f64 {
    1.2
}
fn default_bm25_b() -> f64 {
    0.75
}
fn default_limit() -> i64 {
    10
}
fn default_max_limit() -> i64 {
    50
}
fn default_lineage_depth() -> i64 {
    3
}
fn default_max_lineage_depth() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct CentralityConfig {
    #[serde(default = "default_damping")]
    pub damping: f64,
    #[serde(default = "default_baseline")]
    pub baseline: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for CentralityConfig {
    fn default() -> Self {
        Self {
            damping: default_damping(),
            baseline: default_baseline(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
        }
    }
}

fn default_damping() -> f64 {
    0.85
}
fn default_baseline() -> f64 {
    1.0
}
fn default_max_iterations() -> usize {
    100
}
fn default_tolerance() -> f64 {
    1e-9
}

#[derive(Debug, Deserialize, Clone)]
pub struct CapsuleConfig {
    #[serde(default = "default_token_budget")]
    pub default_token_budget: i64,
    #[serde(default = "default_max_pivots")]
    pub max_pivots: usize,
    #[serde(default = "default_pivot_score_ratio")]
    pub pivot_score_ratio: f64,
    #[serde(default = "default_similar_models")]
    pub similar_models: usize,
    /// Per-intent overrides of the fixed depth table.
    #[serde(default)]
    pub intent_depths: HashMap<String, DepthPolicy>,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            default_token_budget: default_token_budget(),
            max_pivots: default_max_pivots(),
            pivot_score_ratio: default_pivot_score_ratio(),
            similar_models: default_similar_models(),
            intent_depths: HashMap::new(),
        }
    }
}

impl CapsuleConfig {
    /// Depth policy for an intent: config override first, then the fixed table.
    pub fn depth_for(&self, intent: Intent) -> DepthPolicy {
        self.intent_depths
            .get(intent.as_str())
            .copied()
            .unwrap_or_else(|| intent.default_depth())
    }
}

fn default_token_budget() -> i64 {
    10_000
}
fn default_max_pivots() -> usize {
    3
}
fn default_pivot_score_ratio() -> f64 {
    0.5
}
fn default_similar_models() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8765".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    /// A config with every section at its default, pointing at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            ingest: IngestConfig::default(),
            retrieval: RetrievalConfig::default(),
            centrality: CentralityConfig::default(),
            capsule: CapsuleConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if !(0.0..=1.0).contains(&r.lexical_weight) {
            anyhow::bail!("retrieval.lexical_weight must be in [0.0, 1.0]");
        }
        if r.bm25_k1 < 0.0 {
            anyhow::bail!("retrieval.bm25_k1 must be >= 0");
        }
        if !(0.0..=1.0).contains(&r.bm25_b) {
            anyhow::bail!("retrieval.bm25_b must be in [0.0, 1.0]");
        }
        if r.default_limit < 1 || r.max_limit < r.default_limit {
            anyhow::bail!("retrieval.default_limit must be >= 1 and <= retrieval.max_limit");
        }
        if r.max_lineage_depth < 0 || r.default_lineage_depth < 0 {
            anyhow::bail!("retrieval lineage depths must be >= 0");
        }

        let c = &self.centrality;
        if !(c.damping > 0.0 && c.damping < 1.0) {
            anyhow::bail!("centrality.damping must be in (0.0, 1.0)");
        }
        if c.max_iterations == 0 {
            anyhow::bail!("centrality.max_iterations must be >= 1");
        }
        if c.tolerance <= 0.0 {
            anyhow::bail!("centrality.tolerance must be > 0");
        }

        let cap = &self.capsule;
        if cap.default_token_budget < 1 {
            anyhow::bail!("capsule.default_token_budget must be >= 1");
        }
        if cap.max_pivots == 0 {
            anyhow::bail!("capsule.max_pivots must be >= 1");
        }
        if !(0.0..=1.0).contains(&cap.pivot_score_ratio) {
            anyhow::bail!("capsule.pivot_score_ratio must be in [0.0, 1.0]");
        }
        for (name, depth) in &cap.intent_depths {
            if Intent::parse(name).is_none() {
                anyhow::bail!(
                    "Unknown intent in capsule.intent_depths: '{}'. Must be one of {}.",
                    name,
                    Intent::ALL
                        .iter()
                        .map(|i| i.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            if depth.upstream > 64 || depth.downstream > 64 {
                anyhow::bail!("capsule.intent_depths.{} depths must be <= 64", name);
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg: Config = toml::from_str("[db]\npath = \"x.sqlite\"\n").unwrap();
        cfg.validate().unwrap();
        assert!((cfg.retrieval.lexical_weight - 0.7).abs() < 1e-12);
        assert_eq!(cfg.capsule.max_pivots, 3);
        assert_eq!(cfg.server.bind, "127.0.0.1:8765");
    }

    #[test]
    fn test_intent_depth_override() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "x.sqlite"

            [capsule.intent_depths.debug]
            upstream = 4
            downstream = 0
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        let depth = cfg.capsule.depth_for(Intent::Debug);
        assert_eq!((depth.upstream, depth.downstream), (4, 0));
        assert_eq!(
            cfg.capsule.depth_for(Intent::Refactor),
            Intent::Refactor.default_depth()
        );
    }

    #[test]
    fn test_rejects_unknown_intent() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "x.sqlite"

            [capsule.intent_depths.explore]
            upstream = 1
            downstream = 1
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_weights() {
        let mut cfg = Config::with_db_path("x.sqlite");
        cfg.retrieval.lexical_weight = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::with_db_path("x.sqlite");
        cfg.centrality.damping = 1.0;
        assert!(cfg.validate().is_err());
    }
}
