//! Index statistics.
//!
//! A quick summary of what's indexed: entity counts, the layer breakdown,
//! column test coverage and the most central models. Used by
//! `capsule stats` to confirm an ingestion pass landed as expected.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::engine::Engine;
use crate::models::Layer;
use crate::snapshot::GraphSnapshot;

const TOP_CENTRAL: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub generation: i64,
    pub models: usize,
    pub sources: usize,
    pub tests: usize,
    pub macros: usize,
    pub exposures: usize,
    pub edges: usize,
    pub layers: Vec<(Layer, usize)>,
    pub columns: usize,
    pub tested_columns: usize,
    pub most_central: Vec<(String, f64)>,
    pub last_indexed_at: Option<String>,
}

pub fn index_stats(snapshot: &GraphSnapshot) -> IndexStats {
    let layers = Layer::ALL
        .iter()
        .map(|l| (*l, snapshot.models.values().filter(|m| m.layer == *l).count()))
        .collect();

    let mut columns = 0;
    let mut tested_columns = 0;
    for model in snapshot.models.values() {
        let tests = snapshot.tests_for_model(&model.unique_id);
        columns += model.columns.len();
        tested_columns += model
            .columns
            .iter()
            .filter(|c| tests.iter().any(|t| t.column_name.eq_ignore_ascii_case(&c.name)))
            .count();
    }

    let mut central: Vec<(String, f64)> = snapshot
        .models
        .values()
        .map(|m| (m.name.clone(), m.centrality))
        .collect();
    central.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    central.truncate(TOP_CENTRAL);

    IndexStats {
        generation: snapshot.generation,
        models: snapshot.models.len(),
        sources: snapshot.sources.len(),
        tests: snapshot.tests.len(),
        macros: snapshot.macros.len(),
        exposures: snapshot.exposures.len(),
        edges: snapshot.edges.len(),
        layers,
        columns,
        tested_columns,
        most_central: central,
        last_indexed_at: snapshot.metadata.get("last_indexed_at").cloned(),
    }
}

/// Run the stats command: load the snapshot and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let engine = Engine::open(config.clone()).await?;
    let stats = index_stats(&engine.snapshot());
    engine.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("dbt capsule — Index Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Generation:  {}", stats.generation);
    println!(
        "  Indexed:     {}",
        stats
            .last_indexed_at
            .as_deref()
            .map(format_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  Models:      {}", stats.models);
    println!("  Sources:     {}", stats.sources);
    println!("  Tests:       {}", stats.tests);
    println!("  Macros:      {}", stats.macros);
    println!("  Exposures:   {}", stats.exposures);
    println!("  Edges:       {}", stats.edges);
    println!(
        "  Tested:      {} / {} columns ({}%)",
        stats.tested_columns,
        stats.columns,
        if stats.columns > 0 {
            (stats.tested_columns * 100) / stats.columns
        } else {
            0
        }
    );

    if stats.models > 0 {
        println!();
        println!("  By layer:");
        for (layer, count) in &stats.layers {
            println!("    {:<14} {:>6}", layer.as_str(), count);
        }
        println!();
        println!("  Most central:");
        for (name, score) in &stats.most_central {
            println!("    {:<32} {:.3}", name, score);
        }
    }
    println!();

    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format an RFC 3339 timestamp relative to now (e.g. "3 hours ago").
fn format_relative(ts: &str) -> String {
    let Ok(then) = chrono::DateTime::parse_from_rfc3339(ts) else {
        return ts.to_string();
    };
    let delta = chrono::Utc::now().timestamp() - then.timestamp();

    if delta < 0 {
        then.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        then.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CentralityConfig;
    use crate::models::{test_model, Edge};
    use crate::snapshot::StagedGraph;

    #[test]
    fn test_stats_count_layers_and_rank_centrality() {
        let mut staged = StagedGraph::default();
        for (name, layer) in [
            ("stg_a", Layer::Staging),
            ("hub", Layer::Intermediate),
            ("fct_b", Layer::Marts),
            ("fct_c", Layer::Marts),
        ] {
            let mut m = test_model(&format!("model.p.{}", name), name);
            m.layer = layer;
            staged.models.insert(m.unique_id.clone(), m);
        }
        for (p, c) in [("stg_a", "hub"), ("hub", "fct_b"), ("hub", "fct_c")] {
            staged
                .edges
                .insert(Edge::new(format!("model.p.{}", p), format!("model.p.{}", c)));
        }
        let snap = GraphSnapshot::publish(staged, None, None, &CentralityConfig::default(), 3);

        let stats = index_stats(&snap);
        assert_eq!(stats.models, 4);
        assert_eq!(stats.edges, 3);
        assert_eq!(stats.generation, 3);
        assert!(stats.layers.contains(&(Layer::Marts, 2)));
        assert_eq!(stats.most_central[0].0, "hub");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
    }
}
