//! Engine handle: configuration, store pool and the published snapshot.
//!
//! Readers call [`Engine::snapshot`] once per request and work against that
//! `Arc` until they finish, so they never observe a partially rebuilt graph.
//! Reindexing is serialized by an async mutex. A pass is staged and
//! published off the async runtime, persisted in one transaction, and only
//! then swapped in.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db;
use crate::error::{EngineError, EngineResult};
use crate::ingest::{stage, IndexMode, IndexReport};
use crate::migrate;
use crate::records::RecordBundle;
use crate::snapshot::{GraphSnapshot, SnapshotCell};
use crate::store::{self, GENERATION_KEY};

pub struct Engine {
    config: Arc<Config>,
    pool: SqlitePool,
    cell: SnapshotCell,
    writer: Mutex<()>,
}

impl Engine {
    /// Connect, make sure the schema exists, and publish whatever the store
    /// already holds.
    pub async fn open(config: Config) -> Result<Engine> {
        let pool = db::connect(&config).await?;
        migrate::apply(&pool).await?;
        let (staged, generation) = store::load(&pool)
            .await
            .with_context(|| format!("Failed to load store at {}", config.db.path.display()))?;

        let centrality = config.centrality.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            GraphSnapshot::publish(staged, None, None, &centrality, generation)
        })
        .await?;

        tracing::debug!(
            generation,
            models = snapshot.models.len(),
            "loaded snapshot from store"
        );

        Ok(Engine {
            config: Arc::new(config),
            pool,
            cell: SnapshotCell::new(snapshot),
            writer: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The current published snapshot.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.cell.load()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run one ingestion pass. Full mode rebuilds every entity and all
    /// centrality; incremental mode reuses unchanged entities and recomputes
    /// centrality only where the graph moved.
    pub async fn reindex(&self, bundle: RecordBundle, mode: IndexMode) -> EngineResult<IndexReport> {
        let _guard = self.writer.lock().await;
        let started = Instant::now();

        let previous = self.snapshot();
        let generation = previous.generation + 1;
        let centrality = self.config.centrality.clone();
        let prev = Arc::clone(&previous);

        let (mut report, next) = tokio::task::spawn_blocking(move || {
            let mut pass = stage(&bundle, &prev, mode);
            if pass.rejected {
                return (pass.report, None);
            }
            let mut graph = std::mem::take(&mut pass.graph);
            graph
                .metadata
                .insert("last_indexed_at".to_string(), Utc::now().to_rfc3339());
            graph
                .metadata
                .insert("last_index_mode".to_string(), mode.as_str().to_string());
            graph
                .metadata
                .insert(GENERATION_KEY.to_string(), generation.to_string());

            let next = match mode {
                IndexMode::Full => GraphSnapshot::publish(graph, None, None, &centrality, generation),
                IndexMode::Incremental => GraphSnapshot::publish(
                    graph,
                    Some(&prev),
                    Some(&pass.affected),
                    &centrality,
                    generation,
                ),
            };
            (pass.report, Some(next))
        })
        .await
        .map_err(|e| EngineError::Internal(format!("ingestion task failed: {}", e)))?;

        for error in &report.errors {
            tracing::warn!(kind = ?error.kind, record = %error.record, "{}", error.message);
        }

        let Some(next) = next else {
            report.generation = previous.generation;
            report.duration_ms = started.elapsed().as_millis() as u64;
            tracing::error!(
                mode = mode.as_str(),
                errors = report.errors.len(),
                "ingestion pass rejected, snapshot unchanged"
            );
            return Ok(report);
        };

        let persist_base = match mode {
            IndexMode::Full => None,
            IndexMode::Incremental => Some(previous.as_ref()),
        };
        store::persist(&self.pool, persist_base, &next).await?;
        self.cell.swap(Arc::new(next));

        report.committed = true;
        report.generation = generation;
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            mode = mode.as_str(),
            generation,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            unchanged = report.unchanged,
            edges_added = report.edges_added,
            edges_removed = report.edges_removed,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "published snapshot"
        );

        Ok(report)
    }

    /// Read a records file and reindex from it.
    pub async fn reindex_path(&self, path: &Path, full: bool) -> EngineResult<IndexReport> {
        let bundle = RecordBundle::from_path(path)?;
        let mode = if full {
            IndexMode::Full
        } else {
            IndexMode::Incremental
        };
        self.reindex(bundle, mode).await
    }
}

/// CLI entry point for `capsule index`.
pub async fn run_index(config: &Config, records: Option<&Path>, full: bool) -> Result<()> {
    let path = records.unwrap_or(config.ingest.records_path.as_path());
    let engine = Engine::open(config.clone()).await?;
    let report = engine
        .reindex_path(path, full)
        .await
        .with_context(|| format!("Failed to index {}", path.display()))?;

    println!("Index ({}): {}", report.mode.as_str(), path.display());
    if report.committed {
        println!("  generation: {}", report.generation);
    } else {
        println!("  REJECTED: nothing was published");
    }
    println!("  added: {}", report.added);
    println!("  updated: {}", report.updated);
    println!("  removed: {}", report.removed);
    println!("  unchanged: {}", report.unchanged);
    println!(
        "  edges: +{} -{}",
        report.edges_added, report.edges_removed
    );
    println!("  duration: {}ms", report.duration_ms);
    if !report.errors.is_empty() {
        println!("  errors: {}", report.errors.len());
        for e in &report.errors {
            println!("    [{:?}] {}: {}", e.kind, e.record, e.message);
        }
    }

    engine.close().await;
    if !report.committed {
        anyhow::bail!("ingestion rejected: dependency cycle in records");
    }
    Ok(())
}
