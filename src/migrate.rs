//! Persisted schema.
//!
//! The relational layout is a contract other processes may rely on for
//! inspection. JSON-shaped columns (`tags`, `meta`, `config`, `depends_on`,
//! `refs`, `sources`, `arguments`, `payload`, ...) are opaque text to the
//! store and validated only when the engine reads them back.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS models (
        unique_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        fqn TEXT NOT NULL DEFAULT '[]',
        package_name TEXT NOT NULL DEFAULT '',
        database_name TEXT NOT NULL DEFAULT '',
        schema_name TEXT NOT NULL DEFAULT '',
        alias TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        raw_code TEXT NOT NULL DEFAULT '',
        compiled_code TEXT NOT NULL DEFAULT '',
        language TEXT NOT NULL DEFAULT 'sql',
        description TEXT NOT NULL DEFAULT '',
        layer TEXT NOT NULL DEFAULT 'other',
        materialization TEXT NOT NULL DEFAULT 'view',
        tags TEXT NOT NULL DEFAULT '[]',
        meta TEXT NOT NULL DEFAULT '{}',
        config TEXT NOT NULL DEFAULT '{}',
        depends_on_nodes TEXT NOT NULL DEFAULT '[]',
        refs TEXT NOT NULL DEFAULT '[]',
        sources TEXT NOT NULL DEFAULT '[]',
        row_count INTEGER,
        bytes INTEGER,
        last_modified TEXT,
        catalog_column_types TEXT,
        upstream_count INTEGER NOT NULL DEFAULT 0,
        downstream_count INTEGER NOT NULL DEFAULT 0,
        centrality REAL NOT NULL DEFAULT 0,
        content_hash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS columns (
        model_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        data_type TEXT NOT NULL DEFAULT '',
        declared_type TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        meta TEXT NOT NULL DEFAULT '{}',
        tags TEXT NOT NULL DEFAULT '[]',
        is_primary_key INTEGER NOT NULL DEFAULT 0,
        is_foreign_key INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (model_id, name),
        FOREIGN KEY (model_id) REFERENCES models(unique_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        unique_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        source_name TEXT NOT NULL DEFAULT '',
        schema_name TEXT NOT NULL DEFAULT '',
        database_name TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        loader TEXT NOT NULL DEFAULT '',
        freshness_warn TEXT,
        freshness_error TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        meta TEXT NOT NULL DEFAULT '{}',
        content_hash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS source_columns (
        source_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        data_type TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        meta TEXT NOT NULL DEFAULT '{}',
        tags TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (source_id, name),
        FOREIGN KEY (source_id) REFERENCES sources(unique_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tests (
        unique_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        test_kind TEXT NOT NULL,
        model_id TEXT,
        column_name TEXT NOT NULL DEFAULT '',
        depends_on TEXT NOT NULL DEFAULT '[]',
        severity TEXT NOT NULL DEFAULT 'error',
        last_status TEXT,
        last_execution_time REAL,
        last_failures INTEGER,
        content_hash TEXT NOT NULL,
        FOREIGN KEY (model_id) REFERENCES models(unique_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS macros (
        unique_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        package_name TEXT NOT NULL DEFAULT '',
        file_path TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        arguments TEXT NOT NULL DEFAULT '[]',
        macro_sql TEXT NOT NULL DEFAULT '',
        content_hash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS exposures (
        unique_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        label TEXT NOT NULL DEFAULT '',
        exposure_type TEXT NOT NULL DEFAULT '',
        url TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        owner_name TEXT NOT NULL DEFAULT '',
        owner_email TEXT NOT NULL DEFAULT '',
        depends_on TEXT NOT NULL DEFAULT '[]',
        tags TEXT NOT NULL DEFAULT '[]',
        content_hash TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS edges (
        parent_id TEXT NOT NULL,
        child_id TEXT NOT NULL,
        PRIMARY KEY (parent_id, child_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS column_lineage (
        model_id TEXT NOT NULL,
        column_name TEXT NOT NULL,
        source_model_id TEXT NOT NULL,
        source_column TEXT NOT NULL,
        transformation TEXT NOT NULL,
        computed_at TEXT NOT NULL,
        PRIMARY KEY (model_id, column_name, source_model_id, source_column),
        FOREIGN KEY (model_id) REFERENCES models(unique_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS session_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        created_at INTEGER NOT NULL,
        tool_name TEXT NOT NULL,
        task_text TEXT,
        intent TEXT,
        focus_model TEXT,
        pivot_count INTEGER,
        token_estimate INTEGER,
        duration_ms INTEGER NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}'
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_models_name ON models(name)",
    "CREATE INDEX IF NOT EXISTS idx_models_layer ON models(layer)",
    "CREATE INDEX IF NOT EXISTS idx_tests_model_id ON tests(model_id)",
    "CREATE INDEX IF NOT EXISTS idx_edges_child ON edges(child_id)",
    "CREATE INDEX IF NOT EXISTS idx_session_events_created_at ON session_events(created_at DESC)",
];

/// Create every table, index and the full-text projection on `pool`.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES.iter().chain(INDEXES) {
        sqlx::query(ddl).execute(pool).await?;
    }

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='search_index'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE search_index USING fts5(
                unique_id UNINDEXED,
                name,
                description,
                column_names,
                sql_text,
                tags,
                tokenize = 'porter unicode61 remove_diacritics 2'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("data/capsule.sqlite"));
        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();

        let pool = db::connect(&config).await.unwrap();
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for expected in [
            "column_lineage",
            "columns",
            "edges",
            "exposures",
            "index_metadata",
            "macros",
            "models",
            "search_index",
            "session_events",
            "source_columns",
            "sources",
            "tests",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {}", expected);
        }
    }
}
