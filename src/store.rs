//! Snapshot persistence.
//!
//! [`persist`] writes the difference between the previously published
//! snapshot and the next one inside a single transaction, so the relational
//! store flips from one consistent pass to the next. [`load`] reads the
//! structural content back into a [`StagedGraph`]; derived fields are never
//! trusted from disk and are recomputed by the caller.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult};
use crate::lexical::project_fields;
use crate::models::{
    Column, Edge, Exposure, Layer, Macro, Model, ModelStats, Source, TestKind, TestNode, TestRun,
};
use crate::snapshot::{GraphSnapshot, StagedGraph};

pub const GENERATION_KEY: &str = "snapshot_generation";

fn json_text<T: Serialize + ?Sized>(value: &T) -> EngineResult<String> {
    serde_json::to_string(value).map_err(|e| EngineError::Corrupt(e.to_string()))
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> EngineResult<T> {
    serde_json::from_str(text).map_err(|e| EngineError::Corrupt(format!("{}: {}", what, e)))
}

/// Write `next` to the store. With no `previous` snapshot every graph table
/// is cleared first and rewritten in full.
pub async fn persist(
    pool: &SqlitePool,
    previous: Option<&GraphSnapshot>,
    next: &GraphSnapshot,
) -> EngineResult<()> {
    let mut tx = pool.begin().await?;

    let empty = GraphSnapshot::default();
    let prev = match previous {
        Some(p) => p,
        None => {
            for table in [
                "tests",
                "column_lineage",
                "columns",
                "models",
                "source_columns",
                "sources",
                "macros",
                "exposures",
                "edges",
                "search_index",
            ] {
                sqlx::query(&format!("DELETE FROM {}", table))
                    .execute(&mut *tx)
                    .await?;
            }
            &empty
        }
    };

    // models (removal cascades to columns, tests and lineage rows)
    for id in prev.models.keys().filter(|id| !next.models.contains_key(*id)) {
        delete_model(&mut tx, id).await?;
    }
    for (id, model) in &next.models {
        let old = prev.models.get(id);
        if old == Some(model) {
            continue;
        }
        upsert_model(&mut tx, model).await?;
        // Derived-only changes keep the row, its tests and its lineage.
        if old.map(|o| &o.content_hash) != Some(&model.content_hash) {
            sqlx::query("DELETE FROM column_lineage WHERE model_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM search_index WHERE unique_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            insert_search_row(&mut tx, model).await?;
        }
    }

    for id in prev.tests.keys().filter(|id| !next.tests.contains_key(*id)) {
        sqlx::query("DELETE FROM tests WHERE unique_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    for (id, test) in &next.tests {
        if prev.tests.get(id) != Some(test) {
            insert_test(&mut tx, test).await?;
        }
    }

    for id in prev.sources.keys().filter(|id| !next.sources.contains_key(*id)) {
        sqlx::query("DELETE FROM sources WHERE unique_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    for (id, source) in &next.sources {
        let old = prev.sources.get(id);
        if old == Some(source) {
            continue;
        }
        if old.is_some() {
            sqlx::query("DELETE FROM sources WHERE unique_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        insert_source(&mut tx, source).await?;
    }

    for id in prev.macros.keys().filter(|id| !next.macros.contains_key(*id)) {
        sqlx::query("DELETE FROM macros WHERE unique_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    for (id, m) in &next.macros {
        if prev.macros.get(id) != Some(m) {
            insert_macro(&mut tx, m).await?;
        }
    }

    for id in prev.exposures.keys().filter(|id| !next.exposures.contains_key(*id)) {
        sqlx::query("DELETE FROM exposures WHERE unique_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    for (id, e) in &next.exposures {
        if prev.exposures.get(id) != Some(e) {
            insert_exposure(&mut tx, e).await?;
        }
    }

    for edge in prev.edges.difference(&next.edges) {
        sqlx::query("DELETE FROM edges WHERE parent_id = ? AND child_id = ?")
            .bind(&edge.parent_id)
            .bind(&edge.child_id)
            .execute(&mut *tx)
            .await?;
    }
    for edge in next.edges.difference(&prev.edges) {
        sqlx::query("INSERT OR IGNORE INTO edges (parent_id, child_id) VALUES (?, ?)")
            .bind(&edge.parent_id)
            .bind(&edge.child_id)
            .execute(&mut *tx)
            .await?;
    }

    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query("DELETE FROM index_metadata")
        .execute(&mut *tx)
        .await?;
    for (key, value) in &next.metadata {
        sqlx::query("INSERT INTO index_metadata (key, value, updated_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(value)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn delete_model(tx: &mut Transaction<'_, Sqlite>, id: &str) -> EngineResult<()> {
    sqlx::query("DELETE FROM models WHERE unique_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM search_index WHERE unique_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn upsert_model(tx: &mut Transaction<'_, Sqlite>, m: &Model) -> EngineResult<()> {
    let stats = m.stats.as_ref();
    let catalog_types = match stats {
        Some(s) => Some(json_text(&s.column_types)?),
        None => None,
    };
    sqlx::query(
        r#"
        INSERT INTO models (
            unique_id, name, fqn, package_name, database_name, schema_name, alias,
            file_path, raw_code, compiled_code, language, description, layer,
            materialization, tags, meta, config, depends_on_nodes, refs, sources,
            row_count, bytes, last_modified, catalog_column_types,
            upstream_count, downstream_count, centrality, content_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(unique_id) DO UPDATE SET
            name = excluded.name,
            fqn = excluded.fqn,
            package_name = excluded.package_name,
            database_name = excluded.database_name,
            schema_name = excluded.schema_name,
            alias = excluded.alias,
            file_path = excluded.file_path,
            raw_code = excluded.raw_code,
            compiled_code = excluded.compiled_code,
            language = excluded.language,
            description = excluded.description,
            layer = excluded.layer,
            materialization = excluded.materialization,
            tags = excluded.tags,
            meta = excluded.meta,
            config = excluded.config,
            depends_on_nodes = excluded.depends_on_nodes,
            refs = excluded.refs,
            sources = excluded.sources,
            row_count = excluded.row_count,
            bytes = excluded.bytes,
            last_modified = excluded.last_modified,
            catalog_column_types = excluded.catalog_column_types,
            upstream_count = excluded.upstream_count,
            downstream_count = excluded.downstream_count,
            centrality = excluded.centrality,
            content_hash = excluded.content_hash
        "#,
    )
    .bind(&m.unique_id)
    .bind(&m.name)
    .bind(json_text(&m.fqn)?)
    .bind(&m.package_name)
    .bind(&m.database)
    .bind(&m.db_schema)
    .bind(&m.alias)
    .bind(&m.file_path)
    .bind(&m.raw_code)
    .bind(&m.compiled_code)
    .bind(&m.language)
    .bind(&m.description)
    .bind(m.layer.as_str())
    .bind(&m.materialization)
    .bind(json_text(&m.tags)?)
    .bind(json_text(&m.meta)?)
    .bind(json_text(&m.config)?)
    .bind(json_text(&m.depends_on_nodes)?)
    .bind(json_text(&m.refs)?)
    .bind(json_text(&m.sources)?)
    .bind(stats.and_then(|s| s.row_count))
    .bind(stats.and_then(|s| s.bytes))
    .bind(stats.and_then(|s| s.last_modified.clone()))
    .bind(catalog_types)
    .bind(m.upstream_count)
    .bind(m.downstream_count)
    .bind(m.centrality)
    .bind(&m.content_hash)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM columns WHERE model_id = ?")
        .bind(&m.unique_id)
        .execute(&mut **tx)
        .await?;
    for (position, c) in m.columns.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO columns (
                model_id, position, name, data_type, declared_type, description,
                meta, tags, is_primary_key, is_foreign_key
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&m.unique_id)
        .bind(position as i64)
        .bind(&c.name)
        .bind(m.column_type(c))
        .bind(&c.data_type)
        .bind(&c.description)
        .bind(json_text(&c.meta)?)
        .bind(json_text(&c.tags)?)
        .bind(c.is_primary_key)
        .bind(c.is_foreign_key)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_search_row(tx: &mut Transaction<'_, Sqlite>, m: &Model) -> EngineResult<()> {
    let [name, description, column_names, sql_text, tags] = project_fields(m);
    sqlx::query(
        "INSERT INTO search_index (unique_id, name, description, column_names, sql_text, tags) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&m.unique_id)
    .bind(name)
    .bind(description)
    .bind(column_names)
    .bind(sql_text)
    .bind(tags)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_test(tx: &mut Transaction<'_, Sqlite>, t: &TestNode) -> EngineResult<()> {
    let run = t.last_run.as_ref();
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO tests (
            unique_id, name, test_kind, model_id, column_name, depends_on, severity,
            last_status, last_execution_time, last_failures, content_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&t.unique_id)
    .bind(&t.name)
    .bind(t.kind.as_str())
    .bind(&t.model_id)
    .bind(&t.column_name)
    .bind(json_text(&t.depends_on)?)
    .bind(&t.severity)
    .bind(run.map(|r| r.status.clone()))
    .bind(run.and_then(|r| r.execution_time))
    .bind(run.and_then(|r| r.failures))
    .bind(&t.content_hash)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_source(tx: &mut Transaction<'_, Sqlite>, s: &Source) -> EngineResult<()> {
    let warn = match &s.freshness_warn {
        Some(v) => Some(json_text(v)?),
        None => None,
    };
    let error = match &s.freshness_error {
        Some(v) => Some(json_text(v)?),
        None => None,
    };
    sqlx::query(
        r#"
        INSERT INTO sources (
            unique_id, name, source_name, schema_name, database_name, description,
            loader, freshness_warn, freshness_error, tags, meta, content_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&s.unique_id)
    .bind(&s.name)
    .bind(&s.source_name)
    .bind(&s.schema_name)
    .bind(&s.database)
    .bind(&s.description)
    .bind(&s.loader)
    .bind(warn)
    .bind(error)
    .bind(json_text(&s.tags)?)
    .bind(json_text(&s.meta)?)
    .bind(&s.content_hash)
    .execute(&mut **tx)
    .await?;

    for (position, c) in s.columns.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO source_columns (source_id, position, name, data_type, description, meta, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&s.unique_id)
        .bind(position as i64)
        .bind(&c.name)
        .bind(&c.data_type)
        .bind(&c.description)
        .bind(json_text(&c.meta)?)
        .bind(json_text(&c.tags)?)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_macro(tx: &mut Transaction<'_, Sqlite>, m: &Macro) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO macros (
            unique_id, name, package_name, file_path, description, arguments, macro_sql, content_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&m.unique_id)
    .bind(&m.name)
    .bind(&m.package_name)
    .bind(&m.file_path)
    .bind(&m.description)
    .bind(json_text(&m.arguments)?)
    .bind(&m.macro_sql)
    .bind(&m.content_hash)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_exposure(tx: &mut Transaction<'_, Sqlite>, e: &Exposure) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO exposures (
            unique_id, name, label, exposure_type, url, description,
            owner_name, owner_email, depends_on, tags, content_hash
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&e.unique_id)
    .bind(&e.name)
    .bind(&e.label)
    .bind(&e.exposure_type)
    .bind(&e.url)
    .bind(&e.description)
    .bind(&e.owner_name)
    .bind(&e.owner_email)
    .bind(json_text(&e.depends_on)?)
    .bind(json_text(&e.tags)?)
    .bind(&e.content_hash)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============ Loading ============

fn column_from_row(row: &SqliteRow, type_column: &str) -> EngineResult<Column> {
    Ok(Column {
        name: row.try_get("name")?,
        data_type: row.try_get(type_column)?,
        description: row.try_get("description")?,
        meta: parse_json(&row.try_get::<String, _>("meta")?, "column meta")?,
        tags: parse_json(&row.try_get::<String, _>("tags")?, "column tags")?,
        is_primary_key: false,
        is_foreign_key: false,
    })
}

/// Read the persisted graph and the generation it was published as.
pub async fn load(pool: &SqlitePool) -> EngineResult<(StagedGraph, i64)> {
    let mut staged = StagedGraph::default();

    let mut model_columns: BTreeMap<String, Vec<Column>> = BTreeMap::new();
    for row in sqlx::query("SELECT * FROM columns ORDER BY model_id, position")
        .fetch_all(pool)
        .await?
    {
        let model_id: String = row.try_get("model_id")?;
        model_columns
            .entry(model_id)
            .or_default()
            .push(column_from_row(&row, "declared_type")?);
    }

    for row in sqlx::query("SELECT * FROM models ORDER BY unique_id")
        .fetch_all(pool)
        .await?
    {
        let unique_id: String = row.try_get("unique_id")?;
        let layer_text: String = row.try_get("layer")?;
        let layer = Layer::parse(&layer_text)
            .ok_or_else(|| EngineError::Corrupt(format!("unknown layer '{}'", layer_text)))?;

        let row_count: Option<i64> = row.try_get("row_count")?;
        let bytes: Option<i64> = row.try_get("bytes")?;
        let last_modified: Option<String> = row.try_get("last_modified")?;
        let catalog: Option<String> = row.try_get("catalog_column_types")?;
        let stats = match (row_count, bytes, last_modified, catalog) {
            (None, None, None, None) => None,
            (row_count, bytes, last_modified, catalog) => Some(ModelStats {
                row_count,
                bytes,
                last_modified,
                column_types: match catalog {
                    Some(text) => parse_json(&text, "catalog column types")?,
                    None => BTreeMap::new(),
                },
            }),
        };

        let model = Model {
            columns: model_columns.remove(&unique_id).unwrap_or_default(),
            name: row.try_get("name")?,
            fqn: parse_json(&row.try_get::<String, _>("fqn")?, "fqn")?,
            package_name: row.try_get("package_name")?,
            database: row.try_get("database_name")?,
            db_schema: row.try_get("schema_name")?,
            alias: row.try_get("alias")?,
            file_path: row.try_get("file_path")?,
            raw_code: row.try_get("raw_code")?,
            compiled_code: row.try_get("compiled_code")?,
            language: row.try_get("language")?,
            description: row.try_get("description")?,
            layer,
            materialization: row.try_get("materialization")?,
            tags: parse_json(&row.try_get::<String, _>("tags")?, "tags")?,
            meta: parse_json(&row.try_get::<String, _>("meta")?, "meta")?,
            config: parse_json(&row.try_get::<String, _>("config")?, "config")?,
            depends_on_nodes: parse_json(
                &row.try_get::<String, _>("depends_on_nodes")?,
                "depends_on_nodes",
            )?,
            refs: parse_json(&row.try_get::<String, _>("refs")?, "refs")?,
            sources: parse_json(&row.try_get::<String, _>("sources")?, "sources")?,
            stats,
            upstream_count: 0,
            downstream_count: 0,
            centrality: 0.0,
            content_hash: row.try_get("content_hash")?,
            unique_id: unique_id.clone(),
        };
        staged.models.insert(unique_id, model);
    }

    let mut source_columns: BTreeMap<String, Vec<Column>> = BTreeMap::new();
    for row in sqlx::query("SELECT * FROM source_columns ORDER BY source_id, position")
        .fetch_all(pool)
        .await?
    {
        let source_id: String = row.try_get("source_id")?;
        source_columns
            .entry(source_id)
            .or_default()
            .push(column_from_row(&row, "data_type")?);
    }

    for row in sqlx::query("SELECT * FROM sources ORDER BY unique_id")
        .fetch_all(pool)
        .await?
    {
        let unique_id: String = row.try_get("unique_id")?;
        let warn: Option<String> = row.try_get("freshness_warn")?;
        let error: Option<String> = row.try_get("freshness_error")?;
        let source = Source {
            columns: source_columns.remove(&unique_id).unwrap_or_default(),
            name: row.try_get("name")?,
            source_name: row.try_get("source_name")?,
            schema_name: row.try_get("schema_name")?,
            database: row.try_get("database_name")?,
            description: row.try_get("description")?,
            loader: row.try_get("loader")?,
            freshness_warn: warn.map(|w| parse_json(&w, "freshness")).transpose()?,
            freshness_error: error.map(|e| parse_json(&e, "freshness")).transpose()?,
            tags: parse_json(&row.try_get::<String, _>("tags")?, "tags")?,
            meta: parse_json(&row.try_get::<String, _>("meta")?, "meta")?,
            content_hash: row.try_get("content_hash")?,
            unique_id: unique_id.clone(),
        };
        staged.sources.insert(unique_id, source);
    }

    for row in sqlx::query("SELECT * FROM tests ORDER BY unique_id")
        .fetch_all(pool)
        .await?
    {
        let unique_id: String = row.try_get("unique_id")?;
        let kind: String = row.try_get("test_kind")?;
        let status: Option<String> = row.try_get("last_status")?;
        let test = TestNode {
            name: row.try_get("name")?,
            kind: TestKind::classify(&kind, true),
            model_id: row.try_get("model_id")?,
            column_name: row.try_get("column_name")?,
            depends_on: parse_json(&row.try_get::<String, _>("depends_on")?, "depends_on")?,
            severity: row.try_get("severity")?,
            last_run: match status {
                Some(status) => Some(TestRun {
                    status,
                    execution_time: row.try_get("last_execution_time")?,
                    failures: row.try_get("last_failures")?,
                }),
                None => None,
            },
            content_hash: row.try_get("content_hash")?,
            unique_id: unique_id.clone(),
        };
        staged.tests.insert(unique_id, test);
    }

    for row in sqlx::query("SELECT * FROM macros ORDER BY unique_id")
        .fetch_all(pool)
        .await?
    {
        let unique_id: String = row.try_get("unique_id")?;
        let m = Macro {
            name: row.try_get("name")?,
            package_name: row.try_get("package_name")?,
            file_path: row.try_get("file_path")?,
            description: row.try_get("description")?,
            arguments: parse_json(&row.try_get::<String, _>("arguments")?, "arguments")?,
            macro_sql: row.try_get("macro_sql")?,
            content_hash: row.try_get("content_hash")?,
            unique_id: unique_id.clone(),
        };
        staged.macros.insert(unique_id, m);
    }

    for row in sqlx::query("SELECT * FROM exposures ORDER BY unique_id")
        .fetch_all(pool)
        .await?
    {
        let unique_id: String = row.try_get("unique_id")?;
        let e = Exposure {
            name: row.try_get("name")?,
            label: row.try_get("label")?,
            exposure_type: row.try_get("exposure_type")?,
            url: row.try_get("url")?,
            description: row.try_get("description")?,
            owner_name: row.try_get("owner_name")?,
            owner_email: row.try_get("owner_email")?,
            depends_on: parse_json(&row.try_get::<String, _>("depends_on")?, "depends_on")?,
            tags: parse_json(&row.try_get::<String, _>("tags")?, "tags")?,
            content_hash: row.try_get("content_hash")?,
            unique_id: unique_id.clone(),
        };
        staged.exposures.insert(unique_id, e);
    }

    for row in sqlx::query("SELECT parent_id, child_id FROM edges")
        .fetch_all(pool)
        .await?
    {
        staged.edges.insert(Edge {
            parent_id: row.try_get("parent_id")?,
            child_id: row.try_get("child_id")?,
        });
    }

    for row in sqlx::query("SELECT key, value FROM index_metadata")
        .fetch_all(pool)
        .await?
    {
        staged
            .metadata
            .insert(row.try_get("key")?, row.try_get("value")?);
    }

    let generation = staged
        .metadata
        .get(GENERATION_KEY)
        .and_then(|g| g.parse().ok())
        .unwrap_or(0);

    Ok((staged, generation))
}
