//! Engine-level integration tests.
//!
//! These drive ingestion, persistence and every query operation through a
//! real SQLite store in a temporary directory, using JSON record bundles in
//! the same shape the `capsule index` command reads.

use dbt_capsule::capsule::get_context_capsule;
use dbt_capsule::config::Config;
use dbt_capsule::engine::Engine;
use dbt_capsule::error::{EngineError, IngestionErrorKind};
use dbt_capsule::ingest::IndexMode;
use dbt_capsule::intent::Intent;
use dbt_capsule::models::Layer;
use dbt_capsule::records::RecordBundle;
use dbt_capsule::search::search_models;
use dbt_capsule::snapshot::GraphSnapshot;
use dbt_capsule::traits::{ToolContext, ToolRegistry};
use dbt_capsule::traversal::get_lineage;
use dbt_capsule::usage::usage_summary;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    Config::with_db_path(tmp.path().join("capsule.sqlite"))
}

fn model(name: &str, sql: &str) -> Value {
    json!({
        "unique_id": format!("model.shop.{}", name),
        "name": name,
        "fqn": ["shop", name],
        "raw_code": sql,
        "columns": [{ "name": "id", "data_type": "integer" }],
    })
}

fn edge(parent: &str, child: &str) -> Value {
    json!({ "parent_id": parent, "child_id": child })
}

fn mid(name: &str) -> String {
    format!("model.shop.{}", name)
}

fn bundle(value: Value) -> RecordBundle {
    RecordBundle::from_json(&value.to_string()).unwrap()
}

/// A → B → C.
fn chain_bundle() -> RecordBundle {
    bundle(json!({
        "models": [
            model("a", "select 1 as id"),
            model("b", "select id from {{ ref('a') }}"),
            model("c", "select id from {{ ref('b') }}"),
        ],
        "edges": [
            edge(&mid("a"), &mid("b")),
            edge(&mid("b"), &mid("c")),
        ],
    }))
}

/// Two components: a → b → c and x → y.
fn baseline_bundle() -> Value {
    json!({
        "models": [
            model("a", "select 1 as id"),
            model("b", "select id from {{ ref('a') }}"),
            model("c", "select id from {{ ref('b') }}"),
            model("x", "select 2 as id"),
            model("y", "select id from {{ ref('x') }}"),
        ],
        "edges": [
            edge(&mid("a"), &mid("b")),
            edge(&mid("b"), &mid("c")),
            edge(&mid("x"), &mid("y")),
        ],
    })
}

/// Baseline with b edited, c removed, d added under b and z added under y.
fn changed_bundle() -> Value {
    let mut b = model("b", "select id from {{ ref('a') }}");
    b["description"] = json!("now with a description");
    json!({
        "models": [
            model("a", "select 1 as id"),
            b,
            model("d", "select id from {{ ref('b') }}"),
            model("x", "select 2 as id"),
            model("y", "select id from {{ ref('x') }}"),
            model("z", "select id from {{ ref('y') }}"),
        ],
        "edges": [
            edge(&mid("a"), &mid("b")),
            edge(&mid("b"), &mid("d")),
            edge(&mid("x"), &mid("y")),
            edge(&mid("y"), &mid("z")),
        ],
    })
}

fn shop_bundle() -> RecordBundle {
    bundle(shop_records())
}

fn shop_records() -> Value {
    json!({
        "metadata": { "project_name": "shop" },
        "sources": [{
            "unique_id": "source.shop.raw.payments",
            "name": "payments",
            "source_name": "raw",
            "loader": "fivetran",
            "freshness": { "warn_after": { "count": 12, "period": "hour" } },
            "columns": [{ "name": "payment_id" }, { "name": "amount" }],
        }],
        "models": [
            {
                "unique_id": mid("stg_payments"),
                "name": "stg_payments",
                "fqn": ["shop", "staging", "stg_payments"],
                "description": "Payments cleaned from the raw feed",
                "raw_code": "select payment_id, amount from {{ source('raw', 'payments') }}",
                "columns": [
                    { "name": "payment_id", "data_type": "integer" },
                    { "name": "amount", "data_type": "numeric" },
                ],
            },
            {
                "unique_id": mid("int_payments"),
                "name": "int_payments",
                "fqn": ["shop", "intermediate", "int_payments"],
                "description": "Payments joined to orders",
                "raw_code": "select payment_id, amount as amount_usd from {{ ref('stg_payments') }}",
                "columns": [
                    { "name": "payment_id", "data_type": "integer" },
                    { "name": "amount_usd", "data_type": "numeric" },
                ],
            },
            {
                "unique_id": mid("revenue_daily"),
                "name": "revenue_daily",
                "fqn": ["shop", "marts", "revenue_daily"],
                "description": "Daily revenue totals",
                "materialization": "table",
                "raw_code": "select date_day, sum(amount_usd) as revenue from {{ ref('int_payments') }} group by 1",
                "columns": [
                    { "name": "date_day", "data_type": "date" },
                    { "name": "revenue", "data_type": "numeric" },
                ],
            },
            {
                "unique_id": mid("customers"),
                "name": "customers",
                "fqn": ["shop", "marts", "customers"],
                "description": "Customer dimension",
                "raw_code": "select 1 as customer_id",
                "columns": [{ "name": "customer_id", "data_type": "integer" }],
            },
        ],
        "tests": [
            {
                "unique_id": "test.shop.not_null_revenue_daily_date_day",
                "name": "not_null_revenue_daily_date_day",
                "kind": "not_null",
                "model_id": mid("revenue_daily"),
                "column_name": "date_day",
            },
            {
                "unique_id": "test.shop.unique_revenue_daily_date_day",
                "name": "unique_revenue_daily_date_day",
                "kind": "unique",
                "model_id": mid("revenue_daily"),
                "column_name": "date_day",
            },
        ],
        "exposures": [{
            "unique_id": "exposure.shop.finance_dashboard",
            "name": "finance_dashboard",
            "type": "dashboard",
            "owner": { "name": "Finance", "email": "finance@example.com" },
            "depends_on": [mid("revenue_daily")],
        }],
        "edges": [
            edge("source.shop.raw.payments", &mid("stg_payments")),
            edge(&mid("stg_payments"), &mid("int_payments")),
            edge(&mid("int_payments"), &mid("revenue_daily")),
            edge(&mid("revenue_daily"), "exposure.shop.finance_dashboard"),
        ],
        "test_results": [{
            "test_id": "test.shop.not_null_revenue_daily_date_day",
            "status": "fail",
            "failures": 3,
        }],
    })
}

async fn engine_with(tmp: &TempDir, records: RecordBundle) -> Engine {
    let engine = Engine::open(test_config(tmp)).await.unwrap();
    let report = engine.reindex(records, IndexMode::Full).await.unwrap();
    assert!(report.committed, "baseline pass rejected: {:?}", report.errors);
    engine
}

/// Structural equality of two snapshots, with derived scores compared to
/// floating-point tolerance.
fn assert_same_graph(left: &GraphSnapshot, right: &GraphSnapshot) {
    let left_ids: Vec<&String> = left.models.keys().collect();
    let right_ids: Vec<&String> = right.models.keys().collect();
    assert_eq!(left_ids, right_ids);
    assert_eq!(left.edges, right.edges);
    for (id, l) in &left.models {
        let r = &right.models[id];
        assert_eq!(l.name, r.name);
        assert_eq!(l.description, r.description);
        assert_eq!(l.upstream_count, r.upstream_count, "upstream_count of {}", id);
        assert_eq!(l.downstream_count, r.downstream_count, "downstream_count of {}", id);
        assert!(
            (l.centrality - r.centrality).abs() < 1e-9,
            "centrality of {}: {} vs {}",
            id,
            l.centrality,
            r.centrality
        );
    }
}

// ─── Ingestion ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_full_reindex_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, bundle(baseline_bundle())).await;
    let first = engine.snapshot();

    let report = engine
        .reindex(bundle(baseline_bundle()), IndexMode::Full)
        .await
        .unwrap();
    assert!(report.committed);
    let second = engine.snapshot();

    assert_eq!(second.generation, first.generation + 1);
    assert_eq!(first.edges, second.edges);
    for (id, m) in &first.models {
        let again = &second.models[id];
        assert_eq!(m.upstream_count, again.upstream_count);
        assert_eq!(m.downstream_count, again.downstream_count);
        assert_eq!(m.centrality.to_bits(), again.centrality.to_bits(), "{}", id);
        assert_eq!(m.content_hash, again.content_hash);
    }
}

#[tokio::test]
async fn test_incremental_matches_full_rebuild() {
    let tmp_incremental = TempDir::new().unwrap();
    let incremental = engine_with(&tmp_incremental, bundle(baseline_bundle())).await;
    let report = incremental
        .reindex(bundle(changed_bundle()), IndexMode::Incremental)
        .await
        .unwrap();
    assert!(report.committed);
    assert_eq!(report.added, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(report.unchanged, 3);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let tmp_full = TempDir::new().unwrap();
    let full = engine_with(&tmp_full, bundle(changed_bundle())).await;

    assert_same_graph(&incremental.snapshot(), &full.snapshot());
    assert!(incremental.snapshot().models.get(&mid("c")).is_none());
}

#[tokio::test]
async fn test_unchanged_incremental_pass_touches_nothing() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, bundle(baseline_bundle())).await;

    let report = engine
        .reindex(bundle(baseline_bundle()), IndexMode::Incremental)
        .await
        .unwrap();
    assert!(report.committed);
    assert_eq!(report.added + report.updated + report.removed, 0);
    assert_eq!(report.unchanged, 5);
    assert_eq!(report.edges_added + report.edges_removed, 0);
}

#[tokio::test]
async fn test_cycle_rejects_whole_pass() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, chain_bundle()).await;
    let before = engine.snapshot();

    let mut records = json!({
        "models": [
            model("a", "select 1 as id"),
            model("b", "select id from {{ ref('a') }}"),
            model("c", "select id from {{ ref('b') }}"),
            model("new_model", "select 3 as id"),
        ],
    });
    records["edges"] = json!([
        edge(&mid("a"), &mid("b")),
        edge(&mid("b"), &mid("c")),
        edge(&mid("c"), &mid("a")),
    ]);
    let report = engine
        .reindex(bundle(records), IndexMode::Incremental)
        .await
        .unwrap();

    assert!(!report.committed);
    assert!(report
        .errors
        .iter()
        .any(|e| e.kind == IngestionErrorKind::Cycle));
    assert_eq!(report.generation, before.generation);

    let after = engine.snapshot();
    assert_eq!(after.generation, before.generation);
    assert_eq!(after.edges, before.edges);
    assert!(!after.models.contains_key(&mid("new_model")));

    // Nothing reached the store either.
    engine.close().await;
    let reopened = Engine::open(test_config(&tmp)).await.unwrap();
    assert_eq!(reopened.snapshot().models.len(), 3);
    assert_eq!(reopened.snapshot().edges, before.edges);
}

#[tokio::test]
async fn test_malformed_and_unresolved_records_are_reported() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&tmp)).await.unwrap();

    let records = bundle(json!({
        "models": [
            model("a", "select 1 as id"),
            { "unique_id": "model.shop.nameless" },
        ],
        "edges": [edge(&mid("a"), &mid("ghost"))],
        "model_stats": [{ "model_id": mid("ghost"), "row_count": 10 }],
    }));
    let report = engine.reindex(records, IndexMode::Full).await.unwrap();

    assert!(report.committed);
    assert_eq!(report.added, 1);
    let kinds: Vec<IngestionErrorKind> = report.errors.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&IngestionErrorKind::Malformed));
    assert!(kinds.contains(&IngestionErrorKind::Unresolved));
    assert!(engine.snapshot().edges.is_empty());
}

#[tokio::test]
async fn test_snapshot_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, shop_bundle()).await;
    let published = engine.snapshot();
    engine.close().await;

    let reopened = Engine::open(test_config(&tmp)).await.unwrap();
    let loaded = reopened.snapshot();

    assert_eq!(loaded.generation, published.generation);
    assert_same_graph(&published, &loaded);
    assert_eq!(loaded.sources.len(), 1);
    assert_eq!(loaded.exposures.len(), 1);
    assert_eq!(loaded.tests.len(), 2);

    let date_day = loaded.models[&mid("revenue_daily")]
        .columns
        .iter()
        .find(|c| c.name == "date_day")
        .unwrap();
    assert!(date_day.is_primary_key);
}

// ─── Queries ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chain_lineage_and_search() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, chain_bundle()).await;
    let snapshot = engine.snapshot();
    let retrieval = &engine.config().retrieval;

    let one = get_lineage(&snapshot, retrieval, "b", Some("downstream"), Some(1)).unwrap();
    let names: Vec<&str> = one.downstream.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["c"]);
    assert!(one.upstream.is_empty());

    let two = get_lineage(&snapshot, retrieval, "b", Some("downstream"), Some(2)).unwrap();
    let names: Vec<&str> = two.downstream.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["c"]);

    let up = get_lineage(&snapshot, retrieval, "c", Some("upstream"), Some(5)).unwrap();
    let distances: Vec<(&str, usize)> = up
        .upstream
        .iter()
        .map(|n| (n.name.as_str(), n.distance))
        .collect();
    assert_eq!(distances, vec![("b", 1), ("a", 2)]);

    let pivots_only = get_lineage(&snapshot, retrieval, "b", Some("both"), Some(0)).unwrap();
    assert!(pivots_only.upstream.is_empty() && pivots_only.downstream.is_empty());

    let hits = search_models(&snapshot, retrieval, "B", None, None).unwrap();
    assert_eq!(hits[0].name, "b");
}

#[tokio::test]
async fn test_lineage_rejects_bad_parameters() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, chain_bundle()).await;
    let snapshot = engine.snapshot();
    let retrieval = &engine.config().retrieval;

    assert!(matches!(
        get_lineage(&snapshot, retrieval, "b", Some("sideways"), None),
        Err(EngineError::Validation { .. })
    ));
    assert!(matches!(
        get_lineage(&snapshot, retrieval, "b", None, Some(-1)),
        Err(EngineError::Validation { .. })
    ));
    assert!(matches!(
        get_lineage(&snapshot, retrieval, "nope", None, None),
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_name_match_outranks_sql_match() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        &tmp,
        bundle(json!({
            "models": [
                model("deliveries", "select shipments from warehouse"),
                model("shipments", "select parcels from warehouse"),
            ],
        })),
    )
    .await;

    let hits = search_models(
        &engine.snapshot(),
        &engine.config().retrieval,
        "shipments",
        None,
        None,
    )
    .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].name, "shipments");
    assert!(hits[0].score > hits[1].score);
}

#[tokio::test]
async fn test_empty_query_with_layer_ranks_by_centrality() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, shop_bundle()).await;

    let hits = search_models(
        &engine.snapshot(),
        &engine.config().retrieval,
        "",
        None,
        Some("marts"),
    )
    .unwrap();
    let names: Vec<&str> = hits.iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, vec!["revenue_daily", "customers"]);
    assert!(hits[0].centrality >= hits[1].centrality);
}

#[tokio::test]
async fn test_debug_capsule_for_revenue_daily() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, shop_bundle()).await;

    let capsule =
        get_context_capsule(&engine, "debug failing test on revenue_daily", None, None).unwrap();

    assert_eq!(capsule.intent, Intent::Debug);
    assert_eq!(capsule.pivots.len(), 1);
    let pivot = &capsule.pivots[0];
    assert_eq!(pivot.name, "revenue_daily");
    assert!(!pivot.compiled_sql.is_empty());
    assert_eq!(pivot.tests.len(), 2);

    let adjacent: Vec<&str> = capsule.adjacent.iter().map(|n| n.name.as_str()).collect();
    assert!(adjacent.contains(&"int_payments"));
    assert!(adjacent.contains(&"finance_dashboard"));
    let distant: Vec<&str> = capsule.distant.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(distant, vec!["stg_payments"]);

    let staging = &capsule.project_patterns[0];
    assert_eq!(staging.layer, Layer::Staging);
    assert_eq!(staging.prefixes, vec!["stg_"]);
    assert_eq!(staging.example.as_deref(), Some("stg_payments"));
    let marts = capsule
        .project_patterns
        .iter()
        .find(|p| p.layer == Layer::Marts)
        .unwrap();
    assert_eq!(marts.model_count, 2);
    assert_eq!(marts.materialization.as_deref(), Some("table"));

    assert!(capsule.summary.token_estimate <= capsule.summary.token_budget);
    assert!(capsule.warnings.is_empty());
}

#[tokio::test]
async fn test_capsule_respects_every_feasible_budget() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(&tmp, shop_bundle()).await;
    let task = "why is revenue wrong";

    let pivot_only = get_context_capsule(&engine, task, Some("revenue_daily"), Some(1)).unwrap();
    assert_eq!(pivot_only.warnings[0].kind, "budget_exceeded");
    let floor = pivot_only.summary.token_estimate;
    assert!(floor > 1);

    let mut previous_included = 0;
    for extra in [0usize, 10, 40, 80, 160, 320, 640, 5000] {
        let budget = floor + extra;
        let capsule =
            get_context_capsule(&engine, task, Some("revenue_daily"), Some(budget as i64))
                .unwrap();
        assert_eq!(capsule.pivots[0].name, "revenue_daily");
        assert!(
            capsule.summary.token_estimate <= budget,
            "estimate {} over budget {}",
            capsule.summary.token_estimate,
            budget
        );
        assert!(capsule.warnings.iter().all(|w| w.kind != "budget_exceeded"));
        assert!(capsule.summary.nodes_included >= previous_included);
        previous_included = capsule.summary.nodes_included;
    }
}

// ─── Tool boundary ──────────────────────────────────────────────────

#[tokio::test]
async fn test_registry_calls_return_structured_results_and_log_usage() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(engine_with(&tmp, shop_bundle()).await);
    let tools = ToolRegistry::with_builtins();
    let ctx = ToolContext::new(engine.clone());

    let capsule = tools
        .call(
            "get_context_capsule",
            json!({ "task": "debug failing test on revenue_daily" }),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(capsule["intent"], "debug");
    assert_eq!(capsule["pivots"][0]["name"], "revenue_daily");

    let details = tools
        .call("get_model_details", json!({ "model_name": "int_payments" }), &ctx)
        .await
        .unwrap();
    assert_eq!(details["name"], "int_payments");

    let missing = tools
        .call("get_model_details", json!({ "model_name": "nope" }), &ctx)
        .await
        .unwrap_err();
    assert_eq!(missing.code, "not_found");

    let bad = tools
        .call(
            "get_lineage",
            json!({ "model_name": "revenue_daily", "depth": -2 }),
            &ctx,
        )
        .await
        .unwrap_err();
    assert_eq!(bad.code, "bad_request");

    let unknown = tools.call("no_such_tool", json!({}), &ctx).await.unwrap_err();
    assert_eq!(unknown.code, "not_found");

    let usage = usage_summary(engine.pool(), 1).await.unwrap();
    assert_eq!(usage.total_calls, 5);
    assert!(usage.intents.iter().any(|i| i.intent == "debug"));
    let details_usage = usage
        .tools
        .iter()
        .find(|t| t.tool_name == "get_model_details")
        .unwrap();
    assert_eq!(details_usage.calls, 2);
    assert_eq!(details_usage.errors, 1);
}

#[tokio::test]
async fn test_model_details_persist_column_lineage() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(engine_with(&tmp, shop_bundle()).await);
    let tools = ToolRegistry::with_builtins();
    let ctx = ToolContext::new(engine.clone());

    for _ in 0..2 {
        tools
            .call("get_model_details", json!({ "model_name": "int_payments" }), &ctx)
            .await
            .unwrap();
    }

    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT column_name, source_column, transformation FROM column_lineage \
         WHERE model_id = ? ORDER BY column_name",
    )
    .bind(mid("int_payments"))
    .fetch_all(engine.pool())
    .await
    .unwrap();

    assert_eq!(
        rows,
        vec![
            (
                "amount_usd".to_string(),
                "amount".to_string(),
                "renamed".to_string()
            ),
            (
                "payment_id".to_string(),
                "payment_id".to_string(),
                "direct".to_string()
            ),
        ]
    );
}

async fn lineage_rows(engine: &Engine, model_id: &str) -> Vec<(String, String)> {
    sqlx::query_as(
        "SELECT column_name, source_column FROM column_lineage WHERE model_id = ? ORDER BY column_name",
    )
    .bind(model_id)
    .fetch_all(engine.pool())
    .await
    .unwrap()
}

#[tokio::test]
async fn test_column_lineage_survives_derived_only_update() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(engine_with(&tmp, shop_bundle()).await);
    let tools = ToolRegistry::with_builtins();
    let ctx = ToolContext::new(engine.clone());
    tools
        .call("get_model_details", json!({ "model_name": "int_payments" }), &ctx)
        .await
        .unwrap();
    assert_eq!(lineage_rows(&engine, &mid("int_payments")).await.len(), 2);
    let before = engine.snapshot().models[&mid("int_payments")].clone();

    // A new child shifts int_payments' degree and centrality, not its content.
    let mut records = shop_records();
    records["models"]
        .as_array_mut()
        .unwrap()
        .push(model("payments_audit", "select payment_id as id from {{ ref('int_payments') }}"));
    records["edges"]
        .as_array_mut()
        .unwrap()
        .push(edge(&mid("int_payments"), &mid("payments_audit")));
    let report = engine
        .reindex(bundle(records.clone()), IndexMode::Incremental)
        .await
        .unwrap();
    assert!(report.committed);
    assert_eq!(report.added, 1);

    let after = engine.snapshot().models[&mid("int_payments")].clone();
    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(after.downstream_count, before.downstream_count + 1);

    let stored: i64 =
        sqlx::query_scalar("SELECT downstream_count FROM models WHERE unique_id = ?")
            .bind(mid("int_payments"))
            .fetch_one(engine.pool())
            .await
            .unwrap();
    assert_eq!(stored, after.downstream_count);
    let columns: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM columns WHERE model_id = ?")
        .bind(mid("int_payments"))
        .fetch_one(engine.pool())
        .await
        .unwrap();
    assert_eq!(columns, 2);
    assert_eq!(
        lineage_rows(&engine, &mid("int_payments")).await,
        vec![
            ("amount_usd".to_string(), "amount".to_string()),
            ("payment_id".to_string(), "payment_id".to_string()),
        ]
    );

    // Editing the model's SQL invalidates what was traced from it.
    records["models"][1]["raw_code"] =
        json!("select payment_id, amount * 100 as amount_usd from {{ ref('stg_payments') }}");
    let report = engine
        .reindex(bundle(records), IndexMode::Incremental)
        .await
        .unwrap();
    assert!(report.committed);
    assert_eq!(report.updated, 1);
    assert!(lineage_rows(&engine, &mid("int_payments")).await.is_empty());
}

#[tokio::test]
async fn test_refresh_index_tool_reads_configured_records() {
    let tmp = TempDir::new().unwrap();
    let records_path = tmp.path().join("records.json");
    std::fs::write(&records_path, serde_json::to_string(&baseline_bundle()).unwrap()).unwrap();

    let mut cfg = test_config(&tmp);
    cfg.ingest.records_path = records_path;
    let engine = Arc::new(Engine::open(cfg).await.unwrap());
    let tools = ToolRegistry::with_builtins();
    let ctx = ToolContext::new(engine.clone());

    let report = tools
        .call("refresh_index", json!({ "full": true }), &ctx)
        .await
        .unwrap();
    assert_eq!(report["committed"], true);
    assert_eq!(report["added"], 5);
    assert_eq!(engine.snapshot().models.len(), 5);
}
