//! Session event log.
//!
//! Every tool invocation is appended to `session_events` with its outcome
//! and, for capsule requests, the intent, pivot count and token estimate.
//! `capsule usage --days N` summarizes the window.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::EngineResult;
use crate::migrate;

/// One tool invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionEvent {
    pub tool_name: String,
    pub task_text: Option<String>,
    pub intent: Option<String>,
    pub focus_model: Option<String>,
    pub pivot_count: Option<i64>,
    pub token_estimate: Option<i64>,
    pub duration_ms: i64,
    /// `ok` or the error code returned to the caller.
    pub status: String,
    pub payload: serde_json::Value,
}

pub async fn record_event(pool: &SqlitePool, event: &SessionEvent) -> EngineResult<()> {
    sqlx::query(
        r#"
        INSERT INTO session_events
            (created_at, tool_name, task_text, intent, focus_model, pivot_count,
             token_estimate, duration_ms, status, payload)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Utc::now().timestamp())
    .bind(&event.tool_name)
    .bind(&event.task_text)
    .bind(&event.intent)
    .bind(&event.focus_model)
    .bind(event.pivot_count)
    .bind(event.token_estimate)
    .bind(event.duration_ms)
    .bind(&event.status)
    .bind(event.payload.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub calls: i64,
    pub errors: i64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentUsage {
    pub intent: String,
    pub calls: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub days: i64,
    pub total_calls: i64,
    pub tools: Vec<ToolUsage>,
    pub intents: Vec<IntentUsage>,
    pub avg_token_estimate: Option<f64>,
}

pub async fn usage_summary(pool: &SqlitePool, days: i64) -> EngineResult<UsageSummary> {
    // A window reaching past the representable range covers every event.
    let since = Duration::try_days(days.max(0))
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .map_or(i64::MIN, |start| start.timestamp());

    let tools: Vec<ToolUsage> = sqlx::query(
        r#"
        SELECT tool_name,
               COUNT(*) AS calls,
               SUM(CASE WHEN status = 'ok' THEN 0 ELSE 1 END) AS errors,
               AVG(duration_ms) AS avg_duration_ms
        FROM session_events
        WHERE created_at >= ?
        GROUP BY tool_name
        ORDER BY calls DESC, tool_name ASC
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| -> EngineResult<ToolUsage> {
        Ok(ToolUsage {
            tool_name: row.try_get("tool_name")?,
            calls: row.try_get("calls")?,
            errors: row.try_get("errors")?,
            avg_duration_ms: row.try_get("avg_duration_ms")?,
        })
    })
    .collect::<EngineResult<_>>()?;

    let intents: Vec<IntentUsage> = sqlx::query(
        r#"
        SELECT intent, COUNT(*) AS calls
        FROM session_events
        WHERE created_at >= ? AND intent IS NOT NULL
        GROUP BY intent
        ORDER BY calls DESC, intent ASC
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| -> EngineResult<IntentUsage> {
        Ok(IntentUsage {
            intent: row.try_get("intent")?,
            calls: row.try_get("calls")?,
        })
    })
    .collect::<EngineResult<_>>()?;

    let avg_token_estimate: Option<f64> = sqlx::query_scalar(
        "SELECT AVG(token_estimate) FROM session_events WHERE created_at >= ? AND token_estimate IS NOT NULL",
    )
    .bind(since)
    .fetch_one(pool)
    .await?;

    Ok(UsageSummary {
        days,
        total_calls: tools.iter().map(|t| t.calls).sum(),
        tools,
        intents,
        avg_token_estimate,
    })
}

/// CLI entry point for `capsule usage`.
pub async fn run_usage(config: &Config, days: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let summary = usage_summary(&pool, days).await?;
    pool.close().await;

    println!("Usage over the last {} day(s): {} call(s)", summary.days, summary.total_calls);
    if summary.total_calls == 0 {
        return Ok(());
    }

    println!("\nBy tool:");
    for t in &summary.tools {
        println!(
            "  {:<22} {:>6} calls  {:>4} errors  {:>8.1} ms avg",
            t.tool_name, t.calls, t.errors, t.avg_duration_ms
        );
    }
    if !summary.intents.is_empty() {
        println!("\nBy intent:");
        for i in &summary.intents {
            println!("  {:<22} {:>6}", i.intent, i.calls);
        }
    }
    if let Some(avg) = summary.avg_token_estimate {
        println!("\nAverage capsule size: {:.0} tokens", avg);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_are_summarized() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("usage.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();

        for (tool, status, intent, tokens) in [
            ("get_context_capsule", "ok", Some("debug"), Some(1200)),
            ("get_context_capsule", "ok", Some("debug"), Some(800)),
            ("get_lineage", "not_found", None, None),
        ] {
            record_event(
                &pool,
                &SessionEvent {
                    tool_name: tool.into(),
                    intent: intent.map(String::from),
                    token_estimate: tokens,
                    duration_ms: 4,
                    status: status.into(),
                    payload: serde_json::json!({}),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        let summary = usage_summary(&pool, 7).await.unwrap();
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.tools[0].tool_name, "get_context_capsule");
        assert_eq!(summary.tools[1].errors, 1);
        assert_eq!(summary.intents.len(), 1);
        assert_eq!(summary.avg_token_estimate, Some(1000.0));

        let summary = usage_summary(&pool, i64::MAX).await.unwrap();
        assert_eq!(summary.days, i64::MAX);
        assert_eq!(summary.total_calls, 3);

        let summary = usage_summary(&pool, 200_000_000_000).await.unwrap();
        assert_eq!(summary.total_calls, 3);
    }
}
