//! Column-level lineage inferred from model SQL.
//!
//! Each column of a model is traced to the columns of its direct parents:
//!
//! - `expr AS col` where `expr` starts with an aggregate call: **aggregated**
//! - `parent_col AS col` with a bare (optionally qualified) column: **renamed**
//! - any other `expr AS col` referencing parent columns: **derived**
//! - no alias, but a parent has a column of the same name: **direct**
//!
//! The analysis is lexical. It reads the compiled text when available and
//! does not attempt to resolve CTE scopes.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeSet;

use crate::error::EngineResult;
use crate::models::{ColumnLineage, Model, Transformation};
use crate::snapshot::GraphSnapshot;

const AGGREGATES: &[&str] = &[
    "sum",
    "count",
    "avg",
    "min",
    "max",
    "median",
    "stddev",
    "variance",
    "array_agg",
    "string_agg",
    "listagg",
    "any_value",
    "count_if",
];

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Identifier tokens of `text`, lowercased, split on anything that is not
/// alphanumeric or underscore.
pub fn identifiers(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty() && !t.as_bytes()[0].is_ascii_digit())
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

/// Find the expression aliased to `column` in `sql`, if any.
///
/// Locates `<expr> AS <column>` and walks backward from `AS` to the
/// enclosing comma, unbalanced open paren, or the start of the text.
pub fn aliased_expression(sql: &str, column: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let target = column.to_ascii_lowercase();

    let mut from = 0;
    while let Some(offset) = lower[from..].find("as") {
        let at = from + offset;
        from = at + 2;

        let before_ok = at > 0 && (bytes[at - 1].is_ascii_whitespace() || bytes[at - 1] == b')');
        let after_ok = bytes.get(at + 2).is_some_and(|b| b.is_ascii_whitespace());
        if !before_ok || !after_ok {
            continue;
        }

        let mut i = at + 2;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let quoted = matches!(bytes.get(i), Some(b'"') | Some(b'`'));
        if quoted {
            i += 1;
        }
        let start = i;
        while i < bytes.len() && is_ident_byte(bytes[i]) {
            i += 1;
        }
        if lower[start..i] != target {
            continue;
        }

        let mut depth = 0usize;
        let mut j = at;
        while j > 0 {
            let b = bytes[j - 1];
            match b {
                b')' => depth += 1,
                b'(' if depth == 0 => break,
                b'(' => depth -= 1,
                b',' if depth == 0 => break,
                _ => {}
            }
            j -= 1;
        }

        let mut expr = sql[j..at].trim();
        for keyword in ["select", "distinct"] {
            let head_matches = expr
                .get(..keyword.len())
                .is_some_and(|h| h.eq_ignore_ascii_case(keyword));
            let spaced = expr
                .as_bytes()
                .get(keyword.len())
                .is_some_and(|b| b.is_ascii_whitespace());
            if head_matches && spaced {
                expr = expr[keyword.len()..].trim_start();
            }
        }
        if !expr.is_empty() {
            return Some(expr.to_string());
        }
    }
    None
}

fn classify(expr: &str, column: &str) -> Transformation {
    let lower = expr.trim().to_ascii_lowercase();
    let head: String = lower
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if AGGREGATES.contains(&head.as_str()) && lower[head.len()..].trim_start().starts_with('(') {
        return Transformation::Aggregated;
    }

    let bare = lower
        .split('.')
        .all(|part| !part.is_empty() && part.bytes().all(|b| is_ident_byte(b) || b == b'"'));
    if bare {
        let last = lower.rsplit('.').next().unwrap_or_default().trim_matches('"');
        if last == column.to_ascii_lowercase() {
            return Transformation::Direct;
        }
        return Transformation::Renamed;
    }
    Transformation::Derived
}

/// Trace every column of `model` to its direct parents' columns.
pub fn infer(snapshot: &GraphSnapshot, model: &Model) -> Vec<ColumnLineage> {
    let sql = model.sql_text();
    let computed_at = Utc::now().to_rfc3339();

    let parent_columns: Vec<(String, String)> = snapshot
        .parents(&model.unique_id)
        .iter()
        .filter_map(|p| snapshot.node(p))
        .flat_map(|node| {
            node.columns()
                .iter()
                .map(move |c| (node.id().to_string(), c.name.clone()))
        })
        .collect();

    let mut rows = Vec::new();
    for column in &model.columns {
        let mut traced: BTreeSet<(String, String)> = BTreeSet::new();
        let transformation = match aliased_expression(sql, &column.name) {
            Some(expr) => {
                let tokens: BTreeSet<String> = identifiers(&expr).into_iter().collect();
                for (parent, name) in &parent_columns {
                    if tokens.contains(&name.to_ascii_lowercase()) {
                        traced.insert((parent.clone(), name.clone()));
                    }
                }
                classify(&expr, &column.name)
            }
            None => {
                for (parent, name) in &parent_columns {
                    if name.eq_ignore_ascii_case(&column.name) {
                        traced.insert((parent.clone(), name.clone()));
                    }
                }
                Transformation::Direct
            }
        };

        for (source_model_id, source_column) in traced {
            rows.push(ColumnLineage {
                model_id: model.unique_id.clone(),
                column_name: column.name.clone(),
                source_model_id,
                source_column,
                transformation,
                computed_at: computed_at.clone(),
            });
        }
    }
    rows
}

/// Upsert lineage rows keyed by their 4-tuple.
pub async fn save(pool: &SqlitePool, rows: &[ColumnLineage]) -> EngineResult<()> {
    let mut tx = pool.begin().await?;
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO column_lineage
                (model_id, column_name, source_model_id, source_column, transformation, computed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(model_id, column_name, source_model_id, source_column) DO UPDATE SET
                transformation = excluded.transformation,
                computed_at = excluded.computed_at
            "#,
        )
        .bind(&row.model_id)
        .bind(&row.column_name)
        .bind(&row.source_model_id)
        .bind(&row.source_column)
        .bind(row.transformation.as_str())
        .bind(&row.computed_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CentralityConfig;
    use crate::models::{test_model, Column, Edge};
    use crate::snapshot::StagedGraph;

    fn col(name: &str) -> Column {
        Column {
            name: name.into(),
            data_type: String::new(),
            description: String::new(),
            meta: serde_json::json!({}),
            tags: vec![],
            is_primary_key: false,
            is_foreign_key: false,
        }
    }

    #[test]
    fn test_aliased_expression_is_paren_aware() {
        let sql = "select id, sum(coalesce(amount, 0)) as total, cast(x as int) as x_int from t";
        assert_eq!(
            aliased_expression(sql, "total").as_deref(),
            Some("sum(coalesce(amount, 0))")
        );
        assert_eq!(aliased_expression(sql, "x_int").as_deref(), Some("cast(x as int)"));
        assert_eq!(aliased_expression(sql, "id"), None);
        assert_eq!(
            aliased_expression("SELECT order_id AS id FROM t", "id").as_deref(),
            Some("order_id")
        );
    }

    #[test]
    fn test_aliased_expression_with_non_ascii_text() {
        assert_eq!(
            aliased_expression("select id, 'éééé' as label from x", "label").as_deref(),
            Some("'éééé'")
        );
        assert_eq!(
            aliased_expression("select 'ü' as u, amount as montant_€ from x", "u").as_deref(),
            Some("'ü'")
        );
        assert_eq!(
            aliased_expression("select\n  é as x from t", "x").as_deref(),
            Some("é")
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("count(*)", "n"), Transformation::Aggregated);
        assert_eq!(classify("o.order_id", "id"), Transformation::Renamed);
        assert_eq!(classify("o.id", "id"), Transformation::Direct);
        assert_eq!(classify("amount * 100", "cents"), Transformation::Derived);
        assert_eq!(classify("counter + 1", "c"), Transformation::Derived);
    }

    #[test]
    fn test_infer_traces_parent_columns() {
        let mut staged = StagedGraph::default();
        let mut parent = test_model("model.p.stg_orders", "stg_orders");
        parent.columns = vec![col("order_id"), col("amount"), col("status")];
        let mut child = test_model("model.p.orders", "orders");
        child.raw_code = "select order_id as id, status, sum(amount) as revenue, \
                          amount * 2 as doubled from stg_orders group by 1, 2"
            .into();
        child.columns = vec![col("id"), col("status"), col("revenue"), col("doubled")];
        staged.models.insert(parent.unique_id.clone(), parent);
        staged.models.insert(child.unique_id.clone(), child);
        staged
            .edges
            .insert(Edge::new("model.p.stg_orders", "model.p.orders"));
        let snap = GraphSnapshot::publish(staged, None, None, &CentralityConfig::default(), 1);

        let rows = infer(&snap, &snap.models["model.p.orders"]);
        let by_col = |c: &str| {
            rows.iter()
                .filter(|r| r.column_name == c)
                .map(|r| (r.source_column.as_str(), r.transformation))
                .collect::<Vec<_>>()
        };
        assert_eq!(by_col("id"), vec![("order_id", Transformation::Renamed)]);
        assert_eq!(by_col("status"), vec![("status", Transformation::Direct)]);
        assert_eq!(by_col("revenue"), vec![("amount", Transformation::Aggregated)]);
        assert_eq!(by_col("doubled"), vec![("amount", Transformation::Derived)]);
    }
}
