//! Normalized ingestion records.
//!
//! The artifact-parsing collaborator hands the indexer a [`RecordBundle`]:
//! one JSON document holding arrays of model, source, test, macro,
//! exposure and edge records plus optional warehouse-stats and test-result
//! overlays. Entries are kept as raw [`serde_json::Value`]s until staging
//! so that one malformed record is reported on its own instead of failing
//! the whole bundle.
//!
//! Every structural record may carry a `content_hash`; when it is absent
//! the hash is the SHA-256 of the record's canonical JSON.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EngineError, EngineResult, IngestionError, IngestionErrorKind};
use crate::models::{
    Column, Exposure, Layer, Macro, Model, ModelStats, Source, TestKind, TestNode, TestRun,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordBundle {
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub models: Vec<Value>,
    #[serde(default)]
    pub sources: Vec<Value>,
    #[serde(default)]
    pub tests: Vec<Value>,
    #[serde(default)]
    pub macros: Vec<Value>,
    #[serde(default)]
    pub exposures: Vec<Value>,
    #[serde(default)]
    pub edges: Vec<Value>,
    #[serde(default)]
    pub model_stats: Vec<Value>,
    #[serde(default)]
    pub test_results: Vec<Value>,
}

impl RecordBundle {
    pub fn from_json(text: &str) -> EngineResult<Self> {
        serde_json::from_str(text).map_err(|e| EngineError::Input(e.to_string()))
    }

    pub fn from_path(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Input(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Project metadata flattened to strings for `index_metadata`.
    pub fn metadata_strings(&self) -> BTreeMap<String, String> {
        self.metadata
            .iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), s)
            })
            .collect()
    }
}

/// SHA-256 hex of the canonical JSON of `value`.
pub fn hash_value(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Decode one record, labelling failures with the record id when one can
/// be found, or its position otherwise.
pub fn decode<T: DeserializeOwned>(kind: &str, position: usize, value: &Value) -> Result<T, IngestionError> {
    serde_json::from_value(value.clone()).map_err(|e| {
        let label = value
            .get("unique_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}[{}]", kind, position));
        IngestionError::new(IngestionErrorKind::Malformed, label, e.to_string())
    })
}

fn content_hash(explicit: &Option<String>, value: &Value) -> String {
    match explicit {
        Some(h) if !h.is_empty() => h.clone(),
        _ => hash_value(value),
    }
}

fn non_empty(kind: &str, id: &str, field: &str, value: &str) -> Result<(), IngestionError> {
    if value.trim().is_empty() {
        return Err(IngestionError::new(
            IngestionErrorKind::Malformed,
            if id.is_empty() { kind } else { id },
            format!("{} must not be empty", field),
        ));
    }
    Ok(())
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn empty_array() -> Value {
    Value::Array(Vec::new())
}

#[derive(Debug, Deserialize)]
pub struct ColumnRecord {
    pub name: String,
    #[serde(default, alias = "type")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object")]
    pub meta: Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ColumnRecord {
    fn into_column(self) -> Column {
        Column {
            name: self.name,
            data_type: self.data_type.unwrap_or_default(),
            description: self.description,
            meta: self.meta,
            tags: self.tags,
            is_primary_key: false,
            is_foreign_key: false,
        }
    }
}

fn into_columns(
    owner: &str,
    records: Vec<ColumnRecord>,
) -> Result<Vec<Column>, IngestionError> {
    let mut seen = std::collections::BTreeSet::new();
    let mut columns = Vec::with_capacity(records.len());
    for record in records {
        non_empty("column", owner, "column name", &record.name)?;
        if !seen.insert(record.name.to_lowercase()) {
            return Err(IngestionError::new(
                IngestionErrorKind::Duplicate,
                owner,
                format!("column '{}' declared twice", record.name),
            ));
        }
        columns.push(record.into_column());
    }
    Ok(columns)
}

#[derive(Debug, Deserialize)]
pub struct ModelRecord {
    pub unique_id: String,
    pub name: String,
    #[serde(default)]
    pub fqn: Vec<String>,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default, alias = "original_file_path")]
    pub file_path: String,
    #[serde(default)]
    pub raw_code: String,
    #[serde(default)]
    pub compiled_code: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub layer: Option<String>,
    #[serde(default)]
    pub materialization: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "empty_object")]
    pub meta: Value,
    #[serde(default = "empty_object")]
    pub config: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub columns: Vec<ColumnRecord>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl ModelRecord {
    pub fn into_model(self, raw: &Value) -> Result<Model, IngestionError> {
        non_empty("model", &self.unique_id, "unique_id", &self.unique_id)?;
        non_empty("model", &self.unique_id, "name", &self.name)?;

        let layer = match self.layer.as_deref() {
            Some(s) => Layer::parse(s).ok_or_else(|| {
                IngestionError::new(
                    IngestionErrorKind::Malformed,
                    &self.unique_id,
                    format!("unknown layer '{}'", s),
                )
            })?,
            None => Layer::detect(&self.fqn, &self.name, &self.tags),
        };
        let materialization = self
            .materialization
            .or_else(|| {
                self.config
                    .get("materialized")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| "view".to_string());
        let columns = into_columns(&self.unique_id, self.columns)?;
        let alias = if self.alias.is_empty() {
            self.name.clone()
        } else {
            self.alias
        };

        Ok(Model {
            content_hash: content_hash(&self.content_hash, raw),
            unique_id: self.unique_id,
            name: self.name,
            fqn: self.fqn,
            package_name: self.package_name,
            database: self.database,
            db_schema: self.schema,
            alias,
            file_path: self.file_path,
            raw_code: self.raw_code,
            compiled_code: self.compiled_code,
            language: self.language.unwrap_or_else(|| "sql".to_string()),
            description: self.description,
            layer,
            materialization,
            tags: self.tags,
            meta: self.meta,
            config: self.config,
            depends_on_nodes: self.depends_on,
            refs: self.refs,
            sources: self.sources,
            columns,
            stats: None,
            upstream_count: 0,
            downstream_count: 0,
            centrality: 0.0,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SourceRecord {
    pub unique_id: String,
    pub name: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub loader: String,
    #[serde(default)]
    pub freshness: Option<FreshnessRecord>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "empty_object")]
    pub meta: Value,
    #[serde(default)]
    pub columns: Vec<ColumnRecord>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FreshnessRecord {
    #[serde(default)]
    pub warn_after: Option<Value>,
    #[serde(default)]
    pub error_after: Option<Value>,
}

impl SourceRecord {
    pub fn into_source(self, raw: &Value) -> Result<Source, IngestionError> {
        non_empty("source", &self.unique_id, "unique_id", &self.unique_id)?;
        non_empty("source", &self.unique_id, "name", &self.name)?;
        let columns = into_columns(&self.unique_id, self.columns)?;
        let freshness = self.freshness.unwrap_or_default();
        Ok(Source {
            content_hash: content_hash(&self.content_hash, raw),
            unique_id: self.unique_id,
            name: self.name,
            source_name: self.source_name,
            schema_name: self.schema,
            database: self.database,
            description: self.description,
            loader: self.loader,
            freshness_warn: freshness.warn_after.filter(|v| !v.is_null()),
            freshness_error: freshness.error_after.filter(|v| !v.is_null()),
            tags: self.tags,
            meta: self.meta,
            columns,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct TestRecord {
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "test_type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub generic: bool,
    #[serde(default, alias = "attached_node")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub column_name: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TestRecord {
    pub fn into_test(self, raw: &Value) -> Result<TestNode, IngestionError> {
        non_empty("test", &self.unique_id, "unique_id", &self.unique_id)?;
        let name = if self.name.is_empty() {
            self.unique_id.clone()
        } else {
            self.name
        };
        Ok(TestNode {
            content_hash: content_hash(&self.content_hash, raw),
            kind: TestKind::classify(&self.kind, self.generic),
            unique_id: self.unique_id,
            name,
            model_id: self.model_id.filter(|m| !m.is_empty()),
            column_name: self.column_name.unwrap_or_default(),
            depends_on: self.depends_on,
            severity: self
                .severity
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "error".to_string()),
            last_run: None,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct MacroRecord {
    pub unique_id: String,
    pub name: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default, alias = "original_file_path")]
    pub file_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_array")]
    pub arguments: Value,
    #[serde(default)]
    pub macro_sql: String,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl MacroRecord {
    pub fn into_macro(self, raw: &Value) -> Result<Macro, IngestionError> {
        non_empty("macro", &self.unique_id, "unique_id", &self.unique_id)?;
        non_empty("macro", &self.unique_id, "name", &self.name)?;
        Ok(Macro {
            content_hash: content_hash(&self.content_hash, raw),
            unique_id: self.unique_id,
            name: self.name,
            package_name: self.package_name,
            file_path: self.file_path,
            description: self.description,
            arguments: self.arguments,
            macro_sql: self.macro_sql,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ExposureRecord {
    pub unique_id: String,
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, rename = "type")]
    pub exposure_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: OwnerRecord,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OwnerRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl ExposureRecord {
    pub fn into_exposure(self, raw: &Value) -> Result<Exposure, IngestionError> {
        non_empty("exposure", &self.unique_id, "unique_id", &self.unique_id)?;
        non_empty("exposure", &self.unique_id, "name", &self.name)?;
        Ok(Exposure {
            content_hash: content_hash(&self.content_hash, raw),
            unique_id: self.unique_id,
            name: self.name,
            label: self.label,
            exposure_type: self.exposure_type,
            url: self.url,
            description: self.description,
            owner_name: self.owner.name,
            owner_email: self.owner.email,
            depends_on: self.depends_on,
            tags: self.tags,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct EdgeRecord {
    #[serde(alias = "parent")]
    pub parent_id: String,
    #[serde(alias = "child")]
    pub child_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelStatsRecord {
    pub model_id: String,
    #[serde(default)]
    pub row_count: Option<i64>,
    #[serde(default)]
    pub bytes: Option<i64>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub column_types: BTreeMap<String, String>,
}

impl ModelStatsRecord {
    pub fn into_stats(self) -> ModelStats {
        ModelStats {
            row_count: self.row_count,
            bytes: self.bytes,
            last_modified: self.last_modified,
            column_types: self
                .column_types
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TestResultRecord {
    pub test_id: String,
    pub status: String,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub failures: Option<i64>,
}

impl TestResultRecord {
    pub fn into_run(self) -> TestRun {
        TestRun {
            status: self.status.to_lowercase(),
            execution_time: self.execution_time,
            failures: self.failures,
        }
    }
}
