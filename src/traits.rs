//! Tool trait and registry.
//!
//! Every query the engine answers is exposed as a [`Tool`]: a name, a
//! description, a JSON Schema for its parameters and an async `execute`.
//! The HTTP endpoint and the MCP bridge both dispatch through
//! [`ToolRegistry::call`], which validates parameters, applies the
//! per-request timeout (the `timeout_ms` call parameter, defaulting to
//! `[server].request_timeout_secs`), maps failures to structured error codes and logs
//! the invocation to `session_events`.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ToolRegistry                 │
//! │  get_context_capsule   get_model_details     │
//! │  get_lineage           search_models         │
//! │  refresh_index         (custom Rust tools)   │
//! └──────────────┬───────────────────────────────┘
//!                ▼
//!     POST /tools/{name}  ·  MCP tools/call
//! ```
//!
//! # Usage
//!
//! ```rust
//! use dbt_capsule::traits::ToolRegistry;
//!
//! let mut tools = ToolRegistry::with_builtins();
//! // tools.register(Box::new(MyTool::new()));
//! assert_eq!(tools.len(), 5);
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capsule::get_context_capsule;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::get::get_model_details;
use crate::search::search_models;
use crate::traversal::get_lineage;
use crate::usage::{record_event, SessionEvent};

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A tool that agents can discover and call.
///
/// Tools are registered at server startup and exposed via `GET /tools/list`
/// and MCP `tools/list` for discovery, and `POST /tools/{name}` or MCP
/// `tools/call` for invocation.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use serde_json::{json, Value};
/// use dbt_capsule::traits::{Tool, ToolContext};
///
/// pub struct ModelCountTool;
///
/// #[async_trait]
/// impl Tool for ModelCountTool {
///     fn name(&self) -> &str { "model_count" }
///     fn description(&self) -> &str { "Count indexed models" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({ "type": "object", "properties": {} })
///     }
///
///     async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
///         Ok(json!({ "models": ctx.engine().snapshot().models.len() }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores, used as the route path.
    fn name(&self) -> &str;

    /// One-line description for agent discovery.
    fn description(&self) -> &str;

    /// Built-in tools are marked with `"builtin": true` in `/tools/list`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema object describing the parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute with parameters already validated against the schema, with
    /// defaults injected.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Engine access for tool execution. Cheap to clone.
#[derive(Clone)]
pub struct ToolContext {
    engine: Arc<Engine>,
    timeout: Duration,
}

impl ToolContext {
    pub fn new(engine: Arc<Engine>) -> Self {
        let timeout = Duration::from_secs(engine.config().server.request_timeout_secs);
        Self { engine, timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Parameter validation
// ═══════════════════════════════════════════════════════════════════════

/// Check required fields, types and enums, and inject schema defaults for
/// absent optional fields.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let params_obj = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => bail!("parameters must be a JSON object, got {}", json_type_name(other)),
    };

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let required: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    for field in &required {
        if !params_obj.contains_key(*field) {
            bail!("missing required parameter: {}", field);
        }
    }

    let mut result = params_obj.clone();
    for (prop_name, prop_schema) in &properties {
        match params_obj.get(prop_name) {
            Some(Value::Null) => {
                result.remove(prop_name);
            }
            Some(value) => {
                if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
                    let type_ok = match expected {
                        "string" => value.is_string(),
                        "integer" => value.is_i64() || value.is_u64(),
                        "number" => value.is_number(),
                        "boolean" => value.is_boolean(),
                        "array" => value.is_array(),
                        "object" => value.is_object(),
                        _ => true,
                    };
                    if !type_ok {
                        bail!(
                            "parameter '{}' must be of type '{}', got {}",
                            prop_name,
                            expected,
                            json_type_name(value)
                        );
                    }
                }
                if let Some(allowed) = prop_schema.get("enum").and_then(|e| e.as_array()) {
                    if !allowed.contains(value) {
                        let names: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                        bail!(
                            "parameter '{}' must be one of [{}], got {}",
                            prop_name,
                            names.join(", "),
                            value
                        );
                    }
                }
            }
            None => {
                if let Some(default) = prop_schema.get("default") {
                    result.insert(prop_name.clone(), default.clone());
                }
            }
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tool Implementations
// ═══════════════════════════════════════════════════════════════════════

fn opt_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn opt_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Ranked, token-budgeted context for a task.
pub struct CapsuleTool;

#[async_trait]
impl Tool for CapsuleTool {
    fn name(&self) -> &str {
        "get_context_capsule"
    }

    fn description(&self) -> &str {
        "Minimal ranked, token-budgeted DAG context for a coding task"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string", "description": "Natural-language task description" },
                "focus_model": { "type": "string", "description": "Model to anchor on instead of searching" },
                "token_budget": { "type": "integer", "description": "Approximate token budget for the capsule" }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let capsule = get_context_capsule(
            ctx.engine(),
            opt_str(&params, "task").unwrap_or(""),
            opt_str(&params, "focus_model"),
            opt_i64(&params, "token_budget"),
        )?;
        Ok(serde_json::to_value(&capsule)?)
    }
}

/// Everything known about one model.
pub struct ModelDetailsTool;

#[async_trait]
impl Tool for ModelDetailsTool {
    fn name(&self) -> &str {
        "get_model_details"
    }

    fn description(&self) -> &str {
        "Full definition, columns, tests, neighbors and column lineage of a model"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "model_name": { "type": "string", "description": "Model name or unique id" }
            },
            "required": ["model_name"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let name = opt_str(&params, "model_name").unwrap_or("");
        let details = get_model_details(ctx.engine(), name).await?;
        Ok(serde_json::to_value(&details)?)
    }
}

/// Bounded upstream/downstream lineage.
pub struct LineageTool;

#[async_trait]
impl Tool for LineageTool {
    fn name(&self) -> &str {
        "get_lineage"
    }

    fn description(&self) -> &str {
        "Upstream and downstream nodes of a model within a depth bound"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "model_name": { "type": "string", "description": "Model name or unique id" },
                "direction": { "type": "string", "enum": ["upstream", "downstream", "both"], "default": "both" },
                "depth": { "type": "integer", "description": "Maximum hops in each direction" }
            },
            "required": ["model_name"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let engine = ctx.engine();
        let lineage = get_lineage(
            &engine.snapshot(),
            &engine.config().retrieval,
            opt_str(&params, "model_name").unwrap_or(""),
            opt_str(&params, "direction"),
            opt_i64(&params, "depth"),
        )?;
        Ok(serde_json::to_value(&lineage)?)
    }
}

/// Hybrid lexical + structural model search.
pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search_models"
    }

    fn description(&self) -> &str {
        "Rank models by text relevance and structural importance"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "limit": { "type": "integer", "description": "Max results" },
                "layer": { "type": "string", "enum": ["staging", "intermediate", "marts", "other"] }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let engine = ctx.engine();
        let hits = search_models(
            &engine.snapshot(),
            &engine.config().retrieval,
            opt_str(&params, "query").unwrap_or(""),
            opt_i64(&params, "limit"),
            opt_str(&params, "layer"),
        )?;
        Ok(json!({ "results": hits }))
    }
}

/// Re-read the configured records file.
pub struct RefreshIndexTool;

#[async_trait]
impl Tool for RefreshIndexTool {
    fn name(&self) -> &str {
        "refresh_index"
    }

    fn description(&self) -> &str {
        "Reindex from the configured records file (incremental unless full)"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "full": { "type": "boolean", "default": false }
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let engine = ctx.engine();
        let full = params.get("full").and_then(|v| v.as_bool()).unwrap_or(false);
        let path = engine.config().ingest.records_path.clone();
        let report = engine.reindex_path(&path, full).await?;
        Ok(serde_json::to_value(&report)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════

/// Structured failure returned to callers instead of an opaque error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolFailure {
    /// `bad_request`, `not_found`, `timeout` or `tool_error`.
    pub code: &'static str,
    pub message: String,
}

impl ToolFailure {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn classify_error(tool_name: &str, err: anyhow::Error) -> ToolFailure {
    let code = match err.downcast_ref::<EngineError>().map(|e| e.kind()) {
        Some("not_found") => "not_found",
        Some("validation") | Some("input") => "bad_request",
        _ => "tool_error",
    };
    ToolFailure::new(code, format!("{}: {}", tool_name, err))
}

fn session_event(tool_name: &str, params: &Value, outcome: &Result<Value, ToolFailure>) -> SessionEvent {
    let mut event = SessionEvent {
        tool_name: tool_name.to_string(),
        task_text: opt_str(params, "task").map(String::from),
        focus_model: opt_str(params, "focus_model")
            .or_else(|| opt_str(params, "model_name"))
            .map(String::from),
        status: "ok".to_string(),
        payload: params.clone(),
        ..Default::default()
    };
    match outcome {
        Ok(result) => {
            event.intent = opt_str(result, "intent").map(String::from);
            event.pivot_count = result.pointer("/summary/pivot_count").and_then(|v| v.as_i64());
            event.token_estimate = result
                .pointer("/summary/token_estimate")
                .and_then(|v| v.as_i64());
        }
        Err(failure) => event.status = failure.code.to_string(),
    }
    event
}

/// Reserved call parameter overriding the context's timeout for one call.
pub const TIMEOUT_PARAM: &str = "timeout_ms";

/// Remove [`TIMEOUT_PARAM`] from `params` and resolve the effective timeout.
fn split_timeout(params: &Value, default: Duration) -> Result<(Value, Duration), ToolFailure> {
    let Some(obj) = params.as_object() else {
        return Ok((params.clone(), default));
    };
    let mut rest = obj.clone();
    let timeout = match rest.remove(TIMEOUT_PARAM) {
        None | Some(Value::Null) => default,
        Some(value) => match value.as_u64() {
            Some(ms) if ms > 0 => Duration::from_millis(ms),
            _ => {
                return Err(ToolFailure::new(
                    "bad_request",
                    format!("{} must be a positive integer, got {}", TIMEOUT_PARAM, value),
                ))
            }
        },
    };
    Ok((Value::Object(rest), timeout))
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry for built-in and custom tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Create a tool registry pre-loaded with the five query tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(CapsuleTool));
        registry.register(Box::new(ModelDetailsTool));
        registry.register(Box::new(LineageTool));
        registry.register(Box::new(SearchTool));
        registry.register(Box::new(RefreshIndexTool));
        registry
    }

    /// Register a tool. Lookup returns the first tool with a matching name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn into_tools(self) -> Vec<Box<dyn Tool>> {
        self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Validate, execute under the context's timeout, and record the call.
    pub async fn call(&self, name: &str, params: Value, ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let started = Instant::now();
        let outcome = self.dispatch(name, &params, ctx).await;

        let mut event = session_event(name, &params, &outcome);
        event.duration_ms = started.elapsed().as_millis() as i64;
        match &outcome {
            Ok(_) => tracing::info!(tool = name, duration_ms = event.duration_ms, "tool call"),
            Err(f) => tracing::warn!(
                tool = name,
                code = f.code,
                duration_ms = event.duration_ms,
                "{}",
                f.message
            ),
        }
        if let Err(e) = record_event(ctx.engine().pool(), &event).await {
            tracing::warn!(tool = name, "failed to record session event: {}", e);
        }

        outcome
    }

    async fn dispatch(&self, name: &str, params: &Value, ctx: &ToolContext) -> Result<Value, ToolFailure> {
        let tool = self
            .find(name)
            .ok_or_else(|| ToolFailure::new("not_found", format!("no tool registered with name: {}", name)))?;

        let (params, timeout) = split_timeout(params, ctx.timeout)?;
        let params = validate_params(&tool.parameters_schema(), &params)
            .map_err(|e| ToolFailure::new("bad_request", e.to_string()))?;

        match tokio::time::timeout(timeout, tool.execute(params, ctx)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify_error(name, e)),
            Err(_) => Err(ToolFailure::new(
                "timeout",
                format!("{}: timed out after {}ms", name, timeout.as_millis()),
            )),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
