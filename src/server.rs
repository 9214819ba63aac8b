//! HTTP tool server.
//!
//! Exposes the tool registry over a JSON HTTP API and, on the same port, an
//! MCP Streamable HTTP endpoint for agent hosts that speak JSON-RPC.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | List all registered tools with schemas |
//! | `POST` | `/tools/{name}` | Call any registered tool by name |
//! | `GET`  | `/health` | Health check (version and snapshot generation) |
//! | `*`    | `/mcp` | MCP Streamable HTTP transport |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid depth: must be >= 0, got -1" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `tool_error` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients and cross-origin tool calls.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, tower::StreamableHttpService,
};
use rmcp::transport::StreamableHttpServerConfig;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::Engine;
use crate::mcp::McpBridge;
use crate::traits::{ToolContext, ToolFailure, ToolRegistry};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    tools: Arc<ToolRegistry>,
}

/// Starts the tool server with the built-in tools.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_with_extensions(config, ToolRegistry::new()).await
}

/// Like [`run_server`], but also serves the tools in `extra_tools`.
///
/// ```rust,no_run
/// use dbt_capsule::server::run_server_with_extensions;
/// use dbt_capsule::traits::ToolRegistry;
///
/// # async fn example(config: &dbt_capsule::config::Config) -> anyhow::Result<()> {
/// let mut tools = ToolRegistry::new();
/// // tools.register(Box::new(MyTool::new()));
/// run_server_with_extensions(config, tools).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_server_with_extensions(
    config: &Config,
    extra_tools: ToolRegistry,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let engine = Arc::new(Engine::open(config.clone()).await?);

    let mut registry = ToolRegistry::with_builtins();
    for tool in extra_tools.into_tools() {
        registry.register(tool);
    }
    let tools = Arc::new(registry);

    for t in tools.tools() {
        let tag = if t.is_builtin() { "builtin" } else { "rust" };
        tracing::info!(tool = t.name(), kind = tag, "registered tool");
    }

    let app = router(engine.clone(), tools);

    tracing::info!(
        bind = %bind_addr,
        generation = engine.snapshot().generation,
        models = engine.snapshot().models.len(),
        "tool server listening"
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    engine.close().await;
    Ok(())
}

/// Build the router for an opened engine and a tool registry.
pub fn router(engine: Arc<Engine>, tools: Arc<ToolRegistry>) -> Router {
    let bridge = McpBridge::new(engine.clone(), tools.clone());
    let mcp_service = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/health", get(handle_health))
        .with_state(AppState { engine, tools })
        .nest_service("/mcp", mcp_service)
        .layer(cors)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ToolFailure,
}

/// Converts a structured tool failure into an HTTP response.
struct AppError(ToolFailure);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.code {
            "bad_request" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "timeout" => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.0 })).into_response()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    generation: i64,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        generation: state.engine.snapshot().generation,
    })
}

// ============ GET /tools/list ============

/// Serializable tool info for the `/tools/list` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    let tools = state
        .tools
        .tools()
        .iter()
        .map(|t| ToolInfo {
            name: t.name().to_string(),
            description: t.description().to_string(),
            builtin: t.is_builtin(),
            parameters: t.parameters_schema(),
        })
        .collect();
    Json(ToolListResponse { tools })
}

// ============ POST /tools/{name} ============

/// Unified tool dispatch through [`ToolRegistry::call`].
async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctx = ToolContext::new(state.engine.clone());
    let result = state
        .tools
        .call(&name, params, &ctx)
        .await
        .map_err(AppError)?;

    Ok(Json(serde_json::json!({ "result": result })))
}
