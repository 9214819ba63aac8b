//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] into an MCP Streamable HTTP endpoint that
//! agent hosts can connect to using the standard JSON-RPC protocol. Tool
//! calls go through [`ToolRegistry::call`], so validation, timeouts and the
//! session log behave exactly as on `POST /tools/{name}`.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};

use crate::engine::Engine;
use crate::traits::{ToolContext, ToolRegistry};

/// Each MCP session receives a clone of this struct; everything is behind
/// `Arc`, so all sessions share one engine and one tool set.
#[derive(Clone)]
pub struct McpBridge {
    engine: Arc<Engine>,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(engine: Arc<Engine>, tools: Arc<ToolRegistry>) -> Self {
        Self { engine, tools }
    }

    /// Convert a registry tool into an rmcp `Tool` descriptor.
    fn to_mcp_tool(tool: &dyn crate::traits::Tool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> =
            match tool.parameters_schema() {
                serde_json::Value::Object(map) => Arc::new(map),
                _ => Arc::new(serde_json::Map::new()),
            };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(tool.name() != "refresh_index")),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "dbt-capsule".to_string(),
                title: Some("dbt capsule".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Context engine for a dbt project. Call get_context_capsule with the task \
                 you are working on to receive the relevant models, ranked and trimmed to a \
                 token budget. Use search_models, get_lineage and get_model_details to dig \
                 further, and refresh_index after the project is recompiled."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if self.tools.find(&request.name).is_none() {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            ));
        }

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        let ctx = ToolContext::new(self.engine.clone());
        match self.tools.call(&request.name, params, &ctx).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(failure) => {
                let text = serde_json::to_string(&serde_json::json!({ "error": failure }))
                    .unwrap_or_default();
                Ok(CallToolResult::error(vec![Content::text(text)]))
            }
        }
    }
}
