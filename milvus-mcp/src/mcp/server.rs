//! MCP server implementation
//!
//! Implements the stdio transport for the Model Context Protocol: one JSON-RPC
//! message per line in, one response per line out.

use super::protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ServerInfo,
    MCP_PROTOCOL_VERSION,
};
use super::registry::{Dispatcher, ToolContext, ToolInvocation};
use super::tools::default_registry;
use crate::backend::{self, Backend};
use crate::config::{Limits, ServerConfig};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// MCP server exposing Milvus operations as tools
pub struct McpServer {
    dispatcher: Dispatcher,
}

impl McpServer {
    /// Validate the configuration, connect to the backend and build the tool catalog
    pub async fn new(config: &ServerConfig) -> crate::Result<Self> {
        config.validate()?;
        tracing::debug!("Connecting with {:?}", config.connection);
        let backend = backend::connect(&config.connection).await?;
        Self::with_backend(backend, config.limits)
    }

    /// Create a server over an existing backend
    pub fn with_backend(backend: Arc<dyn Backend>, limits: Limits) -> crate::Result<Self> {
        let registry = default_registry()?;
        tracing::info!(
            "Registered {} tools on the {} backend",
            registry.len(),
            backend.name()
        );
        Ok(Self {
            dispatcher: Dispatcher::new(registry, ToolContext::new(backend, limits)),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run the MCP server on stdio until EOF
    pub async fn run(&self) -> crate::Result<()> {
        let reader = BufReader::new(tokio::io::stdin());
        let writer = tokio::io::stdout();
        self.run_with(reader, writer).await
    }

    /// Serve requests from `reader`, writing responses to `writer`
    ///
    /// Requests are handled one at a time in arrival order.
    pub async fn run_with<R, W>(&self, mut reader: R, mut writer: W) -> crate::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        tracing::info!("Milvus MCP server started (protocol version {})", MCP_PROTOCOL_VERSION);

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tracing::info!("EOF received, shutting down");
                    break;
                }
                Ok(_) => {
                    let message = line.trim();
                    if message.is_empty() {
                        continue;
                    }
                    tracing::debug!("Received: {}", message);

                    if let Some(response) = self.handle_message(message).await {
                        let response_json = serde_json::to_string(&response)?;
                        writer.write_all(response_json.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                        writer.flush().await?;
                        tracing::debug!("Sent: {}", response_json);
                    }
                }
                Err(e) => {
                    tracing::error!("Read error: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Decode one line and handle it; `None` means nothing is sent back
    pub async fn handle_message(&self, message: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(message) {
            Ok(value) => value,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    None,
                    JsonRpcError::parse_error(format!("Parse error: {}", e)),
                ));
            }
        };

        let id = value.get("id").cloned().filter(|id| !id.is_null());
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => Some(JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request(format!("Invalid request: {}", e)),
            )),
        }
    }

    /// Handle a single JSON-RPC request
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            tracing::debug!("Notification: {}", request.method);
            return None;
        }

        let result = match request.method.as_str() {
            "initialize" => Ok(self.handle_initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.handle_tools_list()),
            "tools/call" => self.handle_tools_call(&request).await,
            _ => Err(JsonRpcError::method_not_found(&request.method)),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(error) => JsonRpcResponse::error(request.id, error),
        })
    }

    fn handle_initialize(&self) -> Value {
        json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": ServerCapabilities::default(),
            "serverInfo": ServerInfo::default()
        })
    }

    fn handle_tools_list(&self) -> Value {
        json!({ "tools": self.dispatcher.registry().definitions() })
    }

    async fn handle_tools_call(
        &self,
        request: &JsonRpcRequest,
    ) -> std::result::Result<Value, JsonRpcError> {
        let params = request
            .params
            .as_ref()
            .ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;

        let tool_name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| JsonRpcError::invalid_params("Missing tool name"))?;

        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(arguments)) => arguments.clone(),
            Some(_) => return Err(JsonRpcError::invalid_params("Tool arguments must be an object")),
        };

        let invocation =
            ToolInvocation::new(tool_name, arguments).with_call_id(request.id.clone());
        let result = self.dispatcher.dispatch(invocation).await;

        serde_json::to_value(result.to_call_result())
            .map_err(|e| JsonRpcError::internal_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn server() -> McpServer {
        let backend: Arc<dyn Backend> = Arc::new(Store::open_memory().unwrap());
        McpServer::with_backend(backend, Limits::default()).unwrap()
    }

    fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialize() {
        let response = server()
            .handle_request(request(1, "initialize", json!({})))
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "milvus");
        assert_eq!(result["serverInfo"]["version"], crate::VERSION);
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_tools_list() {
        let response = server()
            .handle_request(request(2, "tools/list", json!({})))
            .await
            .unwrap();

        let result = response.result.unwrap();
        let tools = result["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 19);
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == "object"));
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let server = server();
        let response = server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_parse_error() {
        let response = server().handle_message("{not json").await.unwrap();
        assert_eq!(response.error.unwrap().code, -32700);
        assert!(response.id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let response = server()
            .handle_request(request(3, "resources/list", json!({})))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_tools_call_missing_name() {
        let response = server()
            .handle_request(request(4, "tools/call", json!({"arguments": {}})))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_tool_error_is_a_result() {
        let response = server()
            .handle_request(request(
                5,
                "tools/call",
                json!({"name": "get_collection_info", "arguments": {"collection_name": "missing"}}),
            ))
            .await
            .unwrap();

        let result = response.result.unwrap();
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().unwrap();
        let envelope: Value = serde_json::from_str(text).unwrap();
        assert_eq!(envelope["error"]["kind"], "backend");
    }

    #[tokio::test]
    async fn test_run_with_session() {
        let input = [
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"list_collections"}}"#,
        ]
        .join("\n");

        let mut output = Vec::new();
        server()
            .run_with(input.as_bytes(), &mut output)
            .await
            .unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[1]["id"], 2);
        assert_eq!(lines[1]["result"]["isError"], false);
    }
}
