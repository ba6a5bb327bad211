//! MCP (Model Context Protocol) server for Milvus
//!
//! Exposes vector database operations as MCP tools over the stdio transport.
//!
//! ## Layers
//!
//! - [`registry`] - tool table and dispatcher
//! - [`validate`] - argument checking against each tool's parameter list
//! - [`tools`] - the tool catalog and handlers
//! - [`format`] - uniform result envelope
//! - `server` - JSON-RPC loop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use milvus_mcp::{McpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = McpServer::new(&ServerConfig::default()).await.unwrap();
//!     server.run().await.unwrap();
//! }
//! ```

pub mod format;
mod protocol;
pub mod registry;
mod server;
pub mod tools;
pub mod validate;

pub use format::{Output, ToolError, ToolResult};
pub use protocol::{
    CallToolResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ToolDefinition,
    MCP_PROTOCOL_VERSION,
};
pub use registry::{Dispatcher, ParamSpec, ParamType, ToolContext, ToolInvocation, ToolRegistry, ToolSpec};
pub use server::McpServer;
pub use tools::default_registry;
pub use validate::Args;
