//! # Milvus MCP
//!
//! Exposes vector database operations to AI agents as MCP tools.
//!
//! The crate provides:
//! - **Tool registry** with per-tool parameter validation
//! - **Query builder** for filter queries, dense, multi-vector, BM25 and hybrid search
//! - **Batch coordinator** that writes large inserts in ordered chunks and
//!   reports partial failures
//! - **Backends**: a Milvus server over its REST API, or a local SQLite store
//!   with FTS5 for development and tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use milvus_mcp::{ConnectionConfig, McpServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> milvus_mcp::Result<()> {
//!     let config = ServerConfig {
//!         connection: ConnectionConfig::new("http://localhost:19530"),
//!         ..Default::default()
//!     };
//!     McpServer::new(&config).await?.run().await
//! }
//! ```

pub mod backend;
pub mod batch;
pub mod collection;
pub mod config;
pub mod error;
pub mod mcp;
pub mod search;
pub mod store;

// Re-exports for convenience
pub use backend::{Backend, MutationResult, RestBackend};
pub use batch::{BatchCoordinator, BatchReport, MutationBatch, MutationKind};
pub use collection::{CollectionInfo, CollectionSchema, CreateCollectionRequest, IndexSpec};
pub use config::{ConnectionConfig, Limits, ServerConfig};
pub use error::{Error, ErrorKind, Result};
pub use mcp::McpServer;
pub use search::{Hit, Metric, QueryBuilder, Ranker, Row};
pub use store::Store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
