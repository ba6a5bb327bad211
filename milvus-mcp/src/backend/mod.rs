//! Backend client adapters
//!
//! [`Backend`] is the only surface the tools talk to. Two implementations
//! exist: [`RestBackend`] for a Milvus server (RESTful API v2) and the local
//! SQLite [`Store`](crate::store::Store).

mod rest;

pub use rest::RestBackend;

use crate::collection::{
    CollectionInfo, CollectionStats, CreateCollectionRequest, IndexInfo, IndexSpec, LoadProgress,
};
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::search::{
    Hit, HybridSearchRequest, QueryRequest, Row, SearchRequest, TextSearchRequest,
};
use crate::store::Store;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Outcome of an insert or upsert call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationResult {
    /// Rows written
    pub count: u64,
    /// Primary keys of the written rows, when the backend reports them
    pub ids: Vec<Value>,
}

/// Operations the tool layer needs from a vector database
///
/// Implementations own their retry and timeout policy. Calls are independent;
/// a backend must be safe to share between concurrent invocations.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Short name for logs
    fn name(&self) -> &'static str;

    // -------------------------------------------------------------------------
    // Collections
    // -------------------------------------------------------------------------

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self.list_collections().await?.iter().any(|c| c == name))
    }

    async fn describe_collection(&self, name: &str) -> Result<CollectionInfo>;

    /// Create a collection and build the requested indexes
    async fn create_collection(&self, request: &CreateCollectionRequest) -> Result<()>;

    async fn load_collection(&self, name: &str, replicas: u32) -> Result<()>;

    async fn release_collection(&self, name: &str) -> Result<()>;

    async fn load_state(&self, name: &str) -> Result<LoadProgress>;

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats>;

    // -------------------------------------------------------------------------
    // Entities
    // -------------------------------------------------------------------------

    async fn insert(&self, collection: &str, rows: Vec<Row>) -> Result<MutationResult>;

    async fn upsert(&self, collection: &str, rows: Vec<Row>) -> Result<MutationResult>;

    /// Delete rows matching a filter, returning how many were removed
    /// when the backend can tell
    async fn delete(&self, collection: &str, filter: &str) -> Result<Option<u64>>;

    async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>>;

    async fn count(&self, collection: &str, filter: Option<&str>) -> Result<u64>;

    // -------------------------------------------------------------------------
    // Search
    // -------------------------------------------------------------------------

    /// Dense search; one hit list per query vector, in input order
    async fn search(&self, request: &SearchRequest) -> Result<Vec<Vec<Hit>>>;

    async fn text_search(&self, request: &TextSearchRequest) -> Result<Vec<Hit>>;

    /// Dense + sparse search fused by the backend
    async fn hybrid_search(&self, request: &HybridSearchRequest) -> Result<Vec<Hit>>;

    // -------------------------------------------------------------------------
    // Indexes
    // -------------------------------------------------------------------------

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<()>;

    async fn describe_indexes(
        &self,
        collection: &str,
        field: Option<&str>,
    ) -> Result<Vec<IndexInfo>>;
}

/// Connect to the backend named by the configured URI
///
/// `http(s)://` URIs go to a Milvus server, `:memory:` opens an in-memory
/// local store, anything else is treated as a local database file.
pub async fn connect(config: &ConnectionConfig) -> Result<Arc<dyn Backend>> {
    if config.is_remote() {
        tracing::info!("Connecting to Milvus at {}", config.uri);
        let backend = RestBackend::connect(config).await?;
        Ok(Arc::new(backend))
    } else if config.uri == ":memory:" {
        tracing::info!("Opening in-memory local store");
        Ok(Arc::new(Store::open_memory()?))
    } else {
        tracing::info!("Opening local store at {}", config.uri);
        Ok(Arc::new(Store::open(&config.uri)?))
    }
}
