//! Milvus tool catalog
//!
//! Declares every tool exposed over MCP together with its handler. Handlers
//! receive validated [`Args`], build typed requests and call the backend.

use super::format::Output;
use super::registry::{ParamSpec, ParamType, ToolContext, ToolRegistry, ToolSpec};
use super::validate::Args;
use crate::batch::{BatchCoordinator, MutationBatch, MutationKind};
use crate::collection::{CreateCollectionRequest, IndexSpec, DEFAULT_INDEX_TYPE};
use crate::error::{Error, Result};
use crate::search::{HybridOptions, Ranker, SearchOptions, DEFAULT_RRF_K};
use futures::future::BoxFuture;
use serde_json::{json, Map};

/// Build the registry of all Milvus tools
pub fn default_registry() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    // Collections
    registry.register(
        ToolSpec::new("list_collections", "List all collections in the database.", vec![]),
        list_collections,
    )?;
    registry.register(
        ToolSpec::new(
            "create_collection",
            "Create a collection. Pass either a full schema with a `fields` list, or quick-setup \
             keys (dimension, primary_field, id_type, vector_field, metric_type, text_field, \
             sparse_field, other_fields, auto_id, enable_dynamic_field). Setting text_field adds \
             a BM25 sparse field for text and hybrid search.",
            vec![
                collection_param(),
                ParamSpec::optional("schema", ParamType::Mapping, "Collection schema")
                    .default(json!({}))
                    .aliases(&["collection_schema"]),
                ParamSpec::optional(
                    "index_params",
                    ParamType::Mapping,
                    "Index to build on creation: field_name, index_type, metric_type, params",
                ),
            ],
        ),
        create_collection,
    )?;
    registry.register(
        ToolSpec::new(
            "get_collection_info",
            "Describe a collection: fields, functions, load state and indexes.",
            vec![collection_param()],
        ),
        get_collection_info,
    )?;
    registry.register(
        ToolSpec::new(
            "get_collection_stats",
            "Get collection statistics such as the row count.",
            vec![collection_param()],
        ),
        get_collection_stats,
    )?;
    registry.register(
        ToolSpec::new(
            "get_load_state",
            "Get the load state and loading progress of a collection.",
            vec![collection_param()],
        ),
        get_load_state,
    )?;
    registry.register(
        ToolSpec::new(
            "load_collection",
            "Load a collection into memory so it can be searched.",
            vec![
                collection_param(),
                ParamSpec::optional("replica_number", ParamType::Integer, "Number of replicas")
                    .default(json!(1)),
            ],
        ),
        load_collection,
    )?;
    registry.register(
        ToolSpec::new(
            "release_collection",
            "Release a collection from memory.",
            vec![collection_param()],
        ),
        release_collection,
    )?;

    // Mutations
    registry.register(
        ToolSpec::new(
            "insert_data",
            "Insert rows. `data` maps field names to equal-length value lists, or is a list of row objects.",
            vec![collection_param(), data_param()],
        ),
        insert_data,
    )?;
    registry.register(
        ToolSpec::new(
            "upsert_data",
            "Insert rows, replacing existing rows with the same primary key.",
            vec![collection_param(), data_param()],
        ),
        upsert_data,
    )?;
    registry.register(
        ToolSpec::new(
            "bulk_insert",
            "Insert a large data set in sequential batches. Reports committed rows per batch.",
            vec![
                collection_param(),
                data_param(),
                ParamSpec::optional("batch_size", ParamType::Integer, "Rows per batch")
                    .default(json!(1000))
                    .aliases(&["chunk_size"]),
            ],
        ),
        bulk_insert,
    )?;
    registry.register(
        ToolSpec::new(
            "delete_entities",
            "Delete rows matching a filter expression.",
            vec![collection_param(), filter_param(true)],
        ),
        delete_entities,
    )?;

    // Queries
    registry.register(
        ToolSpec::new(
            "query",
            "Query rows with a filter expression, e.g. `age > 20 and color in [\"red\"]`.",
            vec![
                collection_param(),
                filter_param(true),
                output_fields_param(),
                limit_param(10),
            ],
        ),
        query,
    )?;
    registry.register(
        ToolSpec::new(
            "count",
            "Count rows, optionally restricted by a filter expression.",
            vec![collection_param(), filter_param(false)],
        ),
        count,
    )?;

    // Search
    registry.register(
        ToolSpec::new(
            "vector_search",
            "Similarity search with one query vector.",
            [
                vec![
                    collection_param(),
                    ParamSpec::required("vector", ParamType::Vector, "Query vector")
                        .aliases(&["query_vector", "data"]),
                ],
                dense_params(),
            ]
            .concat(),
        ),
        vector_search,
    )?;
    registry.register(
        ToolSpec::new(
            "multi_vector_search",
            "Similarity search with several query vectors; returns one result list per vector, in order.",
            [
                vec![
                    collection_param(),
                    ParamSpec::required("vectors", ParamType::VectorList, "Query vectors")
                        .aliases(&["query_vectors", "data"]),
                ],
                dense_params(),
            ]
            .concat(),
        ),
        multi_vector_search,
    )?;
    registry.register(
        ToolSpec::new(
            "hybrid_search",
            "Combine dense vector search with BM25 full-text search and fuse the rankings \
             (rrf or weighted). The collection needs a BM25 sparse field.",
            vec![
                collection_param(),
                query_text_param(),
                ParamSpec::required("vector", ParamType::Vector, "Query vector")
                    .aliases(&["query_vector"]),
                ParamSpec::optional("vector_field", ParamType::String, "Dense vector field")
                    .default(json!("vector")),
                sparse_field_param(),
                limit_param(5),
                metric_param(),
                filter_param(false),
                output_fields_param(),
                drop_ratio_param(),
                ParamSpec::optional("ranker", ParamType::String, "Fusion strategy: rrf or weighted")
                    .default(json!("rrf")),
                ParamSpec::optional("rrf_k", ParamType::Integer, "RRF smoothing constant")
                    .default(json!(DEFAULT_RRF_K))
                    .aliases(&["k"]),
                ParamSpec::optional(
                    "weights",
                    ParamType::Vector,
                    "Weights [dense, sparse] for the weighted ranker",
                ),
            ],
        ),
        hybrid_search,
    )?;
    registry.register(
        ToolSpec::new(
            "text_search",
            "BM25 full-text search. The collection needs a BM25 sparse field.",
            vec![
                collection_param(),
                query_text_param(),
                sparse_field_param().aliases(&["anns_field"]),
                limit_param(5),
                drop_ratio_param(),
                filter_param(false),
                output_fields_param(),
            ],
        ),
        text_search,
    )?;

    // Indexes
    registry.register(
        ToolSpec::new(
            "create_index",
            "Build an index on a field.",
            vec![
                collection_param(),
                ParamSpec::required("field_name", ParamType::String, "Field to index"),
                ParamSpec::optional("index_type", ParamType::String, "Index type")
                    .default(json!(DEFAULT_INDEX_TYPE)),
                metric_param(),
                ParamSpec::optional(
                    "params",
                    ParamType::Mapping,
                    "Index build parameters (default depends on index type, e.g. nlist 1024)",
                ),
                ParamSpec::optional("index_name", ParamType::String, "Index name"),
            ],
        ),
        create_index,
    )?;
    registry.register(
        ToolSpec::new(
            "get_index_info",
            "Describe the indexes of a collection.",
            vec![
                collection_param(),
                ParamSpec::optional("field_name", ParamType::String, "Only this field"),
            ],
        ),
        get_index_info,
    )?;

    Ok(registry)
}

// ============================================================================
// Shared parameters
// ============================================================================

fn collection_param() -> ParamSpec {
    ParamSpec::required("collection_name", ParamType::String, "Name of the collection")
        .aliases(&["collection"])
}

fn data_param() -> ParamSpec {
    ParamSpec::required("data", ParamType::Data, "Rows to write")
}

fn filter_param(required: bool) -> ParamSpec {
    let description = "Filter expression, e.g. `id in [1, 2]`";
    let param = if required {
        ParamSpec::required("filter_expr", ParamType::String, description)
    } else {
        ParamSpec::optional("filter_expr", ParamType::String, description)
    };
    param.aliases(&["filter", "expr"])
}

fn output_fields_param() -> ParamSpec {
    ParamSpec::optional(
        "output_fields",
        ParamType::StringList,
        "Fields to return (default: all)",
    )
}

fn limit_param(default: usize) -> ParamSpec {
    ParamSpec::optional("limit", ParamType::Limit, "Maximum number of results")
        .default(json!(default))
        .aliases(&["top_k"])
}

fn metric_param() -> ParamSpec {
    ParamSpec::optional("metric_type", ParamType::String, "COSINE, L2 or IP")
        .default(json!("COSINE"))
        .aliases(&["metric"])
}

fn query_text_param() -> ParamSpec {
    ParamSpec::required("query_text", ParamType::String, "Search text").aliases(&["text", "query"])
}

fn sparse_field_param() -> ParamSpec {
    ParamSpec::optional("sparse_field", ParamType::String, "BM25 sparse vector field")
        .default(json!("sparse"))
}

fn drop_ratio_param() -> ParamSpec {
    ParamSpec::optional(
        "drop_ratio",
        ParamType::Number,
        "Fraction of low-importance query terms to ignore, in [0, 1)",
    )
    .default(json!(0.2))
}

fn dense_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::optional("vector_field", ParamType::String, "Vector field to search")
            .default(json!("vector"))
            .aliases(&["anns_field"]),
        limit_param(5),
        metric_param(),
        filter_param(false),
        output_fields_param(),
        ParamSpec::optional("search_params", ParamType::Mapping, "Index search parameters")
            .aliases(&["params"]),
    ]
}

fn search_options(args: &Args) -> Result<SearchOptions> {
    Ok(SearchOptions {
        anns_field: args.str("vector_field")?.to_string(),
        metric: args.str("metric_type")?.parse()?,
        limit: args.usize("limit")?,
        filter: args.opt_str("filter_expr").map(str::to_string),
        output_fields: args.strings("output_fields"),
        params: args.mapping("search_params").cloned(),
    })
}

fn positive(args: &Args, name: &str) -> Result<i64> {
    let value = args.i64(name)?;
    if value < 1 {
        return Err(Error::validation(name, "must be at least 1"));
    }
    Ok(value)
}

// ============================================================================
// Collections
// ============================================================================

fn list_collections(ctx: &ToolContext, _args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move { Ok(Output::Collections(ctx.backend.list_collections().await?)) })
}

fn create_collection(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let name = args.str("collection_name")?;
        let empty = Map::new();
        let schema = args.mapping("schema").unwrap_or(&empty);
        let request = CreateCollectionRequest::from_args(name, schema, args.mapping("index_params"))?;

        ctx.backend.create_collection(&request).await?;
        tracing::info!(
            "Created collection '{}' with {} field(s) and {} index(es)",
            request.name,
            request.schema.fields.len(),
            request.indexes.len()
        );
        Ok(Output::Ack(format!("Collection '{}' created", request.name)))
    })
}

fn get_collection_info(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let info = ctx
            .backend
            .describe_collection(args.str("collection_name")?)
            .await?;
        Ok(Output::Collection(info))
    })
}

fn get_collection_stats(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let stats = ctx
            .backend
            .collection_stats(args.str("collection_name")?)
            .await?;
        Ok(Output::Stats(stats))
    })
}

fn get_load_state(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let progress = ctx.backend.load_state(args.str("collection_name")?).await?;
        Ok(Output::LoadState(progress))
    })
}

fn load_collection(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let name = args.str("collection_name")?;
        let replicas = u32::try_from(positive(&args, "replica_number")?)
            .map_err(|_| Error::validation("replica_number", "too many replicas"))?;
        ctx.backend.load_collection(name, replicas).await?;
        Ok(Output::Ack(format!("Collection '{}' loaded", name)))
    })
}

fn release_collection(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let name = args.str("collection_name")?;
        ctx.backend.release_collection(name).await?;
        Ok(Output::Ack(format!("Collection '{}' released", name)))
    })
}

// ============================================================================
// Mutations
// ============================================================================

async fn write(ctx: &ToolContext, args: &Args, kind: MutationKind, chunk_size: usize) -> Result<Output> {
    let collection = args.str("collection_name")?;
    let data = args
        .value("data")
        .ok_or_else(|| Error::validation("data", "missing required parameter"))?;
    let batch = MutationBatch::from_value(collection, data)?;
    let report = BatchCoordinator::new(ctx.backend.as_ref(), chunk_size)
        .apply(kind, &batch)
        .await?;
    Ok(Output::Mutation(report))
}

fn insert_data(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move { write(ctx, &args, MutationKind::Insert, ctx.limits.batch_size).await })
}

fn upsert_data(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move { write(ctx, &args, MutationKind::Upsert, ctx.limits.batch_size).await })
}

fn bulk_insert(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let chunk_size = usize::try_from(positive(&args, "batch_size")?)
            .map_err(|_| Error::validation("batch_size", "batch size is too large"))?;
        write(ctx, &args, MutationKind::Insert, chunk_size).await
    })
}

fn delete_entities(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let collection = args.str("collection_name")?;
        let filter = args.str("filter_expr")?;
        if filter.trim().is_empty() {
            return Err(Error::validation(
                "filter_expr",
                "filter expression must not be empty",
            ));
        }
        let deleted = ctx.backend.delete(collection, filter).await?;
        tracing::info!("Deleted {:?} row(s) from '{}'", deleted, collection);
        Ok(Output::Deleted(deleted))
    })
}

// ============================================================================
// Queries
// ============================================================================

fn query(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let request = ctx.builder.query(
            args.str("collection_name")?,
            args.str("filter_expr")?,
            args.strings("output_fields"),
            args.usize("limit")?,
        );
        Ok(Output::Rows(ctx.backend.query(&request).await?))
    })
}

fn count(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let filter = args.opt_str("filter_expr").filter(|f| !f.trim().is_empty());
        let total = ctx
            .backend
            .count(args.str("collection_name")?, filter)
            .await?;
        Ok(Output::Count(total))
    })
}

// ============================================================================
// Search
// ============================================================================

fn vector_search(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let request = ctx.builder.search(
            args.str("collection_name")?,
            args.vector("vector")?,
            search_options(&args)?,
        )?;
        let groups = ctx.backend.search(&request).await?;
        Ok(Output::Hits(groups.into_iter().next().unwrap_or_default()))
    })
}

fn multi_vector_search(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let request = ctx.builder.multi_search(
            args.str("collection_name")?,
            args.vectors("vectors")?,
            search_options(&args)?,
        )?;
        Ok(Output::HitGroups(ctx.backend.search(&request).await?))
    })
}

fn hybrid_search(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let weights = args.numbers("weights");
        let ranker = Ranker::from_args(
            args.str("ranker")?,
            args.opt_i64("rrf_k"),
            weights.as_deref(),
        )?;
        let options = HybridOptions {
            vector_field: args.str("vector_field")?.to_string(),
            sparse_field: args.str("sparse_field")?.to_string(),
            metric: args.str("metric_type")?.parse()?,
            limit: args.usize("limit")?,
            filter: args.opt_str("filter_expr").map(str::to_string),
            output_fields: args.strings("output_fields"),
            drop_ratio: args.f64("drop_ratio")?,
            ranker,
        };

        let info = ctx
            .backend
            .describe_collection(args.str("collection_name")?)
            .await?;
        let request = ctx.builder.hybrid_search(
            &info,
            args.str("query_text")?,
            args.vector("vector")?,
            options,
        )?;
        Ok(Output::Hits(ctx.backend.hybrid_search(&request).await?))
    })
}

fn text_search(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let info = ctx
            .backend
            .describe_collection(args.str("collection_name")?)
            .await?;
        let request = ctx.builder.text_search(
            &info,
            args.str("query_text")?,
            args.str("sparse_field")?,
            args.usize("limit")?,
            args.f64("drop_ratio")?,
            args.opt_str("filter_expr").map(str::to_string),
            args.strings("output_fields"),
        )?;
        Ok(Output::Hits(ctx.backend.text_search(&request).await?))
    })
}

// ============================================================================
// Indexes
// ============================================================================

fn create_index(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let collection = args.str("collection_name")?;
        let index = IndexSpec::from_args(
            args.str("field_name")?,
            args.opt_str("index_name"),
            args.opt_str("index_type"),
            args.opt_str("metric_type"),
            args.mapping("params"),
        )?;
        ctx.backend.create_index(collection, &index).await?;
        Ok(Output::Ack(format!(
            "Index '{}' ({}, {}) created on '{}.{}'",
            index.index_name, index.index_type, index.metric_type, collection, index.field_name
        )))
    })
}

fn get_index_info(ctx: &ToolContext, args: Args) -> BoxFuture<'_, Result<Output>> {
    Box::pin(async move {
        let indexes = ctx
            .backend
            .describe_indexes(args.str("collection_name")?, args.opt_str("field_name"))
            .await?;
        Ok(Output::Indexes(indexes))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::Limits;
    use crate::error::ErrorKind;
    use crate::mcp::format::ToolResult;
    use crate::mcp::registry::{Dispatcher, ToolInvocation};
    use crate::store::Store;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn dispatcher() -> Dispatcher {
        let backend: Arc<dyn Backend> = Arc::new(Store::open_memory().unwrap());
        Dispatcher::new(
            default_registry().unwrap(),
            ToolContext::new(backend, Limits::default()),
        )
    }

    async fn call(dispatcher: &Dispatcher, name: &str, args: Value) -> ToolResult {
        let arguments = args.as_object().cloned().unwrap_or_default();
        dispatcher.dispatch(ToolInvocation::new(name, arguments)).await
    }

    #[test]
    fn test_catalog() {
        let registry = default_registry().unwrap();
        assert_eq!(registry.len(), 19);

        let names: HashSet<&str> = registry.names().into_iter().collect();
        for name in [
            "list_collections",
            "create_collection",
            "insert_data",
            "bulk_insert",
            "vector_search",
            "multi_vector_search",
            "hybrid_search",
            "text_search",
            "create_index",
            "get_index_info",
        ] {
            assert!(names.contains(name), "missing tool {name}");
        }
    }

    #[test]
    fn test_required_params_have_no_default() {
        let registry = default_registry().unwrap();
        for spec in registry.specs() {
            for param in &spec.params {
                assert!(
                    !(param.required && param.default.is_some()),
                    "{}.{} is required but has a default",
                    spec.name,
                    param.name
                );
            }
        }
    }

    #[tokio::test]
    async fn test_collection_round_trip() {
        let dispatcher = dispatcher();
        let created = call(
            &dispatcher,
            "create_collection",
            json!({"collection_name": "docs", "schema": {"dimension": 2, "text_field": "text"}}),
        )
        .await;
        assert!(created.success, "{:?}", created.error);

        let listed = call(&dispatcher, "list_collections", json!({})).await;
        assert_eq!(listed.payload.unwrap()["collections"], json!(["docs"]));

        let info = call(&dispatcher, "get_collection_info", json!({"collection": "docs"})).await;
        let info = info.payload.unwrap();
        let fields: Vec<&str> = info["fields"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|f| f["name"].as_str())
            .collect();
        assert!(fields.contains(&"vector"));
        assert!(fields.contains(&"sparse"));
    }

    #[tokio::test]
    async fn test_delete_requires_filter() {
        let dispatcher = dispatcher();
        let result = call(
            &dispatcher,
            "delete_entities",
            json!({"collection_name": "docs", "filter_expr": "  "}),
        )
        .await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.details.unwrap()["param"], "filter_expr");
    }

    #[tokio::test]
    async fn test_hybrid_search_needs_sparse_field() {
        let dispatcher = dispatcher();
        call(
            &dispatcher,
            "create_collection",
            json!({"collection_name": "plain", "schema": {"dimension": 2}}),
        )
        .await;

        let result = call(
            &dispatcher,
            "hybrid_search",
            json!({"collection_name": "plain", "query_text": "rust", "vector": [0.1, 0.2]}),
        )
        .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Capability);
    }

    #[tokio::test]
    async fn test_unknown_ranker() {
        let dispatcher = dispatcher();
        let result = call(
            &dispatcher,
            "hybrid_search",
            json!({
                "collection_name": "docs",
                "query_text": "rust",
                "vector": [0.1],
                "ranker": "borda"
            }),
        )
        .await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert_eq!(error.details.unwrap()["param"], "ranker");
    }

    #[tokio::test]
    async fn test_load_collection_rejects_zero_replicas() {
        let dispatcher = dispatcher();
        let result = call(
            &dispatcher,
            "load_collection",
            json!({"collection_name": "docs", "replica_number": 0}),
        )
        .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
    }
}
