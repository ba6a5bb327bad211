//! Milvus RESTful API (v2) backend

use super::{Backend, MutationResult};
use crate::collection::{
    CollectionInfo, CollectionSchema, CollectionStats, CreateCollectionRequest, DataType,
    FieldSchema, FunctionSchema, FunctionType, IndexInfo, IndexSpec, LoadProgress, LoadState,
    BM25_METRIC,
};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::search::{
    Hit, HybridSearchRequest, QueryRequest, Ranker, Row, SearchRequest, TextSearchRequest,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Attempts for requests that never reached the server
const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Base delay between connection attempts
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Response envelope shared by every v2 endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: String,
}

/// Backend talking to a Milvus server over HTTP
pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    db_name: String,
}

impl RestBackend {
    /// Build a client without contacting the server
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.uri.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            db_name: config.db_name.clone(),
        })
    }

    /// Build a client and check the server answers
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let backend = Self::new(config)?;
        let collections = backend.list_collections().await?;
        tracing::info!(
            "Connected to Milvus at {} ({} collections in '{}')",
            backend.base_url,
            collections.len(),
            backend.db_name
        );
        Ok(backend)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v2/vectordb/{}", self.base_url, path)
    }

    /// POST a request body and unwrap the `{code, data, message}` envelope
    async fn call(&self, path: &str, mut body: Value) -> Result<Value> {
        if let Value::Object(map) = &mut body {
            map.insert("dbName".to_string(), Value::String(self.db_name.clone()));
        }
        let url = self.endpoint(path);
        tracing::debug!("POST {} {}", url, body);

        let mut attempt = 1;
        let response = loop {
            let mut request = self.client.post(&url).json(&body);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            match request.send().await {
                Ok(response) => break response,
                Err(e) if e.is_connect() && attempt < MAX_CONNECT_ATTEMPTS => {
                    tracing::warn!(
                        "Connection to {} failed (attempt {}/{}): {}",
                        url,
                        attempt,
                        MAX_CONNECT_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::backend(format!(
                        "request to {} failed: {}",
                        url, e
                    )))
                }
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::backend(format!("{} returned HTTP {}: {}", path, status, body)));
        }

        let envelope: Envelope = response.json().await?;
        unwrap_envelope(path, envelope)
    }

    /// Entity search returning the hits for a single query
    async fn search_once(&self, body: Value) -> Result<Vec<Hit>> {
        let data = self.call("entities/search", body).await?;
        parse_hits(&data)
    }
}

fn unwrap_envelope(path: &str, envelope: Envelope) -> Result<Value> {
    // some server versions report success as 200 instead of 0
    if envelope.code != 0 && envelope.code != 200 {
        return Err(Error::backend(format!(
            "{} failed (code {}): {}",
            path, envelope.code, envelope.message
        )));
    }
    Ok(envelope.data)
}

#[async_trait]
impl Backend for RestBackend {
    fn name(&self) -> &'static str {
        "milvus"
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let data = self.call("collections/list", json!({})).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn describe_collection(&self, name: &str) -> Result<CollectionInfo> {
        let data = self
            .call("collections/describe", json!({ "collectionName": name }))
            .await?;
        parse_collection(name, &data)
    }

    async fn create_collection(&self, request: &CreateCollectionRequest) -> Result<()> {
        if self.has_collection(&request.name).await? {
            return Err(Error::backend(format!(
                "collection '{}' already exists",
                request.name
            )));
        }

        let mut body = json!({
            "collectionName": request.name,
            "schema": schema_body(&request.schema),
        });
        if !request.indexes.is_empty() {
            body["indexParams"] = Value::Array(request.indexes.iter().map(index_body).collect());
        }
        self.call("collections/create", body).await?;
        Ok(())
    }

    async fn load_collection(&self, name: &str, replicas: u32) -> Result<()> {
        self.call(
            "collections/load",
            json!({ "collectionName": name, "replicaNumber": replicas }),
        )
        .await?;
        Ok(())
    }

    async fn release_collection(&self, name: &str) -> Result<()> {
        self.call("collections/release", json!({ "collectionName": name }))
            .await?;
        Ok(())
    }

    async fn load_state(&self, name: &str) -> Result<LoadProgress> {
        let data = self
            .call("collections/get_load_state", json!({ "collectionName": name }))
            .await?;
        let state = data
            .get("loadState")
            .and_then(Value::as_str)
            .map(LoadState::from_milvus)
            .unwrap_or(LoadState::NotLoad);
        let progress = data
            .get("loadProgress")
            .and_then(Value::as_u64)
            .map(|p| p.min(100) as u8)
            .unwrap_or(if state == LoadState::Loaded { 100 } else { 0 });
        Ok(LoadProgress { state, progress })
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        let data = self
            .call("collections/get_stats", json!({ "collectionName": name }))
            .await?;
        Ok(CollectionStats {
            row_count: as_count(data.get("rowCount")),
        })
    }

    async fn insert(&self, collection: &str, rows: Vec<Row>) -> Result<MutationResult> {
        let data = self
            .call(
                "entities/insert",
                json!({ "collectionName": collection, "data": rows }),
            )
            .await?;
        Ok(MutationResult {
            count: as_count(data.get("insertCount")),
            ids: id_list(data.get("insertIds")),
        })
    }

    async fn upsert(&self, collection: &str, rows: Vec<Row>) -> Result<MutationResult> {
        let data = self
            .call(
                "entities/upsert",
                json!({ "collectionName": collection, "data": rows }),
            )
            .await?;
        Ok(MutationResult {
            count: as_count(data.get("upsertCount")),
            ids: id_list(data.get("upsertIds")),
        })
    }

    async fn delete(&self, collection: &str, filter: &str) -> Result<Option<u64>> {
        // older servers do not report deleteCount; count up front as a fallback
        let matching = match self.count(collection, Some(filter)).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::debug!("Cannot pre-count deletions in '{}': {}", collection, e);
                None
            }
        };
        let data = self
            .call(
                "entities/delete",
                json!({ "collectionName": collection, "filter": filter }),
            )
            .await?;
        Ok(delete_count(&data, matching))
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>> {
        let data = self
            .call(
                "entities/query",
                json!({
                    "collectionName": request.collection,
                    "filter": request.filter,
                    "outputFields": request.output_fields,
                    "limit": request.limit,
                }),
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn count(&self, collection: &str, filter: Option<&str>) -> Result<u64> {
        let data = self
            .call(
                "entities/query",
                json!({
                    "collectionName": collection,
                    "filter": filter.unwrap_or(""),
                    "outputFields": ["count(*)"],
                }),
            )
            .await?;
        Ok(as_count(data.get(0).and_then(|row| row.get("count(*)"))))
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Vec<Hit>>> {
        // one call per vector keeps result grouping exact
        let mut results = Vec::with_capacity(request.vectors.len());
        for vector in &request.vectors {
            results.push(self.search_once(search_body(request, vector)).await?);
        }
        Ok(results)
    }

    async fn text_search(&self, request: &TextSearchRequest) -> Result<Vec<Hit>> {
        self.search_once(text_search_body(request)).await
    }

    async fn hybrid_search(&self, request: &HybridSearchRequest) -> Result<Vec<Hit>> {
        let data = self
            .call("entities/hybrid_search", hybrid_body(request))
            .await?;
        parse_hits(&data)
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<()> {
        self.call(
            "indexes/create",
            json!({ "collectionName": collection, "indexParams": [index_body(index)] }),
        )
        .await?;
        Ok(())
    }

    async fn describe_indexes(
        &self,
        collection: &str,
        field: Option<&str>,
    ) -> Result<Vec<IndexInfo>> {
        let names: Vec<String> = serde_json::from_value(
            self.call("indexes/list", json!({ "collectionName": collection }))
                .await?,
        )?;

        let mut indexes = Vec::new();
        for index_name in names {
            let data = self
                .call(
                    "indexes/describe",
                    json!({ "collectionName": collection, "indexName": index_name }),
                )
                .await?;
            for described in data.as_array().into_iter().flatten() {
                let info = parse_index(described);
                if field.map_or(true, |f| f == info.spec.field_name) {
                    indexes.push(info);
                }
            }
        }
        Ok(indexes)
    }
}

// -------------------------------------------------------------------------
// Request bodies
// -------------------------------------------------------------------------

fn schema_body(schema: &CollectionSchema) -> Value {
    let fields: Vec<Value> = schema
        .fields
        .iter()
        .map(|field| {
            let mut params = Map::new();
            if let Some(dim) = field.dim {
                params.insert("dim".to_string(), json!(dim));
            }
            if let Some(max_length) = field.max_length {
                params.insert("max_length".to_string(), json!(max_length));
            }
            if field.enable_analyzer {
                params.insert("enable_analyzer".to_string(), json!(true));
            }
            let mut body = json!({
                "fieldName": field.name,
                "dataType": field.data_type.as_str(),
                "isPrimary": field.is_primary,
            });
            if !params.is_empty() {
                body["elementTypeParams"] = Value::Object(params);
            }
            if !field.description.is_empty() {
                body["description"] = json!(field.description);
            }
            body
        })
        .collect();

    let mut body = json!({
        "autoId": schema.auto_id,
        "enableDynamicField": schema.enable_dynamic_field,
        "fields": fields,
    });
    if !schema.functions.is_empty() {
        body["functions"] = Value::Array(
            schema
                .functions
                .iter()
                .map(|f| {
                    json!({
                        "name": f.name,
                        "type": "BM25",
                        "inputFieldNames": [f.input_field],
                        "outputFieldNames": [f.output_field],
                    })
                })
                .collect(),
        );
    }
    body
}

fn index_body(index: &IndexSpec) -> Value {
    let mut params = index.params.clone();
    params.insert("index_type".to_string(), json!(index.index_type));
    json!({
        "fieldName": index.field_name,
        "indexName": index.index_name,
        "metricType": index.metric_type,
        "params": params,
    })
}

fn search_body(request: &SearchRequest, vector: &[f32]) -> Value {
    let mut body = json!({
        "collectionName": request.collection,
        "data": [vector],
        "annsField": request.anns_field,
        "limit": request.limit,
        "outputFields": request.output_fields,
        "searchParams": {
            "metricType": request.metric.as_str(),
            "params": request.params,
        },
    });
    if let Some(filter) = &request.filter {
        body["filter"] = json!(filter);
    }
    body
}

fn text_search_body(request: &TextSearchRequest) -> Value {
    let mut body = json!({
        "collectionName": request.collection,
        "data": [request.text],
        "annsField": request.anns_field,
        "limit": request.limit,
        "outputFields": request.output_fields,
        "searchParams": {
            "metricType": BM25_METRIC,
            "params": { "drop_ratio_search": request.drop_ratio },
        },
    });
    if let Some(filter) = &request.filter {
        body["filter"] = json!(filter);
    }
    body
}

fn hybrid_body(request: &HybridSearchRequest) -> Value {
    let mut dense = json!({
        "data": [request.dense.vector],
        "annsField": request.dense.anns_field,
        "limit": request.limit,
        "metricType": request.dense.metric.as_str(),
        "params": request.dense.params,
    });
    let mut sparse = json!({
        "data": [request.sparse.text],
        "annsField": request.sparse.anns_field,
        "limit": request.limit,
        "metricType": BM25_METRIC,
        "params": { "drop_ratio_search": request.sparse.drop_ratio },
    });
    if let Some(filter) = &request.filter {
        dense["filter"] = json!(filter);
        sparse["filter"] = json!(filter);
    }

    let rerank = match request.ranker {
        Ranker::Rrf { k } => json!({ "strategy": "rrf", "params": { "k": k } }),
        Ranker::Weighted { dense, sparse } => {
            json!({ "strategy": "weighted", "params": { "weights": [dense, sparse] } })
        }
    };

    json!({
        "collectionName": request.collection,
        "search": [dense, sparse],
        "rerank": rerank,
        "limit": request.limit,
        "outputFields": request.output_fields,
    })
}

// -------------------------------------------------------------------------
// Response parsing
// -------------------------------------------------------------------------

fn as_count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn id_list(value: Option<&Value>) -> Vec<Value> {
    value
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Search hits carry their score under `distance`
fn parse_hits(data: &Value) -> Result<Vec<Hit>> {
    let rows: Vec<Row> = serde_json::from_value(data.clone())?;
    Ok(rows
        .into_iter()
        .map(|mut fields| {
            let score = fields
                .remove("distance")
                .and_then(|d| d.as_f64())
                .unwrap_or(0.0);
            Hit { score, fields }
        })
        .collect())
}

/// Prefer the server's deleteCount over a count taken before the delete
fn delete_count(data: &Value, matching: Option<u64>) -> Option<u64> {
    data.get("deleteCount").and_then(Value::as_u64).or(matching)
}

fn param_usize(params: &Value, key: &str) -> Option<usize> {
    params.as_array()?.iter().find_map(|p| {
        if p.get("key")?.as_str()? != key {
            return None;
        }
        match p.get("value")? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
            _ => None,
        }
    })
}

fn param_bool(params: &Value, key: &str) -> bool {
    params
        .as_array()
        .into_iter()
        .flatten()
        .any(|p| p.get("key").and_then(Value::as_str) == Some(key)
            && matches!(p.get("value"), Some(Value::String(s)) if s == "true"))
}

fn first_name(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_array)
        .and_then(|names| names.first())
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_collection(name: &str, data: &Value) -> Result<CollectionInfo> {
    let raw_fields = data
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::backend(format!("describe '{}' returned no fields", name)))?;

    let mut fields = Vec::with_capacity(raw_fields.len());
    for raw in raw_fields {
        let field_name = raw
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let data_type: DataType = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse()
            .map_err(|_| Error::backend(format!("unsupported type for field '{}'", field_name)))?;
        let params = raw.get("params").cloned().unwrap_or(Value::Null);
        fields.push(FieldSchema {
            name: field_name.to_string(),
            data_type,
            is_primary: raw
                .get("primaryKey")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            dim: param_usize(&params, "dim"),
            max_length: param_usize(&params, "max_length"),
            enable_analyzer: param_bool(&params, "enable_analyzer"),
            description: raw
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    let functions = data
        .get("functions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|f| {
            f.get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.to_uppercase().starts_with("BM25"))
        })
        .map(|f| FunctionSchema {
            name: f.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            function_type: FunctionType::Bm25,
            input_field: first_name(f.get("inputFieldNames")),
            output_field: first_name(f.get("outputFieldNames")),
        })
        .collect();

    let indexes = data
        .get("indexes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(parse_index)
        .collect();

    Ok(CollectionInfo {
        name: name.to_string(),
        schema: CollectionSchema {
            fields,
            auto_id: data.get("autoId").and_then(Value::as_bool).unwrap_or(false),
            enable_dynamic_field: data
                .get("enableDynamicField")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            functions,
            description: data
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        load_state: data
            .get("load")
            .and_then(Value::as_str)
            .map(LoadState::from_milvus)
            .unwrap_or(LoadState::NotLoad),
        created_at: data.get("createdTime").map(|t| match t {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
        indexes,
    })
}

fn parse_index(raw: &Value) -> IndexInfo {
    let text = |key: &str| {
        raw.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let params = raw
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    IndexInfo {
        spec: IndexSpec {
            field_name: text("fieldName"),
            index_name: text("indexName"),
            index_type: text("indexType"),
            metric_type: text("metricType"),
            params,
        },
        indexed_rows: raw.get("indexedRows").map(|v| as_count(Some(v))),
        total_rows: raw.get("totalRows").map(|v| as_count(Some(v))),
        state: raw
            .get("indexState")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{DenseLeg, Metric, SparseLeg};

    #[test]
    fn test_envelope_error() {
        let envelope: Envelope = serde_json::from_value(json!({
            "code": 100,
            "message": "collection not found[collection=missing]"
        }))
        .unwrap();
        let err = unwrap_envelope("collections/describe", envelope).unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert!(err.to_string().contains("collection not found"));

        let ok: Envelope = serde_json::from_value(json!({"code": 0, "data": ["a"]})).unwrap();
        assert_eq!(unwrap_envelope("collections/list", ok).unwrap(), json!(["a"]));
    }

    #[test]
    fn test_delete_count_fallback() {
        assert_eq!(delete_count(&json!({"deleteCount": 4}), Some(9)), Some(4));
        assert_eq!(delete_count(&json!({}), Some(9)), Some(9));
        assert_eq!(delete_count(&json!({}), None), None);
    }

    #[test]
    fn test_endpoint() {
        let backend = RestBackend::new(&ConnectionConfig::new("http://localhost:19530/")).unwrap();
        assert_eq!(
            backend.endpoint("collections/list"),
            "http://localhost:19530/v2/vectordb/collections/list"
        );
    }

    #[test]
    fn test_parse_hits_moves_distance_to_score() {
        let hits = parse_hits(&json!([
            {"id": 7, "distance": 0.93, "title": "a"},
            {"id": 3, "distance": 0.41, "title": "b", "score": 5}
        ]))
        .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].score, 0.93);
        assert!(!hits[0].fields.contains_key("distance"));
        assert_eq!(hits[1].fields["title"], json!("b"));

        let encoded = serde_json::to_value(&hits[1]).unwrap();
        assert_eq!(encoded["score"], json!(0.41));
        assert_eq!(encoded["entity"]["score"], json!(5));
    }

    #[test]
    fn test_parse_collection() {
        let data = json!({
            "collectionName": "articles",
            "autoId": false,
            "enableDynamicField": true,
            "fields": [
                {"name": "id", "type": "Int64", "primaryKey": true},
                {"name": "vector", "type": "FloatVector", "params": [{"key": "dim", "value": "4"}]},
                {"name": "text", "type": "VarChar", "params": [
                    {"key": "max_length", "value": "65535"},
                    {"key": "enable_analyzer", "value": "true"}
                ]},
                {"name": "sparse", "type": "SparseFloatVector"}
            ],
            "functions": [{
                "name": "text_bm25",
                "type": "BM25",
                "inputFieldNames": ["text"],
                "outputFieldNames": ["sparse"]
            }],
            "indexes": [{"fieldName": "vector", "indexName": "vector", "metricType": "COSINE"}],
            "load": "LoadStateLoaded"
        });

        let info = parse_collection("articles", &data).unwrap();
        assert_eq!(info.schema.field("vector").unwrap().dim, Some(4));
        assert!(info.schema.field("text").unwrap().enable_analyzer);
        assert_eq!(info.schema.bm25_function("sparse").unwrap().input_field, "text");
        assert_eq!(info.load_state, LoadState::Loaded);
        assert_eq!(info.indexes[0].spec.metric_type, "COSINE");
        assert!(info.schema.validate().is_ok());
    }

    #[test]
    fn test_schema_body() {
        let request = CreateCollectionRequest::from_args(
            "docs",
            json!({"dimension": 8, "text_field": "text"}).as_object().unwrap(),
            None,
        )
        .unwrap();
        let body = schema_body(&request.schema);

        assert_eq!(body["fields"][1]["elementTypeParams"]["dim"], json!(8));
        assert_eq!(body["functions"][0]["outputFieldNames"], json!(["sparse"]));
        assert_eq!(index_body(&request.indexes[1])["metricType"], json!("BM25"));
    }

    #[test]
    fn test_hybrid_body() {
        let request = HybridSearchRequest {
            collection: "docs".to_string(),
            dense: DenseLeg {
                vector: vec![0.5, 0.5],
                anns_field: "vector".to_string(),
                metric: Metric::Ip,
                params: Map::new(),
            },
            sparse: SparseLeg {
                text: "milvus".to_string(),
                anns_field: "sparse".to_string(),
                drop_ratio: 0.2,
            },
            limit: 4,
            filter: Some("year > 2000".to_string()),
            output_fields: vec!["*".to_string()],
            ranker: Ranker::Weighted {
                dense: 0.6,
                sparse: 0.4,
            },
        };
        let body = hybrid_body(&request);

        assert_eq!(body["search"][0]["limit"], json!(4));
        assert_eq!(body["search"][1]["limit"], json!(4));
        assert_eq!(body["search"][1]["filter"], json!("year > 2000"));
        assert_eq!(body["search"][1]["params"]["drop_ratio_search"], json!(0.2));
        assert_eq!(body["rerank"]["strategy"], json!("weighted"));
        assert_eq!(body["rerank"]["params"]["weights"], json!([0.6, 0.4]));
    }
}
