//! Query building for Milvus MCP
//!
//! Turns validated tool arguments into backend requests: plain queries,
//! single and multi-vector searches, BM25 text searches and hybrid
//! dense + sparse searches. The builder never ranks anything itself;
//! fusion is delegated to the backend.

use crate::collection::{CollectionInfo, DataType};
use crate::config::Limits;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A row as returned by the backend (field name -> value)
pub type Row = Map<String, Value>;

/// Output field list meaning "every field"
pub const ALL_FIELDS: &str = "*";

/// Default reciprocal rank fusion constant
pub const DEFAULT_RRF_K: u32 = 60;

/// Similarity metric for dense vectors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Cosine similarity (default)
    #[default]
    Cosine,
    /// Squared Euclidean distance
    L2,
    /// Inner product
    Ip,
}

impl Metric {
    /// Literal used by Milvus
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "COSINE",
            Metric::L2 => "L2",
            Metric::Ip => "IP",
        }
    }

    /// Whether larger scores rank first
    pub fn higher_is_better(&self) -> bool {
        !matches!(self, Metric::L2)
    }

    /// Map a raw score into `[0, 1]` where larger is better
    ///
    /// Same normalization Milvus applies before weighted fusion.
    pub fn normalize(&self, score: f64) -> f64 {
        match self {
            Metric::Cosine => (1.0 + score) / 2.0,
            Metric::Ip => 0.5 + score.atan() / std::f64::consts::PI,
            Metric::L2 => 1.0 - 2.0 * score.atan() / std::f64::consts::PI,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "COSINE" => Ok(Metric::Cosine),
            "L2" => Ok(Metric::L2),
            "IP" => Ok(Metric::Ip),
            _ => Err(Error::validation(
                "metric_type",
                format!("unknown metric type '{}', expected COSINE, L2 or IP", s),
            )),
        }
    }
}

/// Normalize a BM25 score into `[0, 1]` for weighted fusion
pub fn normalize_bm25_score(score: f64) -> f64 {
    2.0 * score.atan() / std::f64::consts::PI
}

/// A scored search hit
///
/// Serialized as `{"score": .., "entity": {..}}` so row fields never
/// collide with the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Similarity score or distance, as reported by the backend
    pub score: f64,
    /// Output fields of the matching row
    #[serde(rename = "entity")]
    pub fields: Row,
}

/// Plain filter query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub collection: String,
    /// Opaque filter expression, passed through verbatim
    pub filter: String,
    pub output_fields: Vec<String>,
    pub limit: usize,
}

/// Options shared by dense searches
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    /// Vector field to search
    pub anns_field: String,
    /// Similarity metric
    pub metric: Metric,
    /// Maximum hits per query vector
    pub limit: usize,
    /// Optional filter expression
    pub filter: Option<String>,
    /// Fields to return; `None` means all
    pub output_fields: Option<Vec<String>>,
    /// Index search parameters; `None` means `{"nprobe": 10}`
    pub params: Option<Map<String, Value>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            anns_field: "vector".to_string(),
            metric: Metric::Cosine,
            limit: 5,
            filter: None,
            output_fields: None,
            params: None,
        }
    }
}

/// Dense vector search, one result set per query vector
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub collection: String,
    pub vectors: Vec<Vec<f32>>,
    pub anns_field: String,
    pub metric: Metric,
    pub limit: usize,
    pub filter: Option<String>,
    pub output_fields: Vec<String>,
    pub params: Map<String, Value>,
}

/// BM25 full-text search over a sparse field
#[derive(Debug, Clone, PartialEq)]
pub struct TextSearchRequest {
    pub collection: String,
    pub text: String,
    /// Sparse field generated by a BM25 function
    pub anns_field: String,
    pub limit: usize,
    /// Fraction of low-weight query terms ignored, in `[0, 1)`
    pub drop_ratio: f64,
    pub filter: Option<String>,
    pub output_fields: Vec<String>,
}

/// Fusion strategy for hybrid search
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ranker {
    /// Reciprocal rank fusion, `1 / (k + rank)`
    Rrf { k: u32 },
    /// Weighted sum of normalized scores
    Weighted { dense: f64, sparse: f64 },
}

impl Default for Ranker {
    fn default() -> Self {
        Ranker::Rrf { k: DEFAULT_RRF_K }
    }
}

impl Ranker {
    /// Build a ranker from tool arguments
    pub fn from_args(name: &str, k: Option<i64>, weights: Option<&[f64]>) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "rrf" | "" => {
                let k = k.unwrap_or(i64::from(DEFAULT_RRF_K));
                if !(1..=16_384).contains(&k) {
                    return Err(Error::validation(
                        "rrf_k",
                        format!("must be in [1, 16384], got {}", k),
                    ));
                }
                // range checked above
                Ok(Ranker::Rrf { k: k as u32 })
            }
            "weighted" => match weights {
                Some([dense, sparse]) => {
                    if *dense < 0.0 || *sparse < 0.0 || (*dense == 0.0 && *sparse == 0.0) {
                        return Err(Error::validation(
                            "weights",
                            "weights must be non-negative and not both zero",
                        ));
                    }
                    Ok(Ranker::Weighted {
                        dense: *dense,
                        sparse: *sparse,
                    })
                }
                Some(other) => Err(Error::validation(
                    "weights",
                    format!("expected 2 weights [dense, sparse], got {}", other.len()),
                )),
                None => Ok(Ranker::Weighted {
                    dense: 0.5,
                    sparse: 0.5,
                }),
            },
            other => Err(Error::validation(
                "ranker",
                format!("unknown ranker '{}', expected rrf or weighted", other),
            )),
        }
    }
}

/// Dense half of a hybrid search
#[derive(Debug, Clone, PartialEq)]
pub struct DenseLeg {
    pub vector: Vec<f32>,
    pub anns_field: String,
    pub metric: Metric,
    pub params: Map<String, Value>,
}

/// Sparse (BM25) half of a hybrid search
#[derive(Debug, Clone, PartialEq)]
pub struct SparseLeg {
    pub text: String,
    pub anns_field: String,
    pub drop_ratio: f64,
}

/// Dense + sparse search fused into one ranked list by the backend
///
/// Both legs share the collection, `limit` and `filter`.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridSearchRequest {
    pub collection: String,
    pub dense: DenseLeg,
    pub sparse: SparseLeg,
    pub limit: usize,
    pub filter: Option<String>,
    pub output_fields: Vec<String>,
    pub ranker: Ranker,
}

/// Options for hybrid search
#[derive(Debug, Clone, PartialEq)]
pub struct HybridOptions {
    pub vector_field: String,
    pub sparse_field: String,
    pub metric: Metric,
    pub limit: usize,
    pub filter: Option<String>,
    pub output_fields: Option<Vec<String>>,
    pub drop_ratio: f64,
    pub ranker: Ranker,
}

impl Default for HybridOptions {
    fn default() -> Self {
        HybridOptions {
            vector_field: "vector".to_string(),
            sparse_field: "sparse".to_string(),
            metric: Metric::Cosine,
            limit: 5,
            filter: None,
            output_fields: None,
            drop_ratio: 0.2,
            ranker: Ranker::default(),
        }
    }
}

/// Builds backend requests from validated arguments
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryBuilder {
    limits: Limits,
}

impl QueryBuilder {
    /// Create a builder enforcing the given limits
    pub fn new(limits: Limits) -> Self {
        QueryBuilder { limits }
    }

    fn cap(&self, limit: usize) -> usize {
        limit.clamp(1, self.limits.max_limit.max(1))
    }

    /// Plain filter query
    pub fn query(
        &self,
        collection: &str,
        filter: &str,
        output_fields: Option<Vec<String>>,
        limit: usize,
    ) -> QueryRequest {
        QueryRequest {
            collection: collection.to_string(),
            filter: filter.to_string(),
            output_fields: resolve_output_fields(output_fields),
            limit: self.cap(limit),
        }
    }

    /// Single-vector search
    pub fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        options: SearchOptions,
    ) -> Result<SearchRequest> {
        check_vector("vector", &vector)?;
        Ok(self.dense_request(collection, vec![vector], options))
    }

    /// Multi-vector search; results come back one set per vector, in order
    pub fn multi_search(
        &self,
        collection: &str,
        vectors: Vec<Vec<f32>>,
        options: SearchOptions,
    ) -> Result<SearchRequest> {
        let first = vectors.first().ok_or_else(|| {
            Error::validation("vectors", "at least one query vector is required")
        })?;
        let dim = first.len();

        for (i, vector) in vectors.iter().enumerate() {
            if vector.is_empty() {
                return Err(Error::validation(
                    "vectors",
                    format!("query vector {} is empty", i),
                ));
            }
            if vector.len() != dim {
                return Err(Error::validation(
                    "vectors",
                    format!(
                        "dimension mismatch: vector {} has {} dimensions, vector 0 has {}",
                        i,
                        vector.len(),
                        dim
                    ),
                ));
            }
            check_vector("vectors", vector)?;
        }

        Ok(self.dense_request(collection, vectors, options))
    }

    fn dense_request(
        &self,
        collection: &str,
        vectors: Vec<Vec<f32>>,
        options: SearchOptions,
    ) -> SearchRequest {
        SearchRequest {
            collection: collection.to_string(),
            vectors,
            anns_field: options.anns_field,
            metric: options.metric,
            limit: self.cap(options.limit),
            filter: non_empty(options.filter),
            output_fields: resolve_output_fields(options.output_fields),
            params: options.params.unwrap_or_else(default_search_params),
        }
    }

    /// BM25 text search against a collection with a BM25 sparse field
    #[allow(clippy::too_many_arguments)]
    pub fn text_search(
        &self,
        info: &CollectionInfo,
        text: &str,
        sparse_field: &str,
        limit: usize,
        drop_ratio: f64,
        filter: Option<String>,
        output_fields: Option<Vec<String>>,
    ) -> Result<TextSearchRequest> {
        check_text(text)?;
        check_drop_ratio(drop_ratio)?;
        check_sparse_field(info, sparse_field)?;

        Ok(TextSearchRequest {
            collection: info.name.clone(),
            text: text.to_string(),
            anns_field: sparse_field.to_string(),
            limit: self.cap(limit),
            drop_ratio,
            filter: non_empty(filter),
            output_fields: resolve_output_fields(output_fields),
        })
    }

    /// Hybrid dense + BM25 search
    ///
    /// Both legs are checked against the collection schema: the dense field
    /// must be a float vector of the query's dimension and the sparse field
    /// must be fed by a BM25 function.
    pub fn hybrid_search(
        &self,
        info: &CollectionInfo,
        text: &str,
        vector: Vec<f32>,
        options: HybridOptions,
    ) -> Result<HybridSearchRequest> {
        check_text(text)?;
        check_vector("vector", &vector)?;
        check_drop_ratio(options.drop_ratio)?;

        let dense_field = info.schema.field(&options.vector_field).ok_or_else(|| {
            Error::capability(format!(
                "collection '{}' has no vector field '{}'",
                info.name, options.vector_field
            ))
        })?;
        if dense_field.data_type != DataType::FloatVector {
            return Err(Error::capability(format!(
                "field '{}' in collection '{}' is {}, hybrid search needs a FloatVector field",
                dense_field.name, info.name, dense_field.data_type
            )));
        }
        if let Some(dim) = dense_field.dim {
            if dim != vector.len() {
                return Err(Error::validation(
                    "vector",
                    format!(
                        "dimension mismatch: query has {} dimensions, field '{}' has {}",
                        vector.len(),
                        dense_field.name,
                        dim
                    ),
                ));
            }
        }
        check_sparse_field(info, &options.sparse_field)?;

        Ok(HybridSearchRequest {
            collection: info.name.clone(),
            dense: DenseLeg {
                vector,
                anns_field: options.vector_field,
                metric: options.metric,
                params: default_search_params(),
            },
            sparse: SparseLeg {
                text: text.to_string(),
                anns_field: options.sparse_field,
                drop_ratio: options.drop_ratio,
            },
            limit: self.cap(options.limit),
            filter: non_empty(options.filter),
            output_fields: resolve_output_fields(options.output_fields),
            ranker: options.ranker,
        })
    }
}

/// Default dense search parameters
pub fn default_search_params() -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("nprobe".to_string(), json!(10));
    params
}

/// Unset or empty output fields mean all fields
pub fn resolve_output_fields(fields: Option<Vec<String>>) -> Vec<String> {
    match fields {
        Some(fields) if !fields.is_empty() => fields,
        _ => vec![ALL_FIELDS.to_string()],
    }
}

fn non_empty(filter: Option<String>) -> Option<String> {
    filter.filter(|f| !f.trim().is_empty())
}

fn check_vector(param: &str, vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(Error::validation(param, "query vector must not be empty"));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::validation(
            param,
            "query vector contains a non-finite value",
        ));
    }
    Ok(())
}

fn check_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::validation("query_text", "query text must not be empty"));
    }
    Ok(())
}

fn check_drop_ratio(drop_ratio: f64) -> Result<()> {
    if !(0.0..1.0).contains(&drop_ratio) {
        return Err(Error::validation(
            "drop_ratio",
            format!("must be in [0, 1), got {}", drop_ratio),
        ));
    }
    Ok(())
}

fn check_sparse_field(info: &CollectionInfo, sparse_field: &str) -> Result<()> {
    match info.schema.field(sparse_field) {
        Some(field)
            if field.data_type == DataType::SparseFloatVector
                && info.schema.bm25_function(sparse_field).is_some() =>
        {
            Ok(())
        }
        Some(_) => Err(Error::capability(format!(
            "field '{}' in collection '{}' is not a BM25 sparse field",
            sparse_field, info.name
        ))),
        None => Err(Error::capability(format!(
            "collection '{}' has no sparse field '{}' for text search",
            info.name, sparse_field
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CreateCollectionRequest, LoadState};

    fn info(schema: Value) -> CollectionInfo {
        let request =
            CreateCollectionRequest::from_args("docs", schema.as_object().unwrap(), None).unwrap();
        CollectionInfo {
            name: request.name,
            schema: request.schema,
            load_state: LoadState::Loaded,
            created_at: None,
            indexes: Vec::new(),
        }
    }

    fn builder(max_limit: usize) -> QueryBuilder {
        QueryBuilder::new(Limits {
            max_limit,
            batch_size: 10,
        })
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert_eq!("L2".parse::<Metric>().unwrap(), Metric::L2);
        assert_eq!(" ip ".parse::<Metric>().unwrap(), Metric::Ip);

        let err = "JACCARD".parse::<Metric>().unwrap_err();
        assert!(err.to_string().contains("metric_type"));
    }

    #[test]
    fn test_metric_normalization_is_monotonic() {
        assert!(Metric::Cosine.normalize(0.9) > Metric::Cosine.normalize(0.1));
        assert!(Metric::Ip.normalize(3.0) > Metric::Ip.normalize(-3.0));
        // smaller L2 distance is better
        assert!(Metric::L2.normalize(0.1) > Metric::L2.normalize(4.0));
        assert!((Metric::Cosine.normalize(1.0) - 1.0).abs() < 1e-9);
        assert!(normalize_bm25_score(5.0) > normalize_bm25_score(1.0));
    }

    #[test]
    fn test_search_defaults() {
        let request = builder(100)
            .search("docs", vec![0.1, 0.2], SearchOptions::default())
            .unwrap();

        assert_eq!(request.anns_field, "vector");
        assert_eq!(request.metric, Metric::Cosine);
        assert_eq!(request.limit, 5);
        assert_eq!(request.output_fields, vec!["*"]);
        assert_eq!(request.params["nprobe"], json!(10));
        assert!(request.filter.is_none());
    }

    #[test]
    fn test_search_rejects_empty_vector() {
        let err = builder(100)
            .search("docs", Vec::new(), SearchOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref param, .. } if param == "vector"));
    }

    #[test]
    fn test_search_caps_limit() {
        let options = SearchOptions {
            limit: 1_000_000,
            ..Default::default()
        };
        let request = builder(50).search("docs", vec![1.0], options).unwrap();
        assert_eq!(request.limit, 50);
    }

    #[test]
    fn test_blank_filter_is_dropped() {
        let options = SearchOptions {
            filter: Some("   ".to_string()),
            ..Default::default()
        };
        let request = builder(50).search("docs", vec![1.0], options).unwrap();
        assert!(request.filter.is_none());
    }

    #[test]
    fn test_multi_search_dimension_mismatch() {
        let err = builder(100)
            .multi_search(
                "docs",
                vec![vec![1.0, 2.0], vec![1.0, 2.0, 3.0]],
                SearchOptions::default(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn test_multi_search_preserves_order() {
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]];
        let request = builder(100)
            .multi_search("docs", vectors.clone(), SearchOptions::default())
            .unwrap();
        assert_eq!(request.vectors, vectors);
    }

    #[test]
    fn test_query_defaults_output_fields() {
        let request = builder(100).query("docs", "age > 3", Some(Vec::new()), 10);
        assert_eq!(request.output_fields, vec!["*"]);
        assert_eq!(request.filter, "age > 3");
    }

    #[test]
    fn test_hybrid_requires_bm25_field() {
        let info = info(json!({"dimension": 2}));
        let err = builder(100)
            .hybrid_search(&info, "rust", vec![1.0, 0.0], HybridOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Capability(_)));
    }

    #[test]
    fn test_hybrid_checks_dimension() {
        let info = info(json!({"dimension": 3, "text_field": "text"}));
        let err = builder(100)
            .hybrid_search(&info, "rust", vec![1.0, 0.0], HybridOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn test_hybrid_legs_share_limit_and_filter() {
        let info = info(json!({"dimension": 2, "text_field": "text"}));
        let options = HybridOptions {
            limit: 7,
            filter: Some("year > 2000".to_string()),
            ranker: Ranker::Weighted {
                dense: 0.7,
                sparse: 0.3,
            },
            ..Default::default()
        };
        let request = builder(100)
            .hybrid_search(&info, "vector databases", vec![1.0, 0.0], options)
            .unwrap();

        assert_eq!(request.collection, "docs");
        assert_eq!(request.limit, 7);
        assert_eq!(request.filter.as_deref(), Some("year > 2000"));
        assert_eq!(request.dense.anns_field, "vector");
        assert_eq!(request.sparse.anns_field, "sparse");
        assert_eq!(request.sparse.drop_ratio, 0.2);
    }

    #[test]
    fn test_text_search_drop_ratio_bounds() {
        let info = info(json!({"dimension": 2, "text_field": "text"}));
        let err = builder(100)
            .text_search(&info, "rust", "sparse", 5, 1.0, None, None)
            .unwrap_err();
        assert!(err.to_string().contains("drop_ratio"));
    }

    #[test]
    fn test_ranker_from_args() {
        assert_eq!(
            Ranker::from_args("rrf", None, None).unwrap(),
            Ranker::Rrf { k: 60 }
        );
        assert_eq!(
            Ranker::from_args("weighted", None, Some(&[0.8, 0.2])).unwrap(),
            Ranker::Weighted {
                dense: 0.8,
                sparse: 0.2
            }
        );
        assert!(Ranker::from_args("weighted", None, Some(&[1.0])).is_err());
        assert!(Ranker::from_args("rrf", Some(0), None).is_err());
        assert!(Ranker::from_args("max", None, None).is_err());
    }
}
