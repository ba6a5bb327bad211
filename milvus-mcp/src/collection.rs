//! Collection schema model
//!
//! Types describing collections, fields, functions and indexes, shared by the
//! query builder and both backends. A create-collection request can be given
//! either as an explicit field list or with the quick-setup keys
//! (`dimension`, `primary_field`, `vector_field`, ...).

use crate::error::{Error, Result};
use crate::search::Metric;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

/// Largest dense vector dimension accepted by Milvus
pub const MAX_DIMENSION: usize = 32_768;

/// Default `max_length` for VARCHAR fields that do not declare one
pub const DEFAULT_VARCHAR_LENGTH: usize = 65_535;

/// Default index type for dense vector fields
pub const DEFAULT_INDEX_TYPE: &str = "IVF_FLAT";

/// Index type used for BM25 sparse fields
pub const SPARSE_INDEX_TYPE: &str = "SPARSE_INVERTED_INDEX";

/// Metric used for BM25 sparse fields
pub const BM25_METRIC: &str = "BM25";

/// Field data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    VarChar,
    Json,
    FloatVector,
    SparseFloatVector,
}

impl DataType {
    /// Name used on the Milvus REST API
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "Bool",
            DataType::Int8 => "Int8",
            DataType::Int16 => "Int16",
            DataType::Int32 => "Int32",
            DataType::Int64 => "Int64",
            DataType::Float => "Float",
            DataType::Double => "Double",
            DataType::VarChar => "VarChar",
            DataType::Json => "JSON",
            DataType::FloatVector => "FloatVector",
            DataType::SparseFloatVector => "SparseFloatVector",
        }
    }

    /// Whether this is a vector type
    pub fn is_vector(&self) -> bool {
        matches!(self, DataType::FloatVector | DataType::SparseFloatVector)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_')
            .collect::<String>()
            .to_uppercase();
        match normalized.as_str() {
            "BOOL" | "BOOLEAN" => Ok(DataType::Bool),
            "INT8" => Ok(DataType::Int8),
            "INT16" => Ok(DataType::Int16),
            "INT32" => Ok(DataType::Int32),
            "INT64" => Ok(DataType::Int64),
            "FLOAT" => Ok(DataType::Float),
            "DOUBLE" => Ok(DataType::Double),
            "VARCHAR" | "STRING" => Ok(DataType::VarChar),
            "JSON" => Ok(DataType::Json),
            "FLOATVECTOR" => Ok(DataType::FloatVector),
            "SPARSEFLOATVECTOR" => Ok(DataType::SparseFloatVector),
            _ => Err(Error::validation(
                "schema",
                format!("unknown data type '{}'", s),
            )),
        }
    }
}

impl Serialize for DataType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A single field in a collection schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Field name
    #[serde(alias = "field_name", alias = "fieldName")]
    pub name: String,
    /// Field data type
    #[serde(rename = "type", alias = "data_type", alias = "dataType")]
    pub data_type: DataType,
    /// Whether this is the primary key
    #[serde(default, alias = "isPrimary", alias = "is_primary_key")]
    pub is_primary: bool,
    /// Dimension (dense vectors only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dim: Option<usize>,
    /// Maximum length (VARCHAR only)
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "maxLength")]
    pub max_length: Option<usize>,
    /// Whether text in this field is tokenized for BM25
    #[serde(default, skip_serializing_if = "is_false", alias = "enableAnalyzer")]
    pub enable_analyzer: bool,
    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn default_true() -> bool {
    true
}

impl FieldSchema {
    /// Create a field of the given type
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            is_primary: false,
            dim: None,
            max_length: None,
            enable_analyzer: false,
            description: String::new(),
        }
    }

    /// Mark as primary key
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Set the vector dimension
    pub fn with_dim(mut self, dim: usize) -> Self {
        self.dim = Some(dim);
        self
    }

    /// Set the VARCHAR maximum length
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Enable the text analyzer
    pub fn analyzed(mut self) -> Self {
        self.enable_analyzer = true;
        self
    }
}

/// Function type attached to a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionType {
    /// Text field to BM25 sparse vector
    #[serde(rename = "BM25", alias = "bm25")]
    Bm25,
}

/// Server-side function deriving one field from another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSchema {
    /// Function name
    pub name: String,
    /// Function type
    #[serde(rename = "type", alias = "function_type")]
    pub function_type: FunctionType,
    /// Source field
    #[serde(alias = "inputField")]
    pub input_field: String,
    /// Generated field
    #[serde(alias = "outputField")]
    pub output_field: String,
}

/// Collection schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    /// Fields in declaration order
    pub fields: Vec<FieldSchema>,
    /// Whether primary keys are generated
    #[serde(default, alias = "autoId")]
    pub auto_id: bool,
    /// Whether undeclared fields are stored
    #[serde(default = "default_true", alias = "enableDynamicField")]
    pub enable_dynamic_field: bool,
    /// Server-side functions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionSchema>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl CollectionSchema {
    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The primary key field
    pub fn primary_field(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_primary)
    }

    /// Vector fields in declaration order
    pub fn vector_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.data_type.is_vector())
    }

    /// The BM25 function producing the given sparse field, if any
    pub fn bm25_function(&self, sparse_field: &str) -> Option<&FunctionSchema> {
        self.functions
            .iter()
            .find(|f| f.function_type == FunctionType::Bm25 && f.output_field == sparse_field)
    }

    /// Whether a field is generated by a function and must not be supplied
    pub fn is_function_output(&self, field: &str) -> bool {
        self.functions.iter().any(|f| f.output_field == field)
    }

    /// Check structural invariants
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::validation("schema", "schema declares no fields"));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(Error::validation("schema", "field name must not be empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(Error::validation(
                    "schema",
                    format!("duplicate field '{}'", field.name),
                ));
            }
            if field.data_type == DataType::FloatVector {
                match field.dim {
                    Some(dim) if dim > 0 && dim <= MAX_DIMENSION => {}
                    Some(dim) => {
                        return Err(Error::validation(
                            "schema",
                            format!(
                                "field '{}' has dimension {}, expected 1..={}",
                                field.name, dim, MAX_DIMENSION
                            ),
                        ))
                    }
                    None => {
                        return Err(Error::validation(
                            "schema",
                            format!("vector field '{}' requires 'dim'", field.name),
                        ))
                    }
                }
            }
        }

        let primaries: Vec<&FieldSchema> = self.fields.iter().filter(|f| f.is_primary).collect();
        let primary = match primaries.as_slice() {
            [primary] => *primary,
            [] => return Err(Error::validation("schema", "schema has no primary field")),
            _ => {
                return Err(Error::validation(
                    "schema",
                    "schema has more than one primary field",
                ))
            }
        };
        if !matches!(primary.data_type, DataType::Int64 | DataType::VarChar) {
            return Err(Error::validation(
                "schema",
                format!(
                    "primary field '{}' must be Int64 or VarChar, got {}",
                    primary.name, primary.data_type
                ),
            ));
        }
        if self.auto_id && primary.data_type != DataType::Int64 {
            return Err(Error::validation(
                "schema",
                "auto_id requires an Int64 primary field",
            ));
        }

        if self.vector_fields().next().is_none() {
            return Err(Error::validation(
                "schema",
                "schema must contain at least one vector field",
            ));
        }

        for function in &self.functions {
            let input = self.field(&function.input_field).ok_or_else(|| {
                Error::validation(
                    "schema",
                    format!(
                        "function '{}' reads unknown field '{}'",
                        function.name, function.input_field
                    ),
                )
            })?;
            if input.data_type != DataType::VarChar || !input.enable_analyzer {
                return Err(Error::validation(
                    "schema",
                    format!(
                        "function '{}' input '{}' must be an analyzed VarChar field",
                        function.name, input.name
                    ),
                ));
            }
            let output = self.field(&function.output_field).ok_or_else(|| {
                Error::validation(
                    "schema",
                    format!(
                        "function '{}' writes unknown field '{}'",
                        function.name, function.output_field
                    ),
                )
            })?;
            if output.data_type != DataType::SparseFloatVector {
                return Err(Error::validation(
                    "schema",
                    format!(
                        "function '{}' output '{}' must be a SparseFloatVector field",
                        function.name, output.name
                    ),
                ));
            }
        }

        Ok(())
    }
}

/// Index definition sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed field
    pub field_name: String,
    /// Index name (defaults to the field name)
    pub index_name: String,
    /// Index type, e.g. IVF_FLAT, HNSW, AUTOINDEX
    pub index_type: String,
    /// Metric type, e.g. COSINE, L2, IP, BM25
    pub metric_type: String,
    /// Extra build parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl IndexSpec {
    /// Dense vector index with default parameters for its type
    pub fn dense(field_name: impl Into<String>, index_type: &str, metric: Metric) -> Self {
        let field_name = field_name.into();
        Self {
            index_name: field_name.clone(),
            field_name,
            index_type: index_type.to_uppercase(),
            metric_type: metric.as_str().to_string(),
            params: default_index_params(index_type),
        }
    }

    /// BM25 sparse index
    pub fn bm25(field_name: impl Into<String>) -> Self {
        let field_name = field_name.into();
        Self {
            index_name: field_name.clone(),
            field_name,
            index_type: SPARSE_INDEX_TYPE.to_string(),
            metric_type: BM25_METRIC.to_string(),
            params: Map::new(),
        }
    }

    /// Build from caller-supplied index arguments, defaulting type and metric
    pub fn from_args(
        field_name: impl Into<String>,
        index_name: Option<&str>,
        index_type: Option<&str>,
        metric: Option<&str>,
        params: Option<&Map<String, Value>>,
    ) -> Result<Self> {
        let field_name = field_name.into();
        let index_type = index_type
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_INDEX_TYPE)
            .to_uppercase();
        let metric_type = match metric.map(|m| m.trim().to_uppercase()) {
            Some(m) if m == BM25_METRIC => m,
            Some(m) => m.parse::<Metric>()?.as_str().to_string(),
            None => Metric::default().as_str().to_string(),
        };
        let params = match params {
            Some(params) => params.clone(),
            None => default_index_params(&index_type),
        };
        Ok(Self {
            index_name: index_name
                .filter(|n| !n.is_empty())
                .unwrap_or(&field_name)
                .to_string(),
            field_name,
            index_type,
            metric_type,
            params,
        })
    }
}

/// Default build parameters for an index type
pub fn default_index_params(index_type: &str) -> Map<String, Value> {
    let mut params = Map::new();
    match index_type.to_uppercase().as_str() {
        "IVF_FLAT" | "IVF_SQ8" | "IVF_PQ" => {
            params.insert("nlist".to_string(), json!(1024));
        }
        "HNSW" => {
            params.insert("M".to_string(), json!(16));
            params.insert("efConstruction".to_string(), json!(200));
        }
        _ => {}
    }
    params
}

/// Validated create-collection request
#[derive(Debug, Clone, PartialEq)]
pub struct CreateCollectionRequest {
    /// Collection name
    pub name: String,
    /// Schema
    pub schema: CollectionSchema,
    /// Indexes to build right after creation
    pub indexes: Vec<IndexSpec>,
}

/// Quick-setup keys understood by [`CreateCollectionRequest::from_args`]
const QUICK_SETUP_KEYS: &[&str] = &[
    "dimension",
    "primary_field",
    "id_type",
    "vector_field",
    "metric_type",
    "text_field",
    "sparse_field",
    "other_fields",
];

impl CreateCollectionRequest {
    /// Map declared schema arguments onto a schema and index list
    ///
    /// An explicit `fields` list is used as-is. Otherwise the quick-setup keys
    /// build a primary key, one dense vector field with an index, optional
    /// `other_fields`, and (with `text_field`) an analyzed text field plus a
    /// BM25 sparse field.
    pub fn from_args(
        name: &str,
        schema: &Map<String, Value>,
        index_params: Option<&Map<String, Value>>,
    ) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::validation(
                "collection_name",
                "collection name must not be empty",
            ));
        }

        let (schema, mut indexes) = if schema.contains_key("fields") {
            let parsed: CollectionSchema = serde_json::from_value(Value::Object(schema.clone()))
                .map_err(|e| Error::validation("schema", e.to_string()))?;
            (parsed, Vec::new())
        } else {
            quick_setup(schema)?
        };

        let mut schema = schema;
        for field in &mut schema.fields {
            if field.data_type == DataType::VarChar && field.max_length.is_none() {
                field.max_length = Some(DEFAULT_VARCHAR_LENGTH);
            }
        }
        schema.validate()?;

        if let Some(index_params) = index_params {
            let field_name = match index_params
                .get("field_name")
                .or_else(|| index_params.get("fieldName"))
                .and_then(Value::as_str)
            {
                Some(field) => field.to_string(),
                None => schema
                    .fields
                    .iter()
                    .find(|f| f.data_type == DataType::FloatVector)
                    .map(|f| f.name.clone())
                    .ok_or_else(|| {
                        Error::validation("index_params", "no dense vector field to index")
                    })?,
            };
            if schema.field(&field_name).is_none() {
                return Err(Error::validation(
                    "index_params",
                    format!("unknown field '{}'", field_name),
                ));
            }
            let spec = IndexSpec::from_args(
                field_name,
                index_params.get("index_name").and_then(Value::as_str),
                index_params.get("index_type").and_then(Value::as_str),
                index_params.get("metric_type").and_then(Value::as_str),
                index_params.get("params").and_then(Value::as_object),
            )?;
            indexes.retain(|existing| existing.field_name != spec.field_name);
            indexes.push(spec);
        }

        Ok(Self {
            name: name.to_string(),
            schema,
            indexes,
        })
    }
}

fn quick_setup(args: &Map<String, Value>) -> Result<(CollectionSchema, Vec<IndexSpec>)> {
    if let Some(unknown) = args
        .keys()
        .find(|k| !QUICK_SETUP_KEYS.contains(&k.as_str()) && !is_schema_flag(k))
    {
        tracing::debug!("Ignoring unknown schema key '{}'", unknown);
    }

    let str_arg = |key: &str, default: &str| -> Result<String> {
        match args.get(key) {
            None | Some(Value::Null) => Ok(default.to_string()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(Error::validation(
                "schema",
                format!("'{}' must be a string", key),
            )),
        }
    };
    let bool_arg = |key: &str, alias: &str, default: bool| -> Result<bool> {
        match args.get(key).or_else(|| args.get(alias)) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(Error::validation(
                "schema",
                format!("'{}' must be a boolean", key),
            )),
        }
    };

    let dimension = match args.get("dimension") {
        None | Some(Value::Null) => 128,
        Some(value) => value
            .as_u64()
            .and_then(|d| usize::try_from(d).ok())
            .ok_or_else(|| Error::validation("schema", "'dimension' must be a positive integer"))?,
    };
    let primary_field = str_arg("primary_field", "id")?;
    let id_type: DataType = str_arg("id_type", "INT64")?.parse()?;
    let vector_field = str_arg("vector_field", "vector")?;
    let metric: Metric = str_arg("metric_type", Metric::default().as_str())?.parse()?;
    let auto_id = bool_arg("auto_id", "autoId", false)?;
    let enable_dynamic_field = bool_arg("enable_dynamic_field", "enableDynamicField", true)?;

    let mut primary = FieldSchema::new(primary_field, id_type).primary();
    if id_type == DataType::VarChar {
        primary = primary.with_max_length(512);
    }
    let mut fields = vec![
        primary,
        FieldSchema::new(vector_field.clone(), DataType::FloatVector).with_dim(dimension),
    ];

    if let Some(other) = args.get("other_fields") {
        let other: Vec<FieldSchema> = serde_json::from_value(other.clone())
            .map_err(|e| Error::validation("schema", format!("invalid other_fields: {}", e)))?;
        fields.extend(other);
    }

    let mut indexes = vec![IndexSpec::dense(vector_field, "AUTOINDEX", metric)];
    let mut functions = Vec::new();

    if let Some(text_field) = args.get("text_field").and_then(Value::as_str) {
        let sparse_field = str_arg("sparse_field", "sparse")?;
        fields.push(FieldSchema::new(text_field, DataType::VarChar).analyzed());
        fields.push(FieldSchema::new(sparse_field.clone(), DataType::SparseFloatVector));
        functions.push(FunctionSchema {
            name: format!("{}_bm25", text_field),
            function_type: FunctionType::Bm25,
            input_field: text_field.to_string(),
            output_field: sparse_field.clone(),
        });
        indexes.push(IndexSpec::bm25(sparse_field));
    }

    Ok((
        CollectionSchema {
            fields,
            auto_id,
            enable_dynamic_field,
            functions,
            description: str_arg("description", "")?,
        },
        indexes,
    ))
}

fn is_schema_flag(key: &str) -> bool {
    matches!(
        key,
        "auto_id" | "autoId" | "enable_dynamic_field" | "enableDynamicField" | "description"
    )
}

/// Load state of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    NotExist,
    NotLoad,
    Loading,
    Loaded,
}

impl LoadState {
    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::NotExist => "not_exist",
            LoadState::NotLoad => "not_load",
            LoadState::Loading => "loading",
            LoadState::Loaded => "loaded",
        }
    }

    /// Parse the state names used by the Milvus REST API (`LoadStateLoaded`, ...)
    pub fn from_milvus(raw: &str) -> Self {
        match raw.trim_start_matches("LoadState") {
            "Loaded" => LoadState::Loaded,
            "Loading" => LoadState::Loading,
            "NotExist" => LoadState::NotExist,
            _ => LoadState::NotLoad,
        }
    }
}

/// Loading progress of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadProgress {
    /// Current state
    pub state: LoadState,
    /// Percentage loaded (0-100)
    pub progress: u8,
}

/// Collection statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    /// Number of stored entities
    pub row_count: u64,
}

/// Description of a built index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexInfo {
    /// Index definition
    #[serde(flatten)]
    pub spec: IndexSpec,
    /// Rows covered by the index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_rows: Option<u64>,
    /// Rows in the collection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<u64>,
    /// Build state reported by the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Schema plus metadata returned by describe-collection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    /// Collection name
    pub name: String,
    /// Schema
    #[serde(flatten)]
    pub schema: CollectionSchema,
    /// Current load state
    pub load_state: LoadState,
    /// Creation timestamp (RFC 3339 or backend-native)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Indexes built on the collection
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexInfo>,
}
