//! Local store backend
//!
//! An embedded SQLite database that behaves like a single-node Milvus for
//! the operations the tools use:
//! - Collections (schema JSON, load state)
//! - Entities (rows keyed by primary key)
//! - Indexes (declared per field; searches are exact)
//! - FTS5 index (BM25 scoring for text fields feeding a sparse field)

mod filter;
mod schema;
mod search;

pub use filter::Filter;
pub use schema::SCHEMA_VERSION;

use crate::backend::{Backend, MutationResult};
use crate::collection::{
    CollectionInfo, CollectionSchema, CollectionStats, CreateCollectionRequest, DataType,
    FieldSchema, IndexInfo, IndexSpec, LoadProgress, LoadState, BM25_METRIC,
};
use crate::error::{Error, Result};
use crate::search::{
    Hit, HybridSearchRequest, Metric, QueryRequest, Row, SearchRequest, TextSearchRequest,
    ALL_FIELDS,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use search::Scored;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const DENSE_INDEX_TYPES: &[&str] = &[
    "FLAT", "IVF_FLAT", "IVF_SQ8", "IVF_PQ", "HNSW", "DISKANN", "SCANN", "AUTOINDEX",
];
const SPARSE_INDEX_TYPES: &[&str] = &["SPARSE_INVERTED_INDEX", "SPARSE_WAND", "AUTOINDEX"];
const SCALAR_INDEX_TYPES: &[&str] = &["INVERTED", "STL_SORT", "TRIE", "BITMAP", "AUTOINDEX"];

/// Collection row as stored
#[derive(Debug, Clone)]
struct CollectionMeta {
    schema: CollectionSchema,
    load_state: LoadState,
    next_auto_id: i64,
    created_at: String,
}

/// The local database store
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        schema::ensure_schema(&conn)?;

        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::ensure_schema(&conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::backend("local store lock poisoned"))
    }

    // -------------------------------------------------------------------------
    // Collection operations
    // -------------------------------------------------------------------------

    /// Names of all collections, sorted
    pub fn collection_names(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Schema, load state and indexes of a collection
    pub fn describe(&self, name: &str) -> Result<CollectionInfo> {
        let conn = self.conn()?;
        let meta = load_meta(&conn, name)?;
        let indexes = list_indexes(&conn, name, None)?;
        Ok(CollectionInfo {
            name: name.to_string(),
            schema: meta.schema,
            load_state: meta.load_state,
            created_at: Some(meta.created_at),
            indexes,
        })
    }

    /// Create a collection with its initial indexes
    ///
    /// The collection is loaded right away when every vector field ends up
    /// indexed.
    pub fn create(&self, request: &CreateCollectionRequest) -> Result<()> {
        request.schema.validate()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM collections WHERE name = ?1",
            [&request.name],
            |row| row.get(0),
        )?;
        if exists {
            return Err(Error::backend(format!(
                "collection '{}' already exists",
                request.name
            )));
        }

        let now = Utc::now().to_rfc3339();
        let schema_json = serde_json::to_string(&request.schema)?;
        tx.execute(
            "INSERT INTO collections (name, schema, load_state, replicas, next_auto_id, created_at)
             VALUES (?1, ?2, ?3, 0, 1, ?4)",
            params![request.name, schema_json, LoadState::NotLoad.as_str(), now],
        )?;

        for index in &request.indexes {
            add_index(&tx, &request.name, &request.schema, index)?;
        }

        if all_vectors_indexed(&tx, &request.name, &request.schema)? {
            set_load_state(&tx, &request.name, LoadState::Loaded, 1)?;
        }

        tx.commit()?;
        tracing::debug!("Created collection '{}'", request.name);
        Ok(())
    }

    /// Mark a collection as loaded
    pub fn load(&self, name: &str, replicas: u32) -> Result<()> {
        if replicas == 0 {
            return Err(Error::backend("replica number must be at least 1"));
        }
        let conn = self.conn()?;
        let meta = load_meta(&conn, name)?;
        let indexed = indexed_fields(&conn, name)?;
        if let Some(field) = meta
            .schema
            .vector_fields()
            .find(|f| !indexed.contains(&f.name))
        {
            return Err(Error::backend(format!(
                "there is no vector index on field '{}' of collection '{}', create an index first",
                field.name, name
            )));
        }
        set_load_state(&conn, name, LoadState::Loaded, replicas)
    }

    /// Mark a collection as released
    pub fn release(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        load_meta(&conn, name)?;
        set_load_state(&conn, name, LoadState::NotLoad, 0)
    }

    /// Current load state; unknown collections report `not_exist`
    pub fn load_progress(&self, name: &str) -> Result<LoadProgress> {
        let conn = self.conn()?;
        let state: Option<String> = conn
            .query_row(
                "SELECT load_state FROM collections WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        let state = state
            .map(|s| parse_load_state(&s))
            .unwrap_or(LoadState::NotExist);
        Ok(LoadProgress {
            state,
            progress: if state == LoadState::Loaded { 100 } else { 0 },
        })
    }

    /// Row count of a collection
    pub fn stats(&self, name: &str) -> Result<CollectionStats> {
        let conn = self.conn()?;
        load_meta(&conn, name)?;
        Ok(CollectionStats {
            row_count: row_count(&conn, name)?,
        })
    }

    // -------------------------------------------------------------------------
    // Entity operations
    // -------------------------------------------------------------------------

    /// Insert or upsert rows in one transaction
    ///
    /// Every row is checked against the schema before anything is written;
    /// a failing row rejects the whole call.
    pub fn write_rows(&self, collection: &str, rows: Vec<Row>, upsert: bool) -> Result<MutationResult> {
        let mut conn = self.conn()?;
        let meta = load_meta(&conn, collection)?;
        let mut next_auto_id = meta.next_auto_id;

        let mut prepared = Vec::with_capacity(rows.len());
        for (i, row) in rows.into_iter().enumerate() {
            let entry = prepare_row(&meta.schema, row, upsert, &mut next_auto_id)
                .map_err(|msg| Error::backend(format!("row {}: {}", i, msg)))?;
            prepared.push(entry);
        }

        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(prepared.len());
        for (pk, row) in &prepared {
            let key = pk_key(pk);
            if upsert {
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM entities WHERE collection = ?1 AND pk = ?2",
                        params![collection, key],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(entity_id) = existing {
                    remove_entity(&tx, collection, entity_id)?;
                }
            }

            let data = serde_json::to_string(row)?;
            let inserted = tx.execute(
                "INSERT INTO entities (collection, pk, data) VALUES (?1, ?2, ?3)",
                params![collection, key, data],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(Error::backend(format!(
                        "duplicate primary key {} in collection '{}'",
                        key, collection
                    )));
                }
                Err(e) => return Err(e.into()),
            }
            let entity_id = tx.last_insert_rowid();

            for function in &meta.schema.functions {
                if let Some(Value::String(text)) = row.get(&function.input_field) {
                    tx.execute(
                        "INSERT INTO entities_fts (collection, field, entity_id, body)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![collection, function.output_field, entity_id, text],
                    )?;
                }
            }
            ids.push(pk.clone());
        }

        if next_auto_id != meta.next_auto_id {
            tx.execute(
                "UPDATE collections SET next_auto_id = ?1 WHERE name = ?2",
                params![next_auto_id, collection],
            )?;
        }
        tx.commit()?;

        Ok(MutationResult {
            count: ids.len() as u64,
            ids,
        })
    }

    /// Delete rows matching a filter expression
    pub fn delete_where(&self, collection: &str, filter: &str) -> Result<u64> {
        let filter = Filter::parse(filter)?;
        let mut conn = self.conn()?;
        load_meta(&conn, collection)?;

        let doomed: Vec<i64> = load_rows(&conn, collection)?
            .into_iter()
            .filter(|(_, row)| filter.matches(row))
            .map(|(id, _)| id)
            .collect();

        let tx = conn.transaction()?;
        for entity_id in &doomed {
            remove_entity(&tx, collection, *entity_id)?;
        }
        tx.commit()?;

        Ok(doomed.len() as u64)
    }

    /// Rows matching a filter, in insertion order
    pub fn query_rows(&self, request: &QueryRequest) -> Result<Vec<Row>> {
        let filter = Filter::parse(&request.filter)?;
        let conn = self.conn()?;
        let meta = load_meta(&conn, &request.collection)?;
        require_loaded(&meta, &request.collection)?;

        let matching = load_rows(&conn, &request.collection)?
            .into_iter()
            .filter(|(_, row)| filter.matches(row));

        if request.output_fields.len() == 1 && request.output_fields[0] == "count(*)" {
            let mut row = Row::new();
            row.insert("count(*)".to_string(), Value::from(matching.count() as u64));
            return Ok(vec![row]);
        }

        let pk = primary_name(&meta.schema)?;
        Ok(matching
            .take(request.limit)
            .map(|(_, row)| project(&row, &request.output_fields, pk))
            .collect())
    }

    /// Count rows matching an optional filter
    pub fn count_rows(&self, collection: &str, filter: Option<&str>) -> Result<u64> {
        let filter = Filter::parse_opt(filter)?;
        let conn = self.conn()?;
        let meta = load_meta(&conn, collection)?;
        require_loaded(&meta, collection)?;

        if filter.is_empty() {
            return row_count(&conn, collection);
        }
        Ok(load_rows(&conn, collection)?
            .iter()
            .filter(|(_, row)| filter.matches(row))
            .count() as u64)
    }

    // -------------------------------------------------------------------------
    // Search operations
    // -------------------------------------------------------------------------

    /// Exact dense search; one hit list per query vector
    pub fn dense_search(&self, request: &SearchRequest) -> Result<Vec<Vec<Hit>>> {
        let filter = Filter::parse_opt(request.filter.as_deref())?;
        let conn = self.conn()?;
        let meta = load_meta(&conn, &request.collection)?;
        require_loaded(&meta, &request.collection)?;
        check_metric(&conn, &request.collection, &request.anns_field, request.metric)?;

        let rows = load_rows(&conn, &request.collection)?;
        let by_id: HashMap<i64, &Row> = rows.iter().map(|(id, row)| (*id, row)).collect();
        let pk = primary_name(&meta.schema)?;

        request
            .vectors
            .iter()
            .map(|vector| {
                let ranked = dense_ranking(
                    &meta.schema,
                    &rows,
                    &filter,
                    &request.anns_field,
                    request.metric,
                    vector,
                    request.limit,
                )?;
                Ok(to_hits(&ranked, &by_id, &request.output_fields, pk))
            })
            .collect()
    }

    /// BM25 search over a function-generated sparse field
    pub fn bm25_search(&self, request: &TextSearchRequest) -> Result<Vec<Hit>> {
        let filter = Filter::parse_opt(request.filter.as_deref())?;
        let conn = self.conn()?;
        let meta = load_meta(&conn, &request.collection)?;
        require_loaded(&meta, &request.collection)?;
        check_bm25_field(&meta.schema, &request.collection, &request.anns_field)?;

        let rows = load_rows(&conn, &request.collection)?;
        let by_id: HashMap<i64, &Row> = rows.iter().map(|(id, row)| (*id, row)).collect();
        let ranked = text_ranking(
            &conn,
            &request.collection,
            &request.anns_field,
            &request.text,
            request.drop_ratio,
            &by_id,
            &filter,
            request.limit,
        )?;

        let pk = primary_name(&meta.schema)?;
        Ok(to_hits(&ranked, &by_id, &request.output_fields, pk))
    }

    /// Dense + BM25 search fused into one ranking
    pub fn fused_search(&self, request: &HybridSearchRequest) -> Result<Vec<Hit>> {
        let filter = Filter::parse_opt(request.filter.as_deref())?;
        let conn = self.conn()?;
        let meta = load_meta(&conn, &request.collection)?;
        require_loaded(&meta, &request.collection)?;
        check_metric(
            &conn,
            &request.collection,
            &request.dense.anns_field,
            request.dense.metric,
        )?;
        check_bm25_field(&meta.schema, &request.collection, &request.sparse.anns_field)?;

        let rows = load_rows(&conn, &request.collection)?;
        let by_id: HashMap<i64, &Row> = rows.iter().map(|(id, row)| (*id, row)).collect();

        let dense = dense_ranking(
            &meta.schema,
            &rows,
            &filter,
            &request.dense.anns_field,
            request.dense.metric,
            &request.dense.vector,
            request.limit,
        )?;
        let sparse = text_ranking(
            &conn,
            &request.collection,
            &request.sparse.anns_field,
            &request.sparse.text,
            request.sparse.drop_ratio,
            &by_id,
            &filter,
            request.limit,
        )?;

        let fused = search::fuse(
            &dense,
            request.dense.metric,
            &sparse,
            request.ranker,
            request.limit,
        );
        let pk = primary_name(&meta.schema)?;
        Ok(to_hits(&fused, &by_id, &request.output_fields, pk))
    }

    // -------------------------------------------------------------------------
    // Index operations
    // -------------------------------------------------------------------------

    /// Declare an index on a field
    pub fn add_index(&self, collection: &str, index: &IndexSpec) -> Result<()> {
        let conn = self.conn()?;
        let meta = load_meta(&conn, collection)?;
        add_index(&conn, collection, &meta.schema, index)
    }

    /// Indexes of a collection, optionally for one field
    pub fn indexes(&self, collection: &str, field: Option<&str>) -> Result<Vec<IndexInfo>> {
        let conn = self.conn()?;
        load_meta(&conn, collection)?;
        list_indexes(&conn, collection, field)
    }
}

#[async_trait]
impl Backend for Store {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.collection_names()
    }

    async fn describe_collection(&self, name: &str) -> Result<CollectionInfo> {
        self.describe(name)
    }

    async fn create_collection(&self, request: &CreateCollectionRequest) -> Result<()> {
        self.create(request)
    }

    async fn load_collection(&self, name: &str, replicas: u32) -> Result<()> {
        self.load(name, replicas)
    }

    async fn release_collection(&self, name: &str) -> Result<()> {
        self.release(name)
    }

    async fn load_state(&self, name: &str) -> Result<LoadProgress> {
        self.load_progress(name)
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats> {
        self.stats(name)
    }

    async fn insert(&self, collection: &str, rows: Vec<Row>) -> Result<MutationResult> {
        self.write_rows(collection, rows, false)
    }

    async fn upsert(&self, collection: &str, rows: Vec<Row>) -> Result<MutationResult> {
        self.write_rows(collection, rows, true)
    }

    async fn delete(&self, collection: &str, filter: &str) -> Result<Option<u64>> {
        self.delete_where(collection, filter).map(Some)
    }

    async fn query(&self, request: &QueryRequest) -> Result<Vec<Row>> {
        self.query_rows(request)
    }

    async fn count(&self, collection: &str, filter: Option<&str>) -> Result<u64> {
        self.count_rows(collection, filter)
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Vec<Hit>>> {
        self.dense_search(request)
    }

    async fn text_search(&self, request: &TextSearchRequest) -> Result<Vec<Hit>> {
        self.bm25_search(request)
    }

    async fn hybrid_search(&self, request: &HybridSearchRequest) -> Result<Vec<Hit>> {
        self.fused_search(request)
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<()> {
        self.add_index(collection, index)
    }

    async fn describe_indexes(
        &self,
        collection: &str,
        field: Option<&str>,
    ) -> Result<Vec<IndexInfo>> {
        self.indexes(collection, field)
    }
}

// -------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------

fn load_meta(conn: &Connection, name: &str) -> Result<CollectionMeta> {
    let row: Option<(String, String, i64, String)> = conn
        .query_row(
            "SELECT schema, load_state, next_auto_id, created_at FROM collections WHERE name = ?1",
            [name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let (schema_json, load_state, next_auto_id, created_at) =
        row.ok_or_else(|| Error::backend(format!("collection '{}' does not exist", name)))?;

    Ok(CollectionMeta {
        schema: serde_json::from_str(&schema_json)?,
        load_state: parse_load_state(&load_state),
        next_auto_id,
        created_at,
    })
}

fn parse_load_state(raw: &str) -> LoadState {
    match raw {
        "loaded" => LoadState::Loaded,
        "loading" => LoadState::Loading,
        "not_exist" => LoadState::NotExist,
        _ => LoadState::NotLoad,
    }
}

fn set_load_state(conn: &Connection, name: &str, state: LoadState, replicas: u32) -> Result<()> {
    conn.execute(
        "UPDATE collections SET load_state = ?1, replicas = ?2 WHERE name = ?3",
        params![state.as_str(), replicas, name],
    )?;
    Ok(())
}

fn require_loaded(meta: &CollectionMeta, name: &str) -> Result<()> {
    if meta.load_state != LoadState::Loaded {
        return Err(Error::backend(format!("collection '{}' not loaded", name)));
    }
    Ok(())
}

fn primary_name(schema: &CollectionSchema) -> Result<&str> {
    schema
        .primary_field()
        .map(|f| f.name.as_str())
        .ok_or_else(|| Error::backend("stored schema has no primary field"))
}

fn row_count(conn: &Connection, collection: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM entities WHERE collection = ?1",
        [collection],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn load_rows(conn: &Connection, collection: &str) -> Result<Vec<(i64, Row)>> {
    let mut stmt = conn.prepare("SELECT id, data FROM entities WHERE collection = ?1 ORDER BY id")?;
    let raw = stmt
        .query_map([collection], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(id, data)| Ok((id, serde_json::from_str::<Row>(&data)?)))
        .collect()
}

fn remove_entity(conn: &Connection, collection: &str, entity_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM entities_fts WHERE collection = ?1 AND entity_id = ?2",
        params![collection, entity_id],
    )?;
    conn.execute("DELETE FROM entities WHERE id = ?1", [entity_id])?;
    Ok(())
}

fn pk_key(pk: &Value) -> String {
    match pk {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Check a row against the schema, assigning an auto id when needed
fn prepare_row(
    schema: &CollectionSchema,
    mut row: Row,
    upsert: bool,
    next_auto_id: &mut i64,
) -> std::result::Result<(Value, Row), String> {
    let pk_field = schema
        .primary_field()
        .ok_or_else(|| "schema has no primary field".to_string())?;

    if schema.auto_id && !upsert {
        if row.contains_key(&pk_field.name) {
            return Err(format!(
                "primary field '{}' is auto-generated and must not be provided",
                pk_field.name
            ));
        }
        row.insert(pk_field.name.clone(), Value::from(*next_auto_id));
        *next_auto_id += 1;
    }

    for field in &schema.fields {
        if schema.is_function_output(&field.name) {
            if row.contains_key(&field.name) {
                return Err(format!(
                    "field '{}' is generated by a function and must not be provided",
                    field.name
                ));
            }
            continue;
        }
        let value = row
            .get(&field.name)
            .ok_or_else(|| format!("missing field '{}'", field.name))?;
        check_value(field, value)?;
    }

    if !schema.enable_dynamic_field {
        if let Some(extra) = row.keys().find(|k| schema.field(k).is_none()) {
            return Err(format!(
                "field '{}' is not in the schema and dynamic fields are disabled",
                extra
            ));
        }
    }

    let pk = row
        .get(&pk_field.name)
        .cloned()
        .ok_or_else(|| format!("missing primary field '{}'", pk_field.name))?;
    Ok((pk, row))
}

fn check_value(field: &FieldSchema, value: &Value) -> std::result::Result<(), String> {
    let mismatch = || {
        format!(
            "field '{}' expects {}, got {}",
            field.name, field.data_type, value
        )
    };

    match field.data_type {
        DataType::Bool if !value.is_boolean() => return Err(mismatch()),
        DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
            let v = value.as_i64().ok_or_else(mismatch)?;
            let (min, max) = match field.data_type {
                DataType::Int8 => (i64::from(i8::MIN), i64::from(i8::MAX)),
                DataType::Int16 => (i64::from(i16::MIN), i64::from(i16::MAX)),
                DataType::Int32 => (i64::from(i32::MIN), i64::from(i32::MAX)),
                _ => (i64::MIN, i64::MAX),
            };
            if v < min || v > max {
                return Err(format!(
                    "value {} is out of range for {} field '{}'",
                    v, field.data_type, field.name
                ));
            }
        }
        DataType::Float | DataType::Double if !value.is_number() => return Err(mismatch()),
        DataType::VarChar => {
            let s = value.as_str().ok_or_else(mismatch)?;
            if let Some(max) = field.max_length {
                if s.chars().count() > max {
                    return Err(format!(
                        "field '{}' exceeds max_length {}",
                        field.name, max
                    ));
                }
            }
        }
        DataType::FloatVector => {
            let vector = search::vector_of(value).ok_or_else(mismatch)?;
            if let Some(dim) = field.dim {
                if vector.len() != dim {
                    return Err(format!(
                        "field '{}' expects a vector of dimension {}, got {}",
                        field.name,
                        dim,
                        vector.len()
                    ));
                }
            }
        }
        DataType::SparseFloatVector if !value.is_object() => return Err(mismatch()),
        _ => {}
    }
    Ok(())
}

/// Copy the requested output fields; the primary key is always included
fn project(row: &Row, output_fields: &[String], pk: &str) -> Row {
    if output_fields.iter().any(|f| f == ALL_FIELDS) {
        return row.clone();
    }
    let mut out = Map::new();
    if let Some(value) = row.get(pk) {
        out.insert(pk.to_string(), value.clone());
    }
    for field in output_fields {
        if let Some(value) = row.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

fn to_hits(
    ranked: &[Scored],
    by_id: &HashMap<i64, &Row>,
    output_fields: &[String],
    pk: &str,
) -> Vec<Hit> {
    ranked
        .iter()
        .filter_map(|(id, score)| {
            by_id.get(id).map(|row| Hit {
                score: *score,
                fields: project(row, output_fields, pk),
            })
        })
        .collect()
}

fn dense_ranking(
    schema: &CollectionSchema,
    rows: &[(i64, Row)],
    filter: &Filter,
    field_name: &str,
    metric: Metric,
    query: &[f32],
    limit: usize,
) -> Result<Vec<Scored>> {
    let field = schema
        .field(field_name)
        .filter(|f| f.data_type == DataType::FloatVector)
        .ok_or_else(|| {
            Error::backend(format!("field '{}' is not a float vector field", field_name))
        })?;
    if let Some(dim) = field.dim {
        if dim != query.len() {
            return Err(Error::backend(format!(
                "vector dimension mismatch: field '{}' has dimension {}, query has {}",
                field_name,
                dim,
                query.len()
            )));
        }
    }

    let mut scored: Vec<Scored> = rows
        .iter()
        .filter(|(_, row)| filter.matches(row))
        .filter_map(|(id, row)| {
            let candidate = search::vector_of(row.get(field_name)?)?;
            Some((*id, search::score(metric, query, &candidate)))
        })
        .collect();
    search::rank(&mut scored, metric);
    scored.truncate(limit);
    Ok(scored)
}

#[allow(clippy::too_many_arguments)]
fn text_ranking(
    conn: &Connection,
    collection: &str,
    field: &str,
    text: &str,
    drop_ratio: f64,
    by_id: &HashMap<i64, &Row>,
    filter: &Filter,
    limit: usize,
) -> Result<Vec<Scored>> {
    let terms = search::query_terms(text);
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM entities_fts WHERE collection = ?1 AND field = ?2",
        params![collection, field],
        |row| row.get(0),
    )?;

    let mut weighted = Vec::with_capacity(terms.len());
    for term in terms {
        let df: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entities_fts
             WHERE entities_fts MATCH ?1 AND collection = ?2 AND field = ?3",
            params![search::match_any(std::slice::from_ref(&term)), collection, field],
            |row| row.get(0),
        )?;
        weighted.push((term, df as u64));
    }
    let kept = search::drop_terms(weighted, total as u64, drop_ratio);

    let mut stmt = conn.prepare(
        "SELECT entity_id, -bm25(entities_fts) AS score FROM entities_fts
         WHERE entities_fts MATCH ?1 AND collection = ?2 AND field = ?3
         ORDER BY score DESC, entity_id ASC",
    )?;
    let hits = stmt
        .query_map(params![search::match_any(&kept), collection, field], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<Scored>, _>>()?;

    Ok(hits
        .into_iter()
        .filter(|(id, _)| by_id.get(id).is_some_and(|row| filter.matches(row)))
        .take(limit)
        .collect())
}

fn check_bm25_field(schema: &CollectionSchema, collection: &str, field: &str) -> Result<()> {
    if schema.bm25_function(field).is_none() {
        return Err(Error::capability(format!(
            "field '{}' of collection '{}' is not generated by a BM25 function",
            field, collection
        )));
    }
    Ok(())
}

fn check_metric(conn: &Connection, collection: &str, field: &str, metric: Metric) -> Result<()> {
    let indexed: Option<String> = conn
        .query_row(
            "SELECT metric_type FROM indexes WHERE collection = ?1 AND field_name = ?2",
            params![collection, field],
            |row| row.get(0),
        )
        .optional()?;
    match indexed {
        Some(indexed) if indexed != metric.as_str() => Err(Error::backend(format!(
            "metric type not match: index on '{}' uses {}, search requested {}",
            field, indexed, metric
        ))),
        _ => Ok(()),
    }
}

fn indexed_fields(conn: &Connection, collection: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT field_name FROM indexes WHERE collection = ?1")?;
    let fields = stmt
        .query_map([collection], |row| row.get(0))?
        .collect::<std::result::Result<HashSet<String>, _>>()?;
    Ok(fields)
}

fn all_vectors_indexed(conn: &Connection, collection: &str, schema: &CollectionSchema) -> Result<bool> {
    let indexed = indexed_fields(conn, collection)?;
    Ok(schema.vector_fields().all(|f| indexed.contains(&f.name)))
}

fn add_index(
    conn: &Connection,
    collection: &str,
    schema: &CollectionSchema,
    index: &IndexSpec,
) -> Result<()> {
    let field = schema.field(&index.field_name).ok_or_else(|| {
        Error::backend(format!(
            "field '{}' does not exist in collection '{}'",
            index.field_name, collection
        ))
    })?;

    let index_type = index.index_type.to_uppercase();
    let metric_type = index.metric_type.to_uppercase();
    match field.data_type {
        DataType::FloatVector => {
            if !DENSE_INDEX_TYPES.contains(&index_type.as_str()) {
                return Err(Error::backend(format!(
                    "index type {} is not supported for FloatVector field '{}'",
                    index_type, field.name
                )));
            }
            metric_type
                .parse::<Metric>()
                .map_err(|_| Error::backend(format!("metric type {} is not supported for FloatVector", metric_type)))?;
        }
        DataType::SparseFloatVector => {
            if !SPARSE_INDEX_TYPES.contains(&index_type.as_str()) {
                return Err(Error::backend(format!(
                    "index type {} is not supported for SparseFloatVector field '{}'",
                    index_type, field.name
                )));
            }
            let expected = if schema.bm25_function(&field.name).is_some() {
                BM25_METRIC
            } else {
                "IP"
            };
            if metric_type != expected {
                return Err(Error::backend(format!(
                    "sparse field '{}' requires metric {}, got {}",
                    field.name, expected, metric_type
                )));
            }
        }
        _ => {
            if !SCALAR_INDEX_TYPES.contains(&index_type.as_str()) {
                return Err(Error::backend(format!(
                    "index type {} is not supported for scalar field '{}'",
                    index_type, field.name
                )));
            }
        }
    }

    let params_json = serde_json::to_string(&index.params)?;
    let existing: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT index_name, index_type, metric_type, params FROM indexes
             WHERE collection = ?1 AND field_name = ?2",
            params![collection, index.field_name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    if let Some((name, existing_type, existing_metric, existing_params)) = existing {
        if name == index.index_name
            && existing_type == index_type
            && existing_metric == metric_type
            && existing_params == params_json
        {
            return Ok(());
        }
        return Err(Error::backend(format!(
            "at most one distinct index is allowed per field; '{}' already has index '{}'",
            index.field_name, name
        )));
    }

    let inserted = conn.execute(
        "INSERT INTO indexes (collection, index_name, field_name, index_type, metric_type, params, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            collection,
            index.index_name,
            index.field_name,
            index_type,
            metric_type,
            params_json,
            Utc::now().to_rfc3339()
        ],
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::backend(format!(
                "index name '{}' already exists in collection '{}'",
                index.index_name, collection
            )))
        }
        Err(e) => Err(e.into()),
    }
}

fn list_indexes(conn: &Connection, collection: &str, field: Option<&str>) -> Result<Vec<IndexInfo>> {
    let total = row_count(conn, collection)?;
    let mut stmt = conn.prepare(
        "SELECT field_name, index_name, index_type, metric_type, params FROM indexes
         WHERE collection = ?1 AND (?2 IS NULL OR field_name = ?2)
         ORDER BY created_at, index_name",
    )?;
    let raw = stmt
        .query_map(params![collection, field], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(field_name, index_name, index_type, metric_type, params)| {
            Ok(IndexInfo {
                spec: IndexSpec {
                    field_name,
                    index_name,
                    index_type,
                    metric_type,
                    params: serde_json::from_str(&params)?,
                },
                indexed_rows: Some(total),
                total_rows: Some(total),
                state: Some("Finished".to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{QueryBuilder, SearchOptions};
    use serde_json::json;

    fn create(store: &Store, name: &str, schema: Value) {
        let request =
            CreateCollectionRequest::from_args(name, schema.as_object().unwrap(), None).unwrap();
        store.create(&request).unwrap();
    }

    fn rows(value: Value) -> Vec<Row> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_open_memory() {
        let store = Store::open_memory().unwrap();
        assert!(store.collection_names().unwrap().is_empty());
    }

    #[test]
    fn test_collection_lifecycle() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2}));

        assert_eq!(store.collection_names().unwrap(), vec!["docs"]);
        assert_eq!(store.load_progress("docs").unwrap().state, LoadState::Loaded);

        store.release("docs").unwrap();
        assert_eq!(store.load_progress("docs").unwrap().state, LoadState::NotLoad);
        assert_eq!(store.load_progress("nope").unwrap().state, LoadState::NotExist);

        let request =
            CreateCollectionRequest::from_args("docs", &Map::new(), None).unwrap();
        let err = store.create(&request).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_load_requires_vector_index() {
        let store = Store::open_memory().unwrap();
        let request = CreateCollectionRequest::from_args(
            "raw",
            json!({"fields": [
                {"name": "id", "type": "INT64", "is_primary": true},
                {"name": "v", "type": "FLOAT_VECTOR", "dim": 2}
            ]})
            .as_object()
            .unwrap(),
            None,
        )
        .unwrap();
        store.create(&request).unwrap();
        assert_eq!(store.load_progress("raw").unwrap().state, LoadState::NotLoad);

        let err = store.load("raw", 1).unwrap_err();
        assert!(err.to_string().contains("no vector index"));

        store
            .add_index("raw", &IndexSpec::dense("v", "IVF_FLAT", Metric::L2))
            .unwrap();
        store.load("raw", 1).unwrap();
        assert_eq!(store.load_progress("raw").unwrap().progress, 100);
    }

    #[test]
    fn test_insert_validates_rows() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2, "enable_dynamic_field": false}));

        let err = store
            .write_rows("docs", rows(json!([{"id": 1, "vector": [1.0]}])), false)
            .unwrap_err();
        assert!(err.to_string().contains("dimension 2"));

        let err = store
            .write_rows("docs", rows(json!([{"id": 1, "vector": [1.0, 0.0], "x": 1}])), false)
            .unwrap_err();
        assert!(err.to_string().contains("dynamic fields are disabled"));

        let err = store
            .write_rows("docs", rows(json!([{"id": "a", "vector": [1.0, 0.0]}])), false)
            .unwrap_err();
        assert!(err.to_string().contains("expects Int64"));

        assert_eq!(store.stats("docs").unwrap().row_count, 0);
    }

    #[test]
    fn test_duplicate_primary_key_rejects_chunk() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2}));

        store
            .write_rows("docs", rows(json!([{"id": 1, "vector": [1.0, 0.0]}])), false)
            .unwrap();
        let err = store
            .write_rows(
                "docs",
                rows(json!([
                    {"id": 2, "vector": [0.0, 1.0]},
                    {"id": 1, "vector": [1.0, 1.0]}
                ])),
                false,
            )
            .unwrap_err();
        assert!(err.to_string().contains("duplicate primary key 1"));
        // the whole call rolled back
        assert_eq!(store.stats("docs").unwrap().row_count, 1);
    }

    #[test]
    fn test_upsert_replaces_rows() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2}));
        store
            .write_rows("docs", rows(json!([{"id": 1, "vector": [1.0, 0.0], "tag": "old"}])), false)
            .unwrap();
        store
            .write_rows("docs", rows(json!([{"id": 1, "vector": [1.0, 0.0], "tag": "new"}])), true)
            .unwrap();

        let request = QueryBuilder::default().query("docs", "id == 1", None, 10);
        let found = store.query_rows(&request).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["tag"], json!("new"));
    }

    #[test]
    fn test_auto_id() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2, "auto_id": true}));

        let result = store
            .write_rows(
                "docs",
                rows(json!([{"vector": [1.0, 0.0]}, {"vector": [0.0, 1.0]}])),
                false,
            )
            .unwrap();
        assert_eq!(result.ids, vec![json!(1), json!(2)]);

        let err = store
            .write_rows("docs", rows(json!([{"id": 9, "vector": [1.0, 0.0]}])), false)
            .unwrap_err();
        assert!(err.to_string().contains("auto-generated"));
    }

    #[test]
    fn test_query_count_delete() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2}));
        store
            .write_rows(
                "docs",
                rows(json!([
                    {"id": 1, "vector": [1.0, 0.0], "year": 1999},
                    {"id": 2, "vector": [0.0, 1.0], "year": 2005},
                    {"id": 3, "vector": [1.0, 1.0], "year": 2021}
                ])),
                false,
            )
            .unwrap();

        assert_eq!(store.count_rows("docs", None).unwrap(), 3);
        assert_eq!(store.count_rows("docs", Some("year > 2000")).unwrap(), 2);

        let request = QueryBuilder::default().query(
            "docs",
            "year > 2000",
            Some(vec!["year".to_string()]),
            10,
        );
        let found = store.query_rows(&request).unwrap();
        assert_eq!(found, rows(json!([{"id": 2, "year": 2005}, {"id": 3, "year": 2021}])));

        assert_eq!(store.delete_where("docs", "id in [1, 3]").unwrap(), 2);
        assert_eq!(store.count_rows("docs", None).unwrap(), 1);
    }

    #[test]
    fn test_search_requires_loaded() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2}));
        store.release("docs").unwrap();

        let request = QueryBuilder::default()
            .search("docs", vec![1.0, 0.0], SearchOptions::default())
            .unwrap();
        let err = store.dense_search(&request).unwrap_err();
        assert!(err.to_string().contains("not loaded"));
    }

    #[test]
    fn test_search_metric_must_match_index() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2, "metric_type": "L2"}));

        let request = QueryBuilder::default()
            .search("docs", vec![1.0, 0.0], SearchOptions::default())
            .unwrap();
        let err = store.dense_search(&request).unwrap_err();
        assert!(err.to_string().contains("metric type not match"));
    }

    #[test]
    fn test_l2_search_ascending() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2, "metric_type": "L2"}));
        store
            .write_rows(
                "docs",
                rows(json!([
                    {"id": 1, "vector": [5.0, 5.0]},
                    {"id": 2, "vector": [0.1, 0.0]},
                    {"id": 3, "vector": [1.0, 1.0]}
                ])),
                false,
            )
            .unwrap();

        let options = SearchOptions {
            metric: Metric::L2,
            limit: 2,
            ..Default::default()
        };
        let request = QueryBuilder::default()
            .search("docs", vec![0.0, 0.0], options)
            .unwrap();
        let hits = store.dense_search(&request).unwrap().remove(0);

        let ids: Vec<&Value> = hits.iter().map(|h| &h.fields["id"]).collect();
        assert_eq!(ids, vec![&json!(2), &json!(3)]);
        assert!(hits[0].score < hits[1].score);
    }

    #[test]
    fn test_text_search() {
        let store = Store::open_memory().unwrap();
        create(&store, "articles", json!({"dimension": 2, "text_field": "text"}));
        store
            .write_rows(
                "articles",
                rows(json!([
                    {"id": 1, "vector": [1.0, 0.0], "text": "Milvus is a vector database"},
                    {"id": 2, "vector": [0.0, 1.0], "text": "Rust is a systems language"},
                    {"id": 3, "vector": [1.0, 1.0], "text": "Vector search in Rust with Milvus"}
                ])),
                false,
            )
            .unwrap();

        let request = TextSearchRequest {
            collection: "articles".to_string(),
            text: "milvus".to_string(),
            anns_field: "sparse".to_string(),
            limit: 5,
            drop_ratio: 0.0,
            filter: None,
            output_fields: vec!["text".to_string()],
        };
        let hits = store.bm25_search(&request).unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.fields["id"].as_i64().unwrap()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1) && ids.contains(&3));
        assert!(hits.iter().all(|h| h.score > 0.0));
    }

    #[test]
    fn test_text_search_requires_bm25_field() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2}));

        let request = TextSearchRequest {
            collection: "docs".to_string(),
            text: "anything".to_string(),
            anns_field: "sparse".to_string(),
            limit: 5,
            drop_ratio: 0.2,
            filter: None,
            output_fields: vec!["*".to_string()],
        };
        let err = store.bm25_search(&request).unwrap_err();
        assert!(matches!(err, Error::Capability(_)));
    }

    #[test]
    fn test_index_conflicts() {
        let store = Store::open_memory().unwrap();
        create(&store, "docs", json!({"dimension": 2}));

        // same definition as quick setup is a no-op
        store
            .add_index("docs", &IndexSpec::dense("vector", "AUTOINDEX", Metric::Cosine))
            .unwrap();

        let err = store
            .add_index("docs", &IndexSpec::dense("vector", "HNSW", Metric::Cosine))
            .unwrap_err();
        assert!(err.to_string().contains("at most one distinct index"));

        let indexes = store.indexes("docs", Some("vector")).unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].spec.index_type, "AUTOINDEX");
        assert!(store.indexes("docs", Some("other")).unwrap().is_empty());
    }
}
