//! Batched insert/upsert
//!
//! A [`MutationBatch`] holds row-aligned data for one collection. The
//! [`BatchCoordinator`] splits it into consecutive chunks and submits them
//! one at a time, stopping at the first failure. Chunks committed before the
//! failure stay committed and are listed in the [`BatchReport`].

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::search::Row;
use serde::Serialize;
use serde_json::Value;

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Insert,
    Upsert,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Insert => "insert",
            MutationKind::Upsert => "upsert",
        }
    }
}

/// Row-aligned data destined for one collection
#[derive(Debug, Clone, PartialEq)]
pub struct MutationBatch {
    collection: String,
    rows: Vec<Row>,
}

impl MutationBatch {
    /// Accept either column-oriented (`{field: [values]}`) or row-oriented (`[{..}, ..]`) data
    pub fn from_value(collection: impl Into<String>, data: &Value) -> Result<Self> {
        match data {
            Value::Object(columns) => Self::from_columns(collection, columns),
            Value::Array(rows) => Self::from_rows(collection, rows),
            _ => Err(Error::validation(
                "data",
                "expected a mapping of field to values or a list of rows",
            )),
        }
    }

    /// Build from a mapping of field name to equally long value lists
    pub fn from_columns(
        collection: impl Into<String>,
        columns: &serde_json::Map<String, Value>,
    ) -> Result<Self> {
        let mut expected: Option<(&str, usize)> = None;
        for (field, values) in columns {
            let values = values.as_array().ok_or_else(|| {
                Error::validation("data", format!("column '{}' is not a list", field))
            })?;
            match expected {
                None => expected = Some((field.as_str(), values.len())),
                Some((first, len)) if len != values.len() => {
                    return Err(Error::validation(
                        "data",
                        format!(
                            "column '{}' has {} values but column '{}' has {}",
                            field,
                            values.len(),
                            first,
                            len
                        ),
                    ));
                }
                Some(_) => {}
            }
        }

        let row_count = expected.map(|(_, len)| len).unwrap_or(0);
        if row_count == 0 {
            return Err(Error::validation("data", "no rows to write"));
        }

        let mut rows: Vec<Row> = (0..row_count).map(|_| Row::new()).collect();
        for (field, values) in columns {
            if let Value::Array(values) = values {
                for (row, value) in rows.iter_mut().zip(values) {
                    row.insert(field.clone(), value.clone());
                }
            }
        }

        Ok(Self {
            collection: collection.into(),
            rows,
        })
    }

    /// Build from a list of row mappings
    pub fn from_rows(collection: impl Into<String>, rows: &[Value]) -> Result<Self> {
        if rows.is_empty() {
            return Err(Error::validation("data", "no rows to write"));
        }
        let rows = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.as_object()
                    .cloned()
                    .ok_or_else(|| Error::validation("data", format!("row {} is not a mapping", i)))
            })
            .collect::<Result<Vec<Row>>>()?;

        Ok(Self {
            collection: collection.into(),
            rows,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consecutive chunks of at most `size` rows, in row order
    pub fn chunks(&self, size: usize) -> std::slice::Chunks<'_, Row> {
        self.rows.chunks(size.max(1))
    }
}

/// What happened to one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Committed,
    Failed,
    NotAttempted,
}

/// Per-chunk outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkOutcome {
    /// Zero-based chunk index
    pub index: usize,
    /// Offset of the chunk's first row in the batch
    pub start_row: usize,
    /// Rows in the chunk
    pub rows: usize,
    pub status: ChunkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of applying a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub kind: MutationKind,
    pub collection: String,
    pub total_rows: usize,
    /// Sum of the sizes of committed chunks
    pub committed_rows: usize,
    pub chunk_size: usize,
    pub chunks: Vec<ChunkOutcome>,
    /// Primary keys reported by the backend for committed rows
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<Value>,
}

impl BatchReport {
    /// Whether every chunk was committed
    pub fn is_complete(&self) -> bool {
        self.chunks
            .iter()
            .all(|c| c.status == ChunkStatus::Committed)
    }

    /// The chunk that stopped the batch, if any
    pub fn failed_chunk(&self) -> Option<&ChunkOutcome> {
        self.chunks.iter().find(|c| c.status == ChunkStatus::Failed)
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.failed_chunk() {
            Some(failed) => write!(
                f,
                "{} into '{}' stopped at chunk {} of {}: {} of {} rows committed ({})",
                self.kind.as_str(),
                self.collection,
                failed.index + 1,
                self.chunks.len(),
                self.committed_rows,
                self.total_rows,
                failed.error.as_deref().unwrap_or("unknown error")
            ),
            None => write!(
                f,
                "{} into '{}': {} rows committed in {} chunk(s)",
                self.kind.as_str(),
                self.collection,
                self.committed_rows,
                self.chunks.len()
            ),
        }
    }
}

/// Applies mutation batches chunk by chunk
pub struct BatchCoordinator<'a> {
    backend: &'a dyn Backend,
    chunk_size: usize,
}

impl<'a> BatchCoordinator<'a> {
    /// Create a coordinator; a chunk size of 0 is treated as 1
    pub fn new(backend: &'a dyn Backend, chunk_size: usize) -> Self {
        Self {
            backend,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Submit every chunk in order, waiting for each before the next
    ///
    /// Returns [`Error::PartialFailure`] carrying the report when a chunk
    /// fails; later chunks are reported as not attempted.
    pub async fn apply(&self, kind: MutationKind, batch: &MutationBatch) -> Result<BatchReport> {
        let chunks: Vec<&[Row]> = batch.chunks(self.chunk_size).collect();
        let mut report = BatchReport {
            kind,
            collection: batch.collection().to_string(),
            total_rows: batch.len(),
            committed_rows: 0,
            chunk_size: self.chunk_size,
            chunks: Vec::with_capacity(chunks.len()),
            ids: Vec::new(),
        };

        let mut failed = false;
        for (index, chunk) in chunks.iter().enumerate() {
            let mut outcome = ChunkOutcome {
                index,
                start_row: index * self.chunk_size,
                rows: chunk.len(),
                status: ChunkStatus::NotAttempted,
                error: None,
            };

            if !failed {
                tracing::debug!(
                    "{} chunk {}/{} ({} rows) into '{}'",
                    kind.as_str(),
                    index + 1,
                    chunks.len(),
                    chunk.len(),
                    batch.collection()
                );
                let result = match kind {
                    MutationKind::Insert => {
                        self.backend
                            .insert(batch.collection(), chunk.to_vec())
                            .await
                    }
                    MutationKind::Upsert => {
                        self.backend
                            .upsert(batch.collection(), chunk.to_vec())
                            .await
                    }
                };
                match result {
                    Ok(result) => {
                        outcome.status = ChunkStatus::Committed;
                        report.committed_rows += chunk.len();
                        report.ids.extend(result.ids);
                    }
                    Err(e) => {
                        outcome.status = ChunkStatus::Failed;
                        outcome.error = Some(e.to_string());
                        failed = true;
                    }
                }
            }

            report.chunks.push(outcome);
        }

        if failed {
            tracing::warn!("{}", report);
            return Err(Error::PartialFailure(Box::new(report)));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_columns() {
        let data = json!({"id": [1, 2, 3], "vector": [[0.1], [0.2], [0.3]]});
        let batch = MutationBatch::from_value("docs", &data).unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.rows()[1]["id"], json!(2));
        assert_eq!(batch.rows()[2]["vector"], json!([0.3]));
    }

    #[test]
    fn test_from_columns_rejects_ragged() {
        let data = json!({"id": [1, 2, 3], "vector": [[0.1], [0.2]]});
        let err = MutationBatch::from_value("docs", &data).unwrap_err();

        assert!(matches!(err, Error::Validation { ref param, .. } if param == "data"));
        assert!(err.to_string().contains("has 2 values"));
    }

    #[test]
    fn test_from_rows() {
        let data = json!([{"id": 1}, {"id": 2}]);
        let batch = MutationBatch::from_value("docs", &data).unwrap();
        assert_eq!(batch.len(), 2);

        let err = MutationBatch::from_value("docs", &json!([{"id": 1}, 7])).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(MutationBatch::from_value("docs", &json!({})).is_err());
        assert!(MutationBatch::from_value("docs", &json!({"id": []})).is_err());
        assert!(MutationBatch::from_value("docs", &json!([])).is_err());
        assert!(MutationBatch::from_value("docs", &json!("rows")).is_err());
    }

    #[test]
    fn test_chunks_preserve_order() {
        let ids: Vec<i64> = (0..7).collect();
        let batch = MutationBatch::from_value("docs", &json!({ "id": ids })).unwrap();

        let sizes: Vec<usize> = batch.chunks(3).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let flattened: Vec<Value> = batch
            .chunks(3)
            .flat_map(|c| c.iter().map(|r| r["id"].clone()))
            .collect();
        assert_eq!(flattened, (0..7).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[test]
    fn test_report_display() {
        let report = BatchReport {
            kind: MutationKind::Insert,
            collection: "docs".to_string(),
            total_rows: 5,
            committed_rows: 2,
            chunk_size: 2,
            chunks: vec![
                ChunkOutcome {
                    index: 0,
                    start_row: 0,
                    rows: 2,
                    status: ChunkStatus::Committed,
                    error: None,
                },
                ChunkOutcome {
                    index: 1,
                    start_row: 2,
                    rows: 2,
                    status: ChunkStatus::Failed,
                    error: Some("duplicate primary key".to_string()),
                },
                ChunkOutcome {
                    index: 2,
                    start_row: 4,
                    rows: 1,
                    status: ChunkStatus::NotAttempted,
                    error: None,
                },
            ],
            ids: Vec::new(),
        };

        assert!(!report.is_complete());
        assert_eq!(report.failed_chunk().unwrap().index, 1);
        assert_eq!(
            report.to_string(),
            "insert into 'docs' stopped at chunk 2 of 3: 2 of 5 rows committed (duplicate primary key)"
        );
    }
}
