//! Response formatting
//!
//! Every tool call ends in a [`ToolResult`]: a success flag plus either the
//! payload or a structured error. The MCP layer renders it as pretty JSON in
//! a single text content item.

use super::protocol::CallToolResult;
use crate::batch::BatchReport;
use crate::collection::{CollectionInfo, CollectionStats, IndexInfo, LoadProgress};
use crate::error::{Error, ErrorKind, Result};
use crate::search::{Hit, Row};
use serde::Serialize;
use serde_json::{json, Value};

/// Typed outcome of a tool handler
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Collections(Vec<String>),
    /// Acknowledgement with a human-readable message
    Ack(String),
    Collection(CollectionInfo),
    Stats(CollectionStats),
    LoadState(LoadProgress),
    Mutation(BatchReport),
    /// Rows removed, `None` when the backend does not report it
    Deleted(Option<u64>),
    Rows(Vec<Row>),
    Count(u64),
    Hits(Vec<Hit>),
    /// One ranked list per query vector, in query order
    HitGroups(Vec<Vec<Hit>>),
    Indexes(Vec<IndexInfo>),
}

impl Output {
    /// Convert to the JSON payload returned to the caller
    pub fn into_payload(self) -> Result<Value> {
        let payload = match self {
            Output::Collections(names) => json!({ "count": names.len(), "collections": names }),
            Output::Ack(message) => json!({ "acknowledged": true, "message": message }),
            Output::Collection(info) => serde_json::to_value(info)?,
            Output::Stats(stats) => serde_json::to_value(stats)?,
            Output::LoadState(progress) => serde_json::to_value(progress)?,
            Output::Mutation(report) => {
                let count_key = format!("{}_count", report.kind.as_str());
                let mut value = serde_json::to_value(&report)?;
                if let Value::Object(map) = &mut value {
                    map.insert(count_key, json!(report.committed_rows));
                }
                value
            }
            Output::Deleted(count) => json!({ "delete_count": count }),
            Output::Rows(rows) => json!({ "count": rows.len(), "rows": rows }),
            Output::Count(count) => json!({ "count": count }),
            Output::Hits(hits) => json!({ "count": hits.len(), "results": hits }),
            Output::HitGroups(groups) => {
                json!({ "num_queries": groups.len(), "results": groups })
            }
            Output::Indexes(indexes) => json!({ "count": indexes.len(), "indexes": indexes }),
        };
        Ok(payload)
    }
}

/// Structured error reported to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Uniform result envelope of every tool call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn success(payload: Value) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(error: &Error) -> Self {
        let details = match error {
            Error::Validation { param, .. } => Some(json!({ "param": param })),
            Error::PartialFailure(report) => serde_json::to_value(report.as_ref()).ok(),
            _ => None,
        };
        Self {
            success: false,
            payload: None,
            error: Some(ToolError {
                kind: error.kind(),
                message: error.to_string(),
                details,
            }),
        }
    }

    /// Failure that did not come from a typed error, e.g. a handler panic
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(ToolError {
                kind: ErrorKind::Internal,
                message: message.into(),
                details: None,
            }),
        }
    }

    /// Render as MCP `tools/call` result
    pub fn to_call_result(&self) -> CallToolResult {
        let text = serde_json::to_string_pretty(self).unwrap_or_else(|e| {
            format!(
                "{{\"success\": false, \"error\": {{\"kind\": \"internal\", \"message\": \"{}\"}}}}",
                e.to_string().replace('"', "'")
            )
        });
        CallToolResult::text(text, !self.success)
    }
}
