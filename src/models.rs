//! Core data models shared by the ingestion, retrieval, and HTTP layers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A document ready for indexing, after text extraction.
#[derive(Debug, Clone)]
pub struct IngestItem {
    /// Origin of the document: `upload` or `file`.
    pub source: String,
    /// Identity within the source (upload filename or canonical path).
    pub source_id: String,
    pub source_url: Option<String>,
    pub title: Option<String>,
    pub content_type: String,
    pub body: String,
    pub metadata_json: String,
    pub updated_at: DateTime<Utc>,
}

/// A chunk of a document's body text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A user-authored note.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Note {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub user_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Format a Unix timestamp as ISO 8601 in UTC.
pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
