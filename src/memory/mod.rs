// MNEMO Memory Module - document memory engine
// Core data structures, error taxonomy and shared helpers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod config;
pub mod core;
pub mod processing;
pub mod search;
pub mod service;
pub mod workflow;

pub use config::MemoryConfig;
pub use service::DocumentService;

// === Service limits ===

/// Hard ceiling on stored content size (10 MB).
pub const MAX_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;
/// Longest accepted search query, in characters.
pub const MAX_QUERY_CHARS: usize = 1000;
/// Largest accepted search result window.
pub const MAX_SEARCH_LIMIT: usize = 100;

// === Core Data Structures ===

/// Free-form document metadata (string keys, scalar or list values).
pub type Metadata = Map<String, Value>;

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Text,
    Markdown,
    Json,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Text => "text",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Json => "json",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFormat {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(DocumentFormat::Text),
            "markdown" => Ok(DocumentFormat::Markdown),
            "json" => Ok(DocumentFormat::Json),
            other => Err(MemoryError::Validation(format!(
                "unsupported document format: {other}"
            ))),
        }
    }
}

/// A stored document. Content bytes live in the blob store; the catalog
/// row carries the blob reference and aggregate token count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub blob_ref: String,
    pub blob_version: String,
    pub format: DocumentFormat,
    pub metadata: Metadata,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Blob-store key for a document id.
    pub fn blob_key(id: &Uuid) -> String {
        format!("documents/{id}")
    }
}

/// One contiguous segment of a document, sized to a model token budget.
/// (document_id, chunk_number) is unique and contiguous from 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub chunk_number: u32,
    pub token_count: u32,
    pub embedding: Option<Vec<f32>>,
}

/// Access-tracking row, exactly one per document. Reserved metadata keys
/// (prefixed `_`) survive metadata updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIndex {
    pub id: Uuid,
    pub document_id: Uuid,
    pub metadata: Metadata,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

/// Check `metadata` against required `filters`. Every filter pair must be
/// present with an exactly equal value; dotted keys descend into nested
/// objects.
pub fn metadata_matches(metadata: &Metadata, filters: &Metadata) -> bool {
    filters.iter().all(|(key, expected)| {
        lookup_path(metadata, key).map(|found| found == expected).unwrap_or(false)
    })
}

fn lookup_path<'a>(metadata: &'a Metadata, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = metadata.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

// === Error Taxonomy ===

/// The only error kinds the public surface ever exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Storage,
    Upstream,
    Rate,
    Authentication,
    Authorization,
    Workflow,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("authorization denied: {0}")]
    Authorization(String),

    /// Orchestration failure surfaced to the caller, annotated with the
    /// kind of the underlying error.
    #[error("workflow failed ({kind:?}): {message}")]
    Workflow { kind: ErrorKind, message: String },
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Validation(_) => ErrorKind::Validation,
            MemoryError::NotFound(_) => ErrorKind::NotFound,
            MemoryError::Storage(_) => ErrorKind::Storage,
            MemoryError::Upstream(_) => ErrorKind::Upstream,
            MemoryError::RateLimited(_) => ErrorKind::Rate,
            MemoryError::Authentication(_) => ErrorKind::Authentication,
            MemoryError::Authorization(_) => ErrorKind::Authorization,
            MemoryError::Workflow { .. } => ErrorKind::Workflow,
        }
    }

    /// Retry classification used by the workflow engine. Validation,
    /// not-found and auth failures never heal by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::Storage(_) | MemoryError::Upstream(_) | MemoryError::RateLimited(_)
        )
    }

    /// Wrap an activity error into a workflow failure, keeping the
    /// underlying kind for the public error mapping.
    pub fn into_workflow(self, workflow: &str) -> MemoryError {
        match self {
            MemoryError::Workflow { .. } => self,
            other => MemoryError::Workflow {
                kind: other.kind(),
                message: format!("{workflow}: {other}"),
            },
        }
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

impl From<sqlx::Error> for MemoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => MemoryError::NotFound("catalog row not found".into()),
            other => MemoryError::Storage(format!("catalog error: {other}")),
        }
    }
}

impl From<reqwest::Error> for MemoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            MemoryError::RateLimited(format!("upstream rate limit: {err}"))
        } else {
            MemoryError::Upstream(format!("http transport: {err}"))
        }
    }
}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        MemoryError::Storage(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::Validation(format!("serialization error: {err}"))
    }
}

// === Redaction ===

const SENSITIVE_KEY_MARKERS: [&str; 5] = ["password", "token", "secret", "key", "credential"];

/// True when a context key must never reach logs or error payloads.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Replace sensitive values in an error-context map before emission.
pub fn redact_context(context: &Metadata) -> Metadata {
    context
        .iter()
        .map(|(key, value)| {
            if is_sensitive_key(key) {
                (key.clone(), Value::String("[REDACTED]".into()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("markdown".parse::<DocumentFormat>().unwrap(), DocumentFormat::Markdown);
        assert!("pdf".parse::<DocumentFormat>().is_err());
    }

    #[test]
    fn test_metadata_filters_exact_match() {
        let metadata = meta(json!({"tag": "t1", "owner": {"team": "core"}}));

        assert!(metadata_matches(&metadata, &meta(json!({"tag": "t1"}))));
        assert!(metadata_matches(&metadata, &meta(json!({"owner.team": "core"}))));
        assert!(!metadata_matches(&metadata, &meta(json!({"tag": "t2"}))));
        assert!(!metadata_matches(&metadata, &meta(json!({"missing": "x"}))));
    }

    #[test]
    fn test_error_kind_and_retry() {
        assert!(MemoryError::Storage("boom".into()).is_retryable());
        assert!(MemoryError::RateLimited("slow down".into()).is_retryable());
        assert!(!MemoryError::Validation("bad".into()).is_retryable());

        let wf = MemoryError::Upstream("model down".into()).into_workflow("search_documents");
        assert_eq!(wf.kind(), ErrorKind::Workflow);
        match wf {
            MemoryError::Workflow { kind, .. } => assert_eq!(kind, ErrorKind::Upstream),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_document_serde_roundtrip() {
        let now = chrono::Utc::now();
        let document = Document {
            id: Uuid::from_u128(7),
            blob_ref: "documents/7".into(),
            blob_version: "v1".into(),
            format: DocumentFormat::Markdown,
            metadata: meta(json!({"tag": "t1", "nested": {"k": [1, 2]}})),
            token_count: 42,
            created_at: now,
            updated_at: now,
        };

        let encoded = serde_json::to_string(&document).unwrap();
        let decoded: Document = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, document.id);
        assert_eq!(decoded.format, document.format);
        assert_eq!(decoded.metadata, document.metadata);
        assert_eq!(decoded.token_count, document.token_count);
        assert_eq!(decoded.created_at, document.created_at);
    }

    #[test]
    fn test_redaction() {
        let context = meta(json!({"api_key": "sk-123", "document_id": "d1"}));
        let redacted = redact_context(&context);
        assert_eq!(redacted["api_key"], json!("[REDACTED]"));
        assert_eq!(redacted["document_id"], json!("d1"));
    }
}
