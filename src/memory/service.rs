// MNEMO Memory Module - document service façade
// Request validation, workflow dispatch and public error mapping

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::memory::core::CacheStats;
use crate::memory::search::{RetrievalPlanner, RetrievalStrategy, SearchOutcome};
use crate::memory::workflow::workflows::{RetrievedDocument, StoreDocumentRequest};
use crate::memory::workflow::{ActivityContext, StoredDocument, UpdatedDocument, Workflows};
use crate::memory::{
    DocumentFormat, DocumentIndex, ErrorKind, Metadata, MemoryError, MemoryResult,
    MAX_DOCUMENT_BYTES, MAX_QUERY_CHARS, MAX_SEARCH_LIMIT,
};

/// Store request from the boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreRequest {
    pub content: String,
    pub format: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Search request from the boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub filters: Metadata,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Error shape the boundary serializes. Context values with sensitive
/// key names never survive redaction upstream of this type.
#[derive(Debug, Clone, Serialize)]
pub struct PublicError {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: Uuid,
}

impl PublicError {
    pub fn from_error(err: &MemoryError, correlation_id: Uuid) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            correlation_id,
        }
    }

    /// HTTP status the boundary maps this error to. Workflow failures
    /// map by their underlying kind.
    pub fn status_code(&self, err: &MemoryError) -> u16 {
        let kind = match err {
            MemoryError::Workflow { kind, .. } => *kind,
            other => other.kind(),
        };
        match kind {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Authentication => 401,
            ErrorKind::Authorization => 403,
            ErrorKind::Rate | ErrorKind::Upstream | ErrorKind::Storage | ErrorKind::Workflow => 503,
        }
    }
}

/// Thin façade over the orchestrator: translates boundary requests into
/// workflow arguments and annotates failures with a correlation id.
pub struct DocumentService {
    workflows: Arc<Workflows>,
    planner: Arc<RetrievalPlanner>,
}

impl DocumentService {
    pub fn new(workflows: Arc<Workflows>, planner: Arc<RetrievalPlanner>) -> Self {
        Self { workflows, planner }
    }

    pub async fn store(&self, request: StoreRequest) -> MemoryResult<StoredDocument> {
        let correlation_id = Uuid::new_v4();

        if request.content.is_empty() {
            return Err(MemoryError::Validation("content must not be empty".into()));
        }
        if request.content.len() > MAX_DOCUMENT_BYTES {
            return Err(MemoryError::Validation(format!(
                "content of {} bytes exceeds the {MAX_DOCUMENT_BYTES} byte limit",
                request.content.len()
            )));
        }
        let format: DocumentFormat = request.format.parse()?;

        let result = self
            .workflows
            .store_document(StoreDocumentRequest {
                content: request.content,
                format,
                metadata: request.metadata,
                request_id: request.request_id,
                model: None,
                target_tokens: None,
            })
            .await;

        match result {
            Ok(stored) => {
                info!(%correlation_id, document_id = %stored.document_id, "store complete");
                Ok(stored)
            }
            Err(err) => {
                error!(%correlation_id, "store failed: {err}");
                Err(err)
            }
        }
    }

    pub async fn retrieve(
        &self,
        document_id: Uuid,
        load_content: bool,
    ) -> MemoryResult<RetrievedDocument> {
        let correlation_id = Uuid::new_v4();
        self.workflows
            .retrieve_document(document_id, load_content)
            .await
            .map_err(|err| {
                error!(%correlation_id, %document_id, "retrieve failed: {err}");
                err
            })
    }

    pub async fn search(&self, request: SearchRequest) -> MemoryResult<SearchOutcome> {
        let correlation_id = Uuid::new_v4();

        if request.query.trim().is_empty() {
            return Err(MemoryError::Validation("query must not be empty".into()));
        }
        if request.query.chars().count() > MAX_QUERY_CHARS {
            return Err(MemoryError::Validation(format!(
                "query exceeds {MAX_QUERY_CHARS} characters"
            )));
        }

        let strategy = match request.strategy.as_deref() {
            Some(raw) => RetrievalStrategy::parse(raw)?,
            None => RetrievalStrategy::Hybrid,
        };
        let limit = request.limit.unwrap_or(10);
        if limit > MAX_SEARCH_LIMIT {
            return Err(MemoryError::Validation(format!(
                "limit must be at most {MAX_SEARCH_LIMIT}"
            )));
        }

        self.planner
            .search(&request.query, strategy, &request.filters, limit)
            .await
            .map_err(|err| {
                error!(%correlation_id, %strategy, "search failed: {err}");
                err.into_workflow("search_documents")
            })
    }

    pub async fn update(
        &self,
        document_id: Uuid,
        content: Option<String>,
        metadata: Option<Metadata>,
        request_id: Option<String>,
    ) -> MemoryResult<UpdatedDocument> {
        let correlation_id = Uuid::new_v4();

        if content.is_none() && metadata.is_none() {
            return Err(MemoryError::Validation(
                "update requires new content or new metadata".into(),
            ));
        }

        self.workflows
            .update_document(document_id, content, metadata, request_id)
            .await
            .map_err(|err| {
                error!(%correlation_id, %document_id, "update failed: {err}");
                err
            })
    }

    pub async fn delete(&self, document_id: Uuid) -> MemoryResult<bool> {
        let correlation_id = Uuid::new_v4();
        self.workflows.delete_document(document_id).await.map_err(|err| {
            error!(%correlation_id, %document_id, "delete failed: {err}");
            err
        })
    }

    /// Most frequently accessed documents, best first.
    pub async fn most_accessed(&self, limit: usize) -> MemoryResult<Vec<DocumentIndex>> {
        if limit > MAX_SEARCH_LIMIT {
            return Err(MemoryError::Validation(format!(
                "limit must be at most {MAX_SEARCH_LIMIT}"
            )));
        }
        let ctx = ActivityContext::new("most_accessed", "most_accessed");
        self.workflows.activities().most_accessed(&ctx, limit).await
    }

    /// Rotate the master encryption key. Previously stored documents
    /// stay readable; new data keys wrap under the rotated key.
    pub async fn rotate_key(&self) -> MemoryResult<()> {
        let correlation_id = Uuid::new_v4();
        let ctx = ActivityContext::new("rotate_key", "rotate_key");
        self.workflows
            .activities()
            .rotate_key(&ctx)
            .await
            .map(|()| {
                info!(%correlation_id, "master key rotated");
            })
            .map_err(|err| {
                error!(%correlation_id, "key rotation failed: {err}");
                err
            })
    }

    /// Chunk cache counters for operational monitoring.
    pub fn cache_stats(&self) -> CacheStats {
        self.workflows.activities().cache_stats()
    }
}
