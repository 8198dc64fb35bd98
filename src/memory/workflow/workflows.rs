// MNEMO Workflow - document lifecycle workflows
// store / retrieve / update / delete with compensation and serialization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::memory::workflow::{
    deterministic_id, workflow_id, Activities, ActivityContext, WorkflowEngine,
};
use crate::memory::{
    Document, DocumentChunk, DocumentFormat, Metadata, MemoryError, MemoryResult,
    MAX_DOCUMENT_BYTES,
};

const DEFAULT_CHUNK_MODEL: &str = "gpt-3.5-turbo";

/// Inputs for the store workflow.
#[derive(Debug, Clone)]
pub struct StoreDocumentRequest {
    pub content: String,
    pub format: DocumentFormat,
    pub metadata: Metadata,
    /// Caller request id; drives the deterministic workflow identity.
    pub request_id: Option<String>,
    pub model: Option<String>,
    pub target_tokens: Option<usize>,
}

/// Result of a successful store or replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub document_id: Uuid,
    pub blob_version: String,
    pub chunk_count: usize,
    pub token_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatedDocument {
    pub document_id: Uuid,
    pub blob_version: String,
    pub chunk_count: usize,
    pub token_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub document: Document,
    pub content: Option<String>,
}

/// The five document workflows. Each sequences activities through the
/// engine's retry/timeout machinery; per-document workflows hold the
/// document lock for their full duration.
pub struct Workflows {
    engine: Arc<WorkflowEngine>,
    activities: Arc<Activities>,
}

impl Workflows {
    pub fn new(engine: Arc<WorkflowEngine>, activities: Arc<Activities>) -> Self {
        Self { engine, activities }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn activities(&self) -> &Arc<Activities> {
        &self.activities
    }

    /// Store workflow: validate → chunk → embed → store blob → persist →
    /// cache (best-effort) → graph insert. A failed persist compensates
    /// by tombstoning the blob so no committed document ever points at
    /// garbage.
    pub async fn store_document(&self, request: StoreDocumentRequest) -> MemoryResult<StoredDocument> {
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let wf_id = workflow_id("store_document", &request_id);
        let document_id = deterministic_id(&wf_id);

        self.engine
            .run(&wf_id, "store_document", self.execute_store(wf_id.clone(), document_id, request))
            .await
    }

    async fn execute_store(
        &self,
        wf_id: String,
        document_id: Uuid,
        request: StoreDocumentRequest,
    ) -> MemoryResult<StoredDocument> {
        if request.content.trim().is_empty() {
            return Err(MemoryError::Validation("document content is empty".into()));
        }
        if request.content.len() > MAX_DOCUMENT_BYTES {
            return Err(MemoryError::Validation(format!(
                "document of {} bytes exceeds the {MAX_DOCUMENT_BYTES} byte limit",
                request.content.len()
            )));
        }

        let _guard = self.engine.lock_document(&document_id).await;
        let model = request.model.as_deref().unwrap_or(DEFAULT_CHUNK_MODEL).to_string();

        // Chunk
        let ctx = ActivityContext::new(&wf_id, "chunk_document");
        let text_chunks = self
            .engine
            .execute(&ctx, |ctx| {
                let result = self.activities.chunk_document(
                    &ctx,
                    &request.content,
                    request.target_tokens,
                    &model,
                );
                async move { result }
            })
            .await?;

        // Embed
        let chunk_texts: Vec<String> = text_chunks.iter().map(|c| c.content.clone()).collect();
        let ctx = ActivityContext::new(&wf_id, "embed_chunks");
        let embeddings = self
            .engine
            .execute(&ctx, |ctx| {
                let texts = chunk_texts.clone();
                async move { self.activities.embed_chunks(&ctx, &texts).await }
            })
            .await?;

        // Store blob (encrypted)
        let blob_key = Document::blob_key(&document_id);
        let mut blob_metadata = Metadata::new();
        blob_metadata.insert("format".into(), request.format.as_str().into());
        let ctx = ActivityContext::new(&wf_id, "store_blob");
        let blob_version = self
            .engine
            .execute(&ctx, |ctx| {
                let metadata = blob_metadata.clone();
                let key = blob_key.clone();
                let content = request.content.clone();
                async move {
                    self.activities
                        .store_blob(&ctx, &key, content.as_bytes(), metadata)
                        .await
                }
            })
            .await?;

        // Persist document + chunks + index in one transaction
        let now = Utc::now();
        let chunks: Vec<DocumentChunk> = text_chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, embedding)| DocumentChunk {
                id: Uuid::new_v5(&document_id, format!("chunk-{}", chunk.chunk_number).as_bytes()),
                document_id,
                content: chunk.content.clone(),
                chunk_number: chunk.chunk_number,
                token_count: chunk.token_count,
                embedding: Some(embedding.clone()),
            })
            .collect();
        let token_count: u32 = chunks.iter().map(|c| c.token_count).sum();

        let document = Document {
            id: document_id,
            blob_ref: blob_key.clone(),
            blob_version: blob_version.clone(),
            format: request.format,
            metadata: request.metadata.clone(),
            token_count,
            created_at: now,
            updated_at: now,
        };

        let ctx = ActivityContext::new(&wf_id, "persist_document");
        let persisted = self
            .engine
            .execute(&ctx, |ctx| {
                let document = document.clone();
                let chunks = chunks.clone();
                let index_metadata = request.metadata.clone();
                async move {
                    self.activities
                        .persist_document(&ctx, &document, &chunks, &index_metadata)
                        .await
                }
            })
            .await;

        if let Err(err) = persisted {
            // Compensate: the blob version written above is garbage now.
            warn!(%document_id, "persist failed, compensating blob write: {err}");
            let ctx = ActivityContext::new(&wf_id, "delete_blob");
            if let Err(compensation) = self.activities.delete_blob(&ctx, &blob_key).await {
                error!(%document_id, "blob compensation failed: {compensation}");
            }
            return Err(err);
        }

        // Cache chunks, best-effort
        let ctx = ActivityContext::new(&wf_id, "cache_chunk");
        for chunk in &chunks {
            self.activities.cache_chunk(&ctx, chunk.clone());
        }

        // Graph insert
        let ctx = ActivityContext::new(&wf_id, "graph_insert");
        self.engine
            .execute(&ctx, |ctx| {
                let result = self.activities.graph_insert(
                    &ctx,
                    document_id,
                    &request.content,
                    &chunk_texts,
                    &request.metadata,
                );
                async move { result }
            })
            .await?;

        info!(%document_id, chunk_count = chunks.len(), token_count, "document stored");
        Ok(StoredDocument {
            document_id,
            blob_version,
            chunk_count: chunks.len(),
            token_count,
        })
    }

    /// Retrieve workflow: catalog lookup, optional blob fetch, and
    /// fire-and-forget access recording.
    pub async fn retrieve_document(
        &self,
        document_id: Uuid,
        load_content: bool,
    ) -> MemoryResult<RetrievedDocument> {
        let wf_id = workflow_id("retrieve_document", &Uuid::new_v4().to_string());

        self.engine
            .run(&wf_id, "retrieve_document", async {
                let ctx = ActivityContext::new(&wf_id, "catalog_lookup");
                let document = self
                    .engine
                    .execute(&ctx, |_ctx| self.activities.catalog.get_document(&document_id))
                    .await?;

                let content = if load_content {
                    let ctx = ActivityContext::new(&wf_id, "retrieve_blob");
                    let version = document.blob_version.clone();
                    let blob_ref = document.blob_ref.clone();
                    let (bytes, _) = self
                        .engine
                        .execute(&ctx, |ctx| {
                            let blob_ref = blob_ref.clone();
                            let version = version.clone();
                            async move {
                                self.activities
                                    .retrieve_blob(&ctx, &blob_ref, Some(&version))
                                    .await
                            }
                        })
                        .await?;
                    Some(String::from_utf8(bytes).map_err(|_| {
                        MemoryError::Storage("stored content is not valid utf-8".into())
                    })?)
                } else {
                    None
                };

                // Access recording is fire-and-forget.
                let activities = self.activities.clone();
                tokio::spawn(async move {
                    if let Err(err) = activities.record_access(&document_id).await {
                        warn!(%document_id, "access recording failed: {err}");
                    }
                });

                Ok(RetrievedDocument { document, content })
            })
            .await
    }

    /// Update workflow. Content updates write a new blob version and
    /// replace all chunks transactionally; metadata-only updates skip
    /// chunking and embedding entirely. Serialized per document id.
    pub async fn update_document(
        &self,
        document_id: Uuid,
        content: Option<String>,
        metadata: Option<Metadata>,
        request_id: Option<String>,
    ) -> MemoryResult<UpdatedDocument> {
        let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let wf_id = workflow_id("update_document", &request_id);

        self.engine
            .run(
                &wf_id,
                "update_document",
                self.execute_update(wf_id.clone(), document_id, content, metadata),
            )
            .await
    }

    async fn execute_update(
        &self,
        wf_id: String,
        document_id: Uuid,
        content: Option<String>,
        metadata: Option<Metadata>,
    ) -> MemoryResult<UpdatedDocument> {
        let _guard = self.engine.lock_document(&document_id).await;

        let existing = self.activities.catalog.get_document(&document_id).await?;
        let new_metadata = metadata.unwrap_or_else(|| existing.metadata.clone());
        let updated_at = Utc::now();

        let Some(content) = content else {
            // Metadata-only path.
            self.activities
                .catalog
                .update_document_metadata(&document_id, &new_metadata, updated_at)
                .await?;
            self.activities
                .catalog
                .update_index_metadata(&document_id, &new_metadata)
                .await?;
            if self.activities.graph.contains(&document_id) {
                self.activities.graph.update_metadata(&document_id, new_metadata)?;
            }
            info!(%document_id, "document metadata updated");
            return Ok(UpdatedDocument {
                document_id,
                blob_version: existing.blob_version,
                chunk_count: 0,
                token_count: existing.token_count,
                updated_at,
            });
        };

        if content.trim().is_empty() {
            return Err(MemoryError::Validation("replacement content is empty".into()));
        }
        if content.len() > MAX_DOCUMENT_BYTES {
            return Err(MemoryError::Validation(format!(
                "replacement content of {} bytes exceeds the {MAX_DOCUMENT_BYTES} byte limit",
                content.len()
            )));
        }

        // Chunk + embed the replacement content.
        let ctx = ActivityContext::new(&wf_id, "chunk_document");
        let text_chunks = self
            .engine
            .execute(&ctx, |ctx| {
                let result =
                    self.activities
                        .chunk_document(&ctx, &content, None, DEFAULT_CHUNK_MODEL);
                async move { result }
            })
            .await?;
        let chunk_texts: Vec<String> = text_chunks.iter().map(|c| c.content.clone()).collect();

        let ctx = ActivityContext::new(&wf_id, "embed_chunks");
        let embeddings = self
            .engine
            .execute(&ctx, |ctx| {
                let texts = chunk_texts.clone();
                async move { self.activities.embed_chunks(&ctx, &texts).await }
            })
            .await?;

        // New blob version on the same key.
        let mut blob_metadata = Metadata::new();
        blob_metadata.insert("format".into(), existing.format.as_str().into());
        let blob_ref = existing.blob_ref.clone();
        let ctx = ActivityContext::new(&wf_id, "store_blob");
        let blob_version = self
            .engine
            .execute(&ctx, |ctx| {
                let metadata = blob_metadata.clone();
                let blob_ref = blob_ref.clone();
                let content = content.clone();
                async move {
                    self.activities
                        .store_blob(&ctx, &blob_ref, content.as_bytes(), metadata)
                        .await
                }
            })
            .await?;

        // Replace chunks transactionally. On failure the catalog keeps
        // the old chunk set and the old blob version pointer, so the new
        // blob version is unreachable garbage.
        let chunks: Vec<DocumentChunk> = text_chunks
            .iter()
            .zip(embeddings.iter())
            .map(|(chunk, embedding)| DocumentChunk {
                id: Uuid::new_v4(),
                document_id,
                content: chunk.content.clone(),
                chunk_number: chunk.chunk_number,
                token_count: chunk.token_count,
                embedding: Some(embedding.clone()),
            })
            .collect();
        let token_count: u32 = chunks.iter().map(|c| c.token_count).sum();

        let ctx = ActivityContext::new(&wf_id, "replace_chunks");
        self.engine
            .execute(&ctx, |_ctx| {
                let chunks = chunks.clone();
                let blob_version = blob_version.clone();
                let metadata = new_metadata.clone();
                async move {
                    self.activities
                        .catalog
                        .replace_chunks(
                            &document_id,
                            &chunks,
                            &blob_version,
                            &metadata,
                            token_count,
                            updated_at,
                        )
                        .await
                }
            })
            .await?;

        // Invalidate stale cache entries, then rebuild the graph
        // projection from scratch.
        let ctx = ActivityContext::new(&wf_id, "invalidate_cache");
        self.activities.invalidate_cache(&ctx, &document_id);

        let ctx = ActivityContext::new(&wf_id, "graph_update");
        self.engine
            .execute(&ctx, |ctx| {
                let result = if self.activities.graph.contains(&document_id) {
                    self.activities.graph_update(
                        &ctx,
                        document_id,
                        &content,
                        &chunk_texts,
                        &new_metadata,
                        true,
                    )
                } else {
                    self.activities.graph_insert(
                        &ctx,
                        document_id,
                        &content,
                        &chunk_texts,
                        &new_metadata,
                    )
                };
                async move { result }
            })
            .await?;

        info!(%document_id, chunk_count = chunks.len(), "document content updated");
        Ok(UpdatedDocument {
            document_id,
            blob_version,
            chunk_count: chunks.len(),
            token_count,
            updated_at,
        })
    }

    /// Delete workflow: blob tombstone, cascading catalog delete, cache
    /// invalidation and graph removal. Idempotent: deleting a missing
    /// document succeeds.
    pub async fn delete_document(&self, document_id: Uuid) -> MemoryResult<bool> {
        let wf_id = workflow_id("delete_document", &Uuid::new_v4().to_string());

        self.engine
            .run(&wf_id, "delete_document", async {
                let _guard = self.engine.lock_document(&document_id).await;

                let ctx = ActivityContext::new(&wf_id, "delete_blob");
                self.engine
                    .execute(&ctx, |ctx| {
                        let key = Document::blob_key(&document_id);
                        async move { self.activities.delete_blob(&ctx, &key).await }
                    })
                    .await?;

                let ctx = ActivityContext::new(&wf_id, "catalog_delete");
                let existed = self
                    .engine
                    .execute(&ctx, |_ctx| self.activities.catalog.delete_document(&document_id))
                    .await?;

                let ctx = ActivityContext::new(&wf_id, "invalidate_cache");
                self.activities.invalidate_cache(&ctx, &document_id);

                let ctx = ActivityContext::new(&wf_id, "graph_remove");
                self.activities.graph_remove(&ctx, &document_id);

                info!(%document_id, existed, "document deleted");
                Ok(existed)
            })
            .await
    }
}
