// MNEMO Workflow - activity set
// Idempotent, heartbeat-reporting units over the core adapters

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::memory::core::{
    BlobStoreAdapter, CacheOutcome, CacheStats, CatalogStore, ChunkCache, EntityExtractor,
    EnvelopeCrypto, KnowledgeGraph,
};
use crate::memory::processing::{
    similarity, Chunker, EmbeddingClient, LlmClient, ReasoningResult, TextChunk,
};
use crate::memory::workflow::ActivityContext;
use crate::memory::{
    Document, DocumentChunk, DocumentIndex, Metadata, MemoryError, MemoryResult, metadata_matches,
};

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(hex: &str) -> MemoryResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(MemoryError::Storage("odd-length hex field".into()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| MemoryError::Storage("invalid hex field".into()))
        })
        .collect()
}

/// The singleton adapters every activity closes over. Activities are
/// pure functions of their arguments plus this set, and stay idempotent
/// under re-execution: ids are caller-supplied and duplicate inserts
/// resolve to no-ops.
pub struct Activities {
    pub chunker: Chunker,
    pub embedding: Arc<EmbeddingClient>,
    pub llm: Arc<LlmClient>,
    pub cache: Arc<ChunkCache>,
    pub crypto: Arc<EnvelopeCrypto>,
    pub blob: Arc<BlobStoreAdapter>,
    pub catalog: Arc<CatalogStore>,
    pub graph: Arc<KnowledgeGraph>,
    pub extractor: Arc<dyn EntityExtractor>,
}

impl Activities {
    /// Encrypt content and store it as a new blob version. The envelope
    /// parameters ride along in the blob metadata.
    pub async fn store_blob(
        &self,
        ctx: &ActivityContext,
        key: &str,
        content: &[u8],
        mut metadata: Metadata,
    ) -> MemoryResult<String> {
        let payload = self.crypto.encrypt(content).await?;
        ctx.heartbeat();

        metadata.insert("iv".into(), Value::String(to_hex(&payload.iv)));
        metadata.insert("data_key".into(), Value::String(to_hex(&payload.wrapped_key)));
        metadata.insert("algorithm".into(), Value::String("AES-256-CBC".into()));
        metadata.insert("padding".into(), Value::String("PKCS7".into()));

        let version = self.blob.put(key, payload.ciphertext, metadata).await?;
        ctx.heartbeat();
        Ok(version)
    }

    /// Fetch a blob version and reverse the envelope transform.
    pub async fn retrieve_blob(
        &self,
        ctx: &ActivityContext,
        key: &str,
        version_id: Option<&str>,
    ) -> MemoryResult<(Vec<u8>, Metadata)> {
        let object = self.blob.get(key, version_id).await?;
        ctx.heartbeat();

        let iv_hex = object
            .metadata
            .get("iv")
            .and_then(Value::as_str)
            .ok_or_else(|| MemoryError::Storage("blob metadata missing iv".into()))?;
        let key_hex = object
            .metadata
            .get("data_key")
            .and_then(Value::as_str)
            .ok_or_else(|| MemoryError::Storage("blob metadata missing data key".into()))?;

        let iv_bytes = from_hex(iv_hex)?;
        let iv: [u8; 16] = iv_bytes
            .try_into()
            .map_err(|_| MemoryError::Storage("blob iv has wrong length".into()))?;

        let plaintext = self
            .crypto
            .decrypt(&crate::memory::core::EncryptedPayload {
                ciphertext: object.bytes,
                wrapped_key: from_hex(key_hex)?,
                iv,
            })
            .await?;
        ctx.heartbeat();
        Ok((plaintext, object.metadata))
    }

    pub async fn delete_blob(&self, ctx: &ActivityContext, key: &str) -> MemoryResult<()> {
        self.blob.delete(key).await?;
        ctx.heartbeat();
        Ok(())
    }

    /// Token-aware chunking (§ chunker). Synchronous under the hood; the
    /// heartbeat brackets it for the watchdog.
    pub fn chunk_document(
        &self,
        ctx: &ActivityContext,
        text: &str,
        target: Option<usize>,
        model: &str,
    ) -> MemoryResult<Vec<TextChunk>> {
        ctx.heartbeat();
        let chunks = self.chunker.chunk(text, target, model)?;
        ctx.heartbeat();
        Ok(chunks)
    }

    pub async fn embed_chunks(
        &self,
        ctx: &ActivityContext,
        texts: &[String],
    ) -> MemoryResult<Vec<Vec<f32>>> {
        ctx.heartbeat();
        let vectors = self.embedding.embed_batch(texts).await?;
        ctx.heartbeat();
        Ok(vectors)
    }

    /// One catalog transaction for the document, its chunks and the
    /// index row.
    pub async fn persist_document(
        &self,
        ctx: &ActivityContext,
        document: &Document,
        chunks: &[DocumentChunk],
        index_metadata: &Metadata,
    ) -> MemoryResult<Uuid> {
        self.catalog.create_document(document, chunks, index_metadata).await?;
        ctx.heartbeat();
        Ok(document.id)
    }

    /// Best-effort cache fill. `Skipped` under memory pressure is a
    /// normal outcome, not an error.
    pub fn cache_chunk(&self, ctx: &ActivityContext, chunk: DocumentChunk) -> CacheOutcome {
        ctx.heartbeat();
        self.cache.put(chunk, None)
    }

    pub fn invalidate_cache(&self, ctx: &ActivityContext, document_id: &Uuid) -> usize {
        ctx.heartbeat();
        self.cache.invalidate_document(document_id)
    }

    /// Extract entities (outside the graph lock) and insert the document
    /// node with its weighted edges.
    pub fn graph_insert(
        &self,
        ctx: &ActivityContext,
        document_id: Uuid,
        body: &str,
        chunk_texts: &[String],
        metadata: &Metadata,
    ) -> MemoryResult<()> {
        let entities =
            self.extractor
                .extract(body, chunk_texts, self.graph.config().min_edge_weight);
        ctx.heartbeat();
        self.graph.insert_document(document_id, metadata.clone(), entities);
        Ok(())
    }

    /// Recompute graph edges for an updated document.
    pub fn graph_update(
        &self,
        ctx: &ActivityContext,
        document_id: Uuid,
        body: &str,
        chunk_texts: &[String],
        metadata: &Metadata,
        force_full: bool,
    ) -> MemoryResult<()> {
        let entities =
            self.extractor
                .extract(body, chunk_texts, self.graph.config().min_edge_weight);
        ctx.heartbeat();
        self.graph.update_document(document_id, metadata.clone(), entities, force_full)
    }

    /// Remove the document node and prune orphaned entities.
    pub fn graph_remove(&self, ctx: &ActivityContext, document_id: &Uuid) -> bool {
        ctx.heartbeat();
        self.graph.remove_document(document_id)
    }

    /// Score all embedded chunks against the query vector; drop scores
    /// under `min_score` and documents failing the metadata filters.
    /// Returns at most `k` (chunk, score) pairs, best first.
    pub async fn vector_candidates(
        &self,
        ctx: &ActivityContext,
        query_vector: &[f32],
        filters: &Metadata,
        min_score: f32,
        k: usize,
    ) -> MemoryResult<Vec<(DocumentChunk, f32)>> {
        let chunks = self.catalog.chunks_with_embeddings().await?;
        ctx.heartbeat();

        let mut document_filter: HashMap<Uuid, bool> = HashMap::new();
        let mut scored: Vec<(DocumentChunk, f32)> = Vec::new();

        for (i, chunk) in chunks.into_iter().enumerate() {
            if i % 256 == 0 {
                ctx.heartbeat();
            }
            let Some(embedding) = chunk.embedding.as_deref() else {
                continue;
            };
            let score = similarity(query_vector, embedding);
            if score < min_score {
                continue;
            }

            let document_id = chunk.document_id;
            let passes = match document_filter.get(&document_id) {
                Some(&cached) => cached,
                None => {
                    let passes = if filters.is_empty() {
                        true
                    } else {
                        let document = self.catalog.get_document(&document_id).await?;
                        metadata_matches(&document.metadata, filters)
                    };
                    document_filter.insert(document_id, passes);
                    passes
                }
            };
            if passes {
                scored.push((chunk, score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        debug!(candidates = scored.len(), "vector candidates scored");
        Ok(scored)
    }

    pub async fn llm_reason(
        &self,
        ctx: &ActivityContext,
        query: &str,
        documents: &[String],
    ) -> MemoryResult<ReasoningResult> {
        ctx.heartbeat();
        let result = self.llm.reason(query, documents).await?;
        ctx.heartbeat();
        Ok(result)
    }

    pub async fn llm_select(
        &self,
        ctx: &ActivityContext,
        query: &str,
        candidates: &[String],
    ) -> MemoryResult<Vec<String>> {
        ctx.heartbeat();
        let selected = self.llm.select(query, candidates).await?;
        ctx.heartbeat();
        Ok(selected)
    }

    /// Idempotent access recording; safe to fire and forget.
    pub async fn record_access(&self, document_id: &Uuid) -> MemoryResult<()> {
        self.catalog.record_access(document_id, Utc::now()).await
    }

    /// Most frequently accessed documents, best first.
    pub async fn most_accessed(
        &self,
        ctx: &ActivityContext,
        limit: usize,
    ) -> MemoryResult<Vec<DocumentIndex>> {
        let ranked = self.catalog.most_accessed(limit).await?;
        ctx.heartbeat();
        Ok(ranked)
    }

    /// Rotate the master key; cached data keys for it are dropped.
    pub async fn rotate_key(&self, ctx: &ActivityContext) -> MemoryResult<()> {
        self.crypto.rotate().await?;
        ctx.heartbeat();
        Ok(())
    }

    /// Chunk cache counters, reported alongside heartbeats by callers
    /// that watch cache health.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = vec![0x00, 0xab, 0xff, 0x10];
        assert_eq!(from_hex(&to_hex(&bytes)).unwrap(), bytes);
        assert!(from_hex("abc").is_err());
        assert!(from_hex("zz").is_err());
    }
}
