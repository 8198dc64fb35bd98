// MNEMO Core - catalog store
// Transactional metadata store for documents, chunks and access indexes

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::memory::{
    Document, DocumentChunk, DocumentFormat, DocumentIndex, Metadata, MemoryError, MemoryResult,
};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id            TEXT PRIMARY KEY,
        blob_ref      TEXT NOT NULL,
        blob_version  TEXT NOT NULL,
        format        TEXT NOT NULL,
        metadata      TEXT NOT NULL,
        token_count   INTEGER NOT NULL DEFAULT 0,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id            TEXT PRIMARY KEY,
        document_id   TEXT NOT NULL,
        content       TEXT NOT NULL,
        chunk_number  INTEGER NOT NULL,
        token_count   INTEGER NOT NULL,
        embedding     BLOB,
        CONSTRAINT fk_chunk_doc FOREIGN KEY (document_id)
            REFERENCES documents (id) ON DELETE CASCADE,
        CONSTRAINT uq_chunk_doc_number UNIQUE (document_id, chunk_number),
        CONSTRAINT ck_chunk_tokens_nonneg CHECK (token_count >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_indexes (
        id            TEXT PRIMARY KEY,
        document_id   TEXT NOT NULL UNIQUE,
        metadata      TEXT NOT NULL,
        last_accessed TEXT NOT NULL,
        access_count  INTEGER NOT NULL DEFAULT 0,
        CONSTRAINT fk_index_doc FOREIGN KEY (document_id)
            REFERENCES documents (id) ON DELETE CASCADE
    )
    "#,
];

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

fn metadata_to_json(metadata: &Metadata) -> MemoryResult<String> {
    Ok(serde_json::to_string(metadata)?)
}

fn metadata_from_json(raw: &str) -> MemoryResult<Metadata> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| MemoryError::Storage("metadata column is not a JSON object".into()))
}

fn parse_uuid(raw: &str) -> MemoryResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| MemoryError::Storage(format!("bad uuid in catalog: {e}")))
}

fn document_from_row(row: &sqlx::sqlite::SqliteRow) -> MemoryResult<Document> {
    Ok(Document {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        blob_ref: row.get("blob_ref"),
        blob_version: row.get("blob_version"),
        format: row.get::<String, _>("format").parse::<DocumentFormat>()?,
        metadata: metadata_from_json(&row.get::<String, _>("metadata"))?,
        token_count: row.get::<i64, _>("token_count") as u32,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> MemoryResult<DocumentChunk> {
    Ok(DocumentChunk {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        document_id: parse_uuid(&row.get::<String, _>("document_id"))?,
        content: row.get("content"),
        chunk_number: row.get::<i64, _>("chunk_number") as u32,
        token_count: row.get::<i64, _>("token_count") as u32,
        embedding: row
            .get::<Option<Vec<u8>>, _>("embedding")
            .map(|bytes| decode_embedding(&bytes)),
    })
}

fn index_from_row(row: &sqlx::sqlite::SqliteRow) -> MemoryResult<DocumentIndex> {
    Ok(DocumentIndex {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        document_id: parse_uuid(&row.get::<String, _>("document_id"))?,
        metadata: metadata_from_json(&row.get::<String, _>("metadata"))?,
        last_accessed: row.get::<DateTime<Utc>, _>("last_accessed"),
        access_count: row.get::<i64, _>("access_count") as u64,
    })
}

/// Transactional catalog over SQLite. Creation and chunk replacement run
/// in single write transactions; foreign keys cascade on delete.
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    /// Open (or create) the catalog at `url` and apply the schema.
    pub async fn connect(url: &str) -> MemoryResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MemoryError::Storage(format!("bad catalog url: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(url, "catalog store ready");
        Ok(store)
    }

    /// Private shared-cache database for tests and ephemeral use.
    pub async fn in_memory() -> MemoryResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| MemoryError::Storage(format!("bad catalog url: {e}")))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> MemoryResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Create the document, all its chunks and the index row in one
    /// write transaction. Re-execution with the same ids is a no-op, so
    /// the owning activity stays idempotent.
    pub async fn create_document(
        &self,
        document: &Document,
        chunks: &[DocumentChunk],
        index_metadata: &Metadata,
    ) -> MemoryResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO documents \
             (id, blob_ref, blob_version, format, metadata, token_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(document.id.to_string())
        .bind(&document.blob_ref)
        .bind(&document.blob_version)
        .bind(document.format.as_str())
        .bind(metadata_to_json(&document.metadata)?)
        .bind(document.token_count as i64)
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT OR IGNORE INTO chunks \
                 (id, document_id, content, chunk_number, token_count, embedding) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.id.to_string())
            .bind(chunk.document_id.to_string())
            .bind(&chunk.content)
            .bind(chunk.chunk_number as i64)
            .bind(chunk.token_count as i64)
            .bind(chunk.embedding.as_ref().map(|e| encode_embedding(e)))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT OR IGNORE INTO document_indexes \
             (id, document_id, metadata, last_accessed, access_count) \
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(Uuid::new_v5(&Uuid::NAMESPACE_OID, document.id.as_bytes()).to_string())
        .bind(document.id.to_string())
        .bind(metadata_to_json(index_metadata)?)
        .bind(document.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(document_id = %document.id, chunk_count = chunks.len(), "document persisted");
        Ok(())
    }

    pub async fn get_document(&self, document_id: &Uuid) -> MemoryResult<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(document_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("document not found: {document_id}")))?;
        document_from_row(&row)
    }

    pub async fn document_exists(&self, document_id: &Uuid) -> MemoryResult<bool> {
        let row = sqlx::query("SELECT 1 FROM documents WHERE id = ?")
            .bind(document_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Chunks of one document in chunk-number order.
    pub async fn get_chunks(&self, document_id: &Uuid) -> MemoryResult<Vec<DocumentChunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_number")
            .bind(document_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// Every chunk that carries an embedding, for vector candidate
    /// generation.
    pub async fn chunks_with_embeddings(&self) -> MemoryResult<Vec<DocumentChunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE embedding IS NOT NULL ORDER BY document_id, chunk_number",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    /// Replace the full chunk set and blob version of a document in one
    /// transaction (content update path).
    pub async fn replace_chunks(
        &self,
        document_id: &Uuid,
        chunks: &[DocumentChunk],
        blob_version: &str,
        metadata: &Metadata,
        token_count: u32,
        updated_at: DateTime<Utc>,
    ) -> MemoryResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE documents SET blob_version = ?, metadata = ?, token_count = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(blob_version)
        .bind(metadata_to_json(metadata)?)
        .bind(token_count as i64)
        .bind(updated_at)
        .bind(document_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(MemoryError::NotFound(format!("document not found: {document_id}")));
        }

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id.to_string())
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks \
                 (id, document_id, content, chunk_number, token_count, embedding) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(chunk.id.to_string())
            .bind(chunk.document_id.to_string())
            .bind(&chunk.content)
            .bind(chunk.chunk_number as i64)
            .bind(chunk.token_count as i64)
            .bind(chunk.embedding.as_ref().map(|e| encode_embedding(e)))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(%document_id, chunk_count = chunks.len(), "chunks replaced");
        Ok(())
    }

    /// Metadata-only update on the document row.
    pub async fn update_document_metadata(
        &self,
        document_id: &Uuid,
        metadata: &Metadata,
        updated_at: DateTime<Utc>,
    ) -> MemoryResult<()> {
        let updated = sqlx::query("UPDATE documents SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(metadata_to_json(metadata)?)
            .bind(updated_at)
            .bind(document_id.to_string())
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(MemoryError::NotFound(format!("document not found: {document_id}")));
        }
        Ok(())
    }

    /// Cascading delete. Returns true when a row existed.
    pub async fn delete_document(&self, document_id: &Uuid) -> MemoryResult<bool> {
        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    pub async fn get_index(&self, document_id: &Uuid) -> MemoryResult<DocumentIndex> {
        let row = sqlx::query("SELECT * FROM document_indexes WHERE document_id = ?")
            .bind(document_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MemoryError::NotFound(format!("index not found: {document_id}")))?;
        index_from_row(&row)
    }

    /// Bump access tracking. Safe to re-apply and safe to run outside
    /// the creating transaction.
    pub async fn record_access(&self, document_id: &Uuid, at: DateTime<Utc>) -> MemoryResult<()> {
        sqlx::query(
            "UPDATE document_indexes SET last_accessed = ?, access_count = access_count + 1 \
             WHERE document_id = ?",
        )
        .bind(at)
        .bind(document_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update index metadata, preserving reserved keys (prefix `_`) from
    /// the previous value.
    pub async fn update_index_metadata(
        &self,
        document_id: &Uuid,
        metadata: &Metadata,
    ) -> MemoryResult<DocumentIndex> {
        let existing = self.get_index(document_id).await?;

        let mut merged = metadata.clone();
        for (key, value) in existing.metadata.iter() {
            if key.starts_with('_') && !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }

        sqlx::query("UPDATE document_indexes SET metadata = ? WHERE document_id = ?")
            .bind(metadata_to_json(&merged)?)
            .bind(document_id.to_string())
            .execute(&self.pool)
            .await?;

        self.get_index(document_id).await
    }

    /// Most frequently accessed documents first.
    pub async fn most_accessed(&self, limit: usize) -> MemoryResult<Vec<DocumentIndex>> {
        let rows = sqlx::query(
            "SELECT * FROM document_indexes ORDER BY access_count DESC, last_accessed DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(index_from_row).collect()
    }

    /// Recently accessed documents, the candidate pool for the llm
    /// retrieval strategy.
    pub async fn recently_accessed_documents(&self, limit: usize) -> MemoryResult<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT d.* FROM documents d \
             JOIN document_indexes i ON i.document_id = d.id \
             ORDER BY i.last_accessed DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: serde_json::Value) -> Metadata {
        value.as_object().unwrap().clone()
    }

    fn sample_document(id: u128) -> Document {
        let now = Utc::now();
        let id = Uuid::from_u128(id);
        Document {
            id,
            blob_ref: Document::blob_key(&id),
            blob_version: "v1".into(),
            format: DocumentFormat::Text,
            metadata: meta(json!({"tag": "t1"})),
            token_count: 6,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_chunks(document_id: Uuid, count: u32) -> Vec<DocumentChunk> {
        (0..count)
            .map(|i| DocumentChunk {
                id: Uuid::new_v4(),
                document_id,
                content: format!("chunk {i}"),
                chunk_number: i,
                token_count: 3,
                embedding: Some(vec![0.6, 0.8]),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_create_and_fetch_document() {
        let store = CatalogStore::in_memory().await.unwrap();
        let document = sample_document(1);
        let chunks = sample_chunks(document.id, 2);

        store.create_document(&document, &chunks, &document.metadata).await.unwrap();

        let fetched = store.get_document(&document.id).await.unwrap();
        assert_eq!(fetched.id, document.id);
        assert_eq!(fetched.metadata["tag"], json!("t1"));

        let fetched_chunks = store.get_chunks(&document.id).await.unwrap();
        assert_eq!(fetched_chunks.len(), 2);
        assert_eq!(fetched_chunks[0].chunk_number, 0);
        assert_eq!(fetched_chunks[1].chunk_number, 1);
        assert_eq!(fetched_chunks[0].embedding.as_deref(), Some(&[0.6, 0.8][..]));
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = CatalogStore::in_memory().await.unwrap();
        let document = sample_document(2);
        let chunks = sample_chunks(document.id, 1);

        store.create_document(&document, &chunks, &document.metadata).await.unwrap();
        store.create_document(&document, &chunks, &document.metadata).await.unwrap();

        assert_eq!(store.get_chunks(&document.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = CatalogStore::in_memory().await.unwrap();
        let document = sample_document(3);
        let chunks = sample_chunks(document.id, 3);
        store.create_document(&document, &chunks, &document.metadata).await.unwrap();

        assert!(store.delete_document(&document.id).await.unwrap());
        assert!(store.get_chunks(&document.id).await.unwrap().is_empty());
        assert!(matches!(
            store.get_index(&document.id).await,
            Err(MemoryError::NotFound(_))
        ));

        // Second delete reports nothing to remove.
        assert!(!store.delete_document(&document.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_chunks_transactionally() {
        let store = CatalogStore::in_memory().await.unwrap();
        let document = sample_document(4);
        store
            .create_document(&document, &sample_chunks(document.id, 2), &document.metadata)
            .await
            .unwrap();

        let replacement = sample_chunks(document.id, 3);
        let updated_at = Utc::now();
        store
            .replace_chunks(&document.id, &replacement, "v2", &document.metadata, 9, updated_at)
            .await
            .unwrap();

        let fetched = store.get_document(&document.id).await.unwrap();
        assert_eq!(fetched.blob_version, "v2");
        assert_eq!(fetched.token_count, 9);
        assert_eq!(store.get_chunks(&document.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_record_access_and_most_accessed() {
        let store = CatalogStore::in_memory().await.unwrap();
        for i in 10..13u128 {
            let document = sample_document(i);
            store
                .create_document(&document, &sample_chunks(document.id, 1), &document.metadata)
                .await
                .unwrap();
        }

        let hot = Uuid::from_u128(11);
        for _ in 0..3 {
            store.record_access(&hot, Utc::now()).await.unwrap();
        }

        let ranked = store.most_accessed(2).await.unwrap();
        assert_eq!(ranked[0].document_id, hot);
        assert_eq!(ranked[0].access_count, 3);
    }

    #[tokio::test]
    async fn test_reserved_index_metadata_preserved() {
        let store = CatalogStore::in_memory().await.unwrap();
        let document = sample_document(20);
        store
            .create_document(
                &document,
                &sample_chunks(document.id, 1),
                &meta(json!({"_internal": "keep", "visible": "old"})),
            )
            .await
            .unwrap();

        let updated = store
            .update_index_metadata(&document.id, &meta(json!({"visible": "new"})))
            .await
            .unwrap();

        assert_eq!(updated.metadata["visible"], json!("new"));
        assert_eq!(updated.metadata["_internal"], json!("keep"));
    }

    #[tokio::test]
    async fn test_missing_document_not_found() {
        let store = CatalogStore::in_memory().await.unwrap();
        assert!(matches!(
            store.get_document(&Uuid::from_u128(999)).await,
            Err(MemoryError::NotFound(_))
        ));
    }
}
