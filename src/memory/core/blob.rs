// MNEMO Core - blob store adapter
// Versioned, content-addressed byte store with tombstone deletes and retry

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::memory::config::{BlobConfig, CircuitBreakerConfig};
use crate::memory::core::breaker::CircuitBreaker;
use crate::memory::{Metadata, MemoryError, MemoryResult, MAX_DOCUMENT_BYTES};

/// Bucket capabilities reported by the backing store.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub versioning_enabled: bool,
    pub encryption_enabled: bool,
}

/// Stored bytes plus metadata for one version.
#[derive(Debug, Clone)]
pub struct BlobObject {
    pub bytes: Vec<u8>,
    pub metadata: Metadata,
    pub version_id: String,
}

/// Vendor protocol for the byte store (consumed contract). The adapter
/// layers validation, retry and tombstone semantics on top.
#[async_trait]
pub trait BlobTransport: Send + Sync {
    async fn bucket_config(&self, bucket: &str) -> MemoryResult<BucketConfig>;
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>, metadata: Metadata)
        -> MemoryResult<String>;
    async fn get(&self, bucket: &str, key: &str, version_id: Option<&str>)
        -> MemoryResult<BlobObject>;
    /// Write a tombstone version; history is never destroyed.
    async fn delete(&self, bucket: &str, key: &str) -> MemoryResult<()>;
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version_id: String,
    /// None marks a tombstone.
    bytes: Option<Vec<u8>>,
    metadata: Metadata,
}

/// In-process transport with full version history. Used by tests and
/// local deployments; supports scripted fault injection so adapter
/// retry behavior is observable.
#[derive(Default)]
pub struct MemoryBlobTransport {
    objects: DashMap<String, Vec<StoredVersion>>,
    faults: Mutex<VecDeque<MemoryError>>,
}

impl MemoryBlobTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error to be returned by the next operation.
    pub fn inject_fault(&self, error: MemoryError) {
        self.faults.lock().unwrap().push_back(error);
    }

    fn take_fault(&self) -> Option<MemoryError> {
        self.faults.lock().unwrap().pop_front()
    }

    /// Number of stored versions (tombstones included) for a key.
    pub fn version_count(&self, key: &str) -> usize {
        self.objects.get(key).map(|v| v.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BlobTransport for MemoryBlobTransport {
    async fn bucket_config(&self, _bucket: &str) -> MemoryResult<BucketConfig> {
        Ok(BucketConfig {
            versioning_enabled: true,
            encryption_enabled: true,
        })
    }

    async fn put(
        &self,
        _bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        metadata: Metadata,
    ) -> MemoryResult<String> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let version_id = Uuid::new_v4().simple().to_string();
        self.objects.entry(key.to_string()).or_default().push(StoredVersion {
            version_id: version_id.clone(),
            bytes: Some(bytes),
            metadata,
        });
        Ok(version_id)
    }

    async fn get(
        &self,
        _bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> MemoryResult<BlobObject> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let versions = self
            .objects
            .get(key)
            .ok_or_else(|| MemoryError::NotFound(format!("blob not found: {key}")))?;

        let version = match version_id {
            Some(id) => versions.iter().find(|v| v.version_id == id),
            None => versions.last(),
        }
        .ok_or_else(|| MemoryError::NotFound(format!("blob version not found: {key}")))?;

        match &version.bytes {
            Some(bytes) => Ok(BlobObject {
                bytes: bytes.clone(),
                metadata: version.metadata.clone(),
                version_id: version.version_id.clone(),
            }),
            None => Err(MemoryError::NotFound(format!("blob deleted: {key}"))),
        }
    }

    async fn delete(&self, _bucket: &str, key: &str) -> MemoryResult<()> {
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let mut versions = self.objects.entry(key.to_string()).or_default();
        // Idempotent: an already-tombstoned key gains no second tombstone.
        if matches!(versions.last(), Some(v) if v.bytes.is_none()) {
            return Ok(());
        }
        versions.push(StoredVersion {
            version_id: Uuid::new_v4().simple().to_string(),
            bytes: None,
            metadata: Metadata::new(),
        });
        Ok(())
    }
}

/// Sliding one-second window limiting operations per second.
struct RateWindow {
    window_start: Instant,
    count: u32,
}

/// Blob store adapter: validates sizes, verifies bucket configuration at
/// startup, retries transient failures with exponential backoff, and
/// enforces the per-second operation cap.
pub struct BlobStoreAdapter {
    config: BlobConfig,
    transport: std::sync::Arc<dyn BlobTransport>,
    breaker: CircuitBreaker,
    rate: Mutex<RateWindow>,
}

impl BlobStoreAdapter {
    pub fn new(
        config: BlobConfig,
        transport: std::sync::Arc<dyn BlobTransport>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            config,
            transport,
            breaker: CircuitBreaker::new("blob-store", breaker_config),
            rate: Mutex::new(RateWindow {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Startup check: the bucket must have versioning and default
    /// server-side encryption enabled.
    pub async fn verify(&self) -> MemoryResult<()> {
        let bucket = self.transport.bucket_config(&self.config.bucket).await?;
        if !bucket.versioning_enabled {
            return Err(MemoryError::Storage(format!(
                "bucket {} misconfigured: versioning disabled",
                self.config.bucket
            )));
        }
        if !bucket.encryption_enabled {
            return Err(MemoryError::Storage(format!(
                "bucket {} misconfigured: server-side encryption disabled",
                self.config.bucket
            )));
        }
        info!(bucket = %self.config.bucket, "blob store verified");
        Ok(())
    }

    /// Store bytes under `key`; returns the new version id.
    pub async fn put(&self, key: &str, bytes: Vec<u8>, metadata: Metadata) -> MemoryResult<String> {
        if bytes.is_empty() {
            return Err(MemoryError::Validation("blob content is empty".into()));
        }
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(MemoryError::Validation(format!(
                "blob of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_DOCUMENT_BYTES
            )));
        }

        let version = self
            .with_retry("put", || {
                let bytes = bytes.clone();
                let metadata = metadata.clone();
                async move { self.transport.put(&self.config.bucket, key, bytes, metadata).await }
            })
            .await?;
        debug!(key, version = %version, size = bytes.len(), "blob stored");
        Ok(version)
    }

    /// Fetch the latest version, or a specific one.
    pub async fn get(&self, key: &str, version_id: Option<&str>) -> MemoryResult<BlobObject> {
        self.with_retry("get", || async move {
            self.transport.get(&self.config.bucket, key, version_id).await
        })
        .await
    }

    /// Tombstone the key. History is preserved; the call is idempotent.
    pub async fn delete(&self, key: &str) -> MemoryResult<()> {
        self.with_retry("delete", || async move {
            self.transport.delete(&self.config.bucket, key).await
        })
        .await?;
        debug!(key, "blob tombstoned");
        Ok(())
    }

    /// Retry transient failures with exponential backoff; validation and
    /// not-found errors are terminal.
    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> MemoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = MemoryResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            self.throttle().await;
            self.breaker.check()?;

            match call().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt);
                    warn!(operation, attempt, ?delay, "blob operation failed, retrying: {err}");
                    self.breaker.record_failure();
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retryable() {
                        self.breaker.record_failure();
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Enforce the operations-per-second cap with a one-second window.
    async fn throttle(&self) {
        loop {
            let wait = {
                let mut rate = self.rate.lock().unwrap();
                let elapsed = rate.window_start.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    rate.window_start = Instant::now();
                    rate.count = 0;
                }
                if rate.count < self.config.ops_per_second {
                    rate.count += 1;
                    None
                } else {
                    Some(Duration::from_secs(1).saturating_sub(elapsed))
                }
            };
            match wait {
                None => return,
                Some(delay) => sleep(delay.max(Duration::from_millis(1))).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn adapter(transport: Arc<MemoryBlobTransport>) -> BlobStoreAdapter {
        BlobStoreAdapter::new(
            BlobConfig {
                retry_base_delay: Duration::from_millis(1),
                ..BlobConfig::default()
            },
            transport,
            CircuitBreakerConfig::default(),
        )
    }

    fn meta() -> Metadata {
        json!({"format": "text"}).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let transport = Arc::new(MemoryBlobTransport::new());
        let adapter = adapter(transport);

        let version = adapter.put("documents/d1", b"hello".to_vec(), meta()).await.unwrap();
        let object = adapter.get("documents/d1", None).await.unwrap();
        assert_eq!(object.bytes, b"hello");
        assert_eq!(object.version_id, version);
    }

    #[tokio::test]
    async fn test_versioning_keeps_history() {
        let transport = Arc::new(MemoryBlobTransport::new());
        let adapter = adapter(transport);

        let v1 = adapter.put("k", b"one".to_vec(), meta()).await.unwrap();
        let v2 = adapter.put("k", b"two".to_vec(), meta()).await.unwrap();
        assert_ne!(v1, v2);

        assert_eq!(adapter.get("k", Some(&v1)).await.unwrap().bytes, b"one");
        assert_eq!(adapter.get("k", None).await.unwrap().bytes, b"two");
    }

    #[tokio::test]
    async fn test_delete_tombstones_idempotently() {
        let transport = Arc::new(MemoryBlobTransport::new());
        let adapter = adapter(transport.clone());

        adapter.put("k", b"bytes".to_vec(), meta()).await.unwrap();
        adapter.delete("k").await.unwrap();
        assert!(matches!(adapter.get("k", None).await, Err(MemoryError::NotFound(_))));

        let versions_after_first = transport.version_count("k");
        adapter.delete("k").await.unwrap();
        assert_eq!(transport.version_count("k"), versions_after_first);
    }

    #[tokio::test]
    async fn test_size_limits() {
        let transport = Arc::new(MemoryBlobTransport::new());
        let adapter = adapter(transport);

        // Exactly at the limit stores.
        let exact = vec![0u8; MAX_DOCUMENT_BYTES];
        assert!(adapter.put("exact", exact, meta()).await.is_ok());

        // One byte over fails with Validation.
        let over = vec![0u8; MAX_DOCUMENT_BYTES + 1];
        let err = adapter.put("over", over, meta()).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let transport = Arc::new(MemoryBlobTransport::new());
        transport.inject_fault(MemoryError::Upstream("connection reset".into()));
        transport.inject_fault(MemoryError::Upstream("endpoint unreachable".into()));
        let adapter = adapter(transport);

        // Two transient faults, then success within the retry budget.
        let version = adapter.put("k", b"persisted".to_vec(), meta()).await;
        assert!(version.is_ok());
    }

    #[tokio::test]
    async fn test_not_found_is_terminal() {
        let transport = Arc::new(MemoryBlobTransport::new());
        let adapter = adapter(transport);
        assert!(matches!(
            adapter.get("missing", None).await,
            Err(MemoryError::NotFound(_))
        ));
    }
}
