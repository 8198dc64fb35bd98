// MNEMO Processing - embedding client
// Batched vectorization with content-hash caching and bounded concurrency

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::memory::config::{CircuitBreakerConfig, EmbeddingConfig};
use crate::memory::core::breaker::CircuitBreaker;
use crate::memory::{MemoryError, MemoryResult};

/// Vendor protocol for turning texts into raw vectors. The production
/// transport speaks the OpenAI embeddings REST API; tests plug in a
/// deterministic local transport.
#[async_trait]
pub trait EmbeddingTransport: Send + Sync {
    async fn embed(&self, model: &str, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-style REST transport.
pub struct HttpEmbeddingTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmbeddingTransport {
    pub fn new(config: &EmbeddingConfig) -> MemoryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| MemoryError::Upstream(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl EmbeddingTransport for HttpEmbeddingTransport {
    async fn embed(&self, model: &str, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model,
            input: texts,
            encoding_format: "float",
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => MemoryError::RateLimited(format!("embedding API throttled: {body}")),
                401 | 403 => MemoryError::Authentication(format!("embedding API rejected key: {status}")),
                400 => MemoryError::Validation(format!("embedding API rejected input: {body}")),
                _ => MemoryError::Upstream(format!("embedding API error {status}: {body}")),
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Scale a vector to unit length.
pub fn normalize_vector(vector: &[f32]) -> MemoryResult<Vec<f32>> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(MemoryError::Upstream("embedding vector has zero norm".into()));
    }
    Ok(vector.iter().map(|x| x / norm).collect())
}

/// Cosine similarity of unit vectors, clipped to [0, 1] at the retrieval
/// boundary.
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot.clamp(0.0, 1.0)
}

/// Embedding client: batches of at most `max_batch_size`, a concurrency
/// semaphore, exponential backoff on rate limits, and a per-process
/// content-hash cache so identical input always yields byte-identical
/// vectors.
pub struct EmbeddingClient {
    config: EmbeddingConfig,
    transport: Arc<dyn EmbeddingTransport>,
    cache: DashMap<[u8; 32], Vec<f32>>,
    semaphore: Arc<Semaphore>,
    breaker: CircuitBreaker,
}

impl EmbeddingClient {
    pub fn new(
        config: EmbeddingConfig,
        transport: Arc<dyn EmbeddingTransport>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            transport,
            cache: DashMap::new(),
            semaphore,
            breaker: CircuitBreaker::new("embedding", breaker_config),
        }
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    /// Unit vector for a single text.
    pub async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        Ok(vectors.remove(0))
    }

    /// Unit vectors for all texts, output order matching input order.
    pub async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(empty) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(MemoryError::Validation(format!(
                "cannot embed empty text at position {empty}"
            )));
        }

        // Resolve cache hits first; only misses travel to the API.
        let keys: Vec<[u8; 32]> = texts.iter().map(|t| *blake3::hash(t.as_bytes()).as_bytes()).collect();
        let mut resolved: Vec<Option<Vec<f32>>> = keys
            .iter()
            .map(|key| self.cache.get(key).map(|v| v.clone()))
            .collect();

        let miss_positions: Vec<usize> =
            resolved.iter().enumerate().filter(|(_, v)| v.is_none()).map(|(i, _)| i).collect();

        if !miss_positions.is_empty() {
            debug!(
                total = texts.len(),
                misses = miss_positions.len(),
                "embedding batch (cache partial)"
            );

            let miss_texts: Vec<String> =
                miss_positions.iter().map(|&i| texts[i].clone()).collect();

            let batches: Vec<Vec<String>> = miss_texts
                .chunks(self.config.max_batch_size.max(1))
                .map(|c| c.to_vec())
                .collect();

            let futures = batches.into_iter().map(|batch| self.embed_one_batch(batch));
            let results = try_join_all(futures).await?;

            let mut flat = results.into_iter().flatten();
            for &position in &miss_positions {
                let raw = flat
                    .next()
                    .ok_or_else(|| MemoryError::Upstream("embedding API returned short batch".into()))?;
                if raw.len() != self.config.dimension {
                    return Err(MemoryError::Upstream(format!(
                        "embedding dimension mismatch: expected {}, got {}",
                        self.config.dimension,
                        raw.len()
                    )));
                }
                let normalized = normalize_vector(&raw)?;
                self.cache.insert(keys[position], normalized.clone());
                resolved[position] = Some(normalized);
            }
        }

        Ok(resolved.into_iter().map(|v| v.expect("all positions resolved")).collect())
    }

    /// One API batch under the concurrency semaphore, with backoff on
    /// rate limits.
    async fn embed_one_batch(&self, texts: Vec<String>) -> MemoryResult<Vec<Vec<f32>>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| MemoryError::Upstream("embedding semaphore closed".into()))?;

        let mut attempt = 0u32;
        loop {
            self.breaker.check()?;
            match self.transport.embed(&self.config.model, &texts).await {
                Ok(vectors) => {
                    self.breaker.record_success();
                    return Ok(vectors);
                }
                Err(err @ MemoryError::RateLimited(_)) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt);
                    warn!(attempt, ?delay, "embedding rate limited, backing off: {err}");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic transport: vector derived from the text hash.
    pub struct HashTransport {
        pub dimension: usize,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingTransport for HashTransport {
        async fn embed(&self, _model: &str, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|text| {
                    let hash = blake3::hash(text.as_bytes());
                    hash.as_bytes()
                        .iter()
                        .cycle()
                        .take(self.dimension)
                        .map(|&b| b as f32 + 1.0)
                        .collect()
                })
                .collect())
        }
    }

    fn client(dimension: usize) -> EmbeddingClient {
        let config = EmbeddingConfig {
            dimension,
            ..EmbeddingConfig::default()
        };
        EmbeddingClient::new(
            config,
            Arc::new(HashTransport {
                dimension,
                calls: AtomicUsize::new(0),
            }),
            CircuitBreakerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_vectors_are_unit_length() {
        let client = client(8);
        let vector = client.embed("the quick brown fox").await.unwrap();
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_batch_preserves_order_and_caches() {
        let transport = Arc::new(HashTransport {
            dimension: 8,
            calls: AtomicUsize::new(0),
        });
        let client = EmbeddingClient::new(
            EmbeddingConfig {
                dimension: 8,
                ..EmbeddingConfig::default()
            },
            transport.clone(),
            CircuitBreakerConfig::default(),
        );

        let texts = vec!["alpha".to_string(), "beta".to_string(), "alpha".to_string()];
        let vectors = client.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);

        // Second call is fully cached.
        let before = transport.calls.load(Ordering::SeqCst);
        let again = client.embed_batch(&texts).await.unwrap();
        assert_eq!(again, vectors);
        assert_eq!(transport.calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let client = client(8);
        let err = client.embed("   ").await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn test_similarity_clipped() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert_eq!(similarity(&a, &b), 0.0);
        assert!((similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_rejected() {
        assert!(normalize_vector(&[0.0, 0.0]).is_err());
    }
}
