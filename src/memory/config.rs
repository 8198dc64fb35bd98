// MNEMO Memory Module - typed configuration records
// Every tunable lives here; components receive their record at construction

use std::time::Duration;

/// Retry policy applied by the workflow engine and the external-service
/// clients. Delays grow as `initial * backoff^attempt`, capped at
/// `max_interval`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt as i32);
        let delay = self.initial_interval.mul_f64(factor);
        delay.min(self.max_interval)
    }
}

/// Deadlines for workflows and activities.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    /// Whole-workflow budget.
    pub schedule_to_close: Duration,
    /// Single activity attempt budget.
    pub start_to_close: Duration,
    /// Maximum silence between activity heartbeats.
    pub heartbeat: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            schedule_to_close: Duration::from_secs(300),
            start_to_close: Duration::from_secs(30),
            heartbeat: Duration::from_secs(2),
        }
    }
}

/// Token-aware chunker settings.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target tokens per chunk before overlap.
    pub target_tokens: usize,
    /// Tokens borrowed from each neighbour chunk.
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 4000,
            overlap_tokens: 200,
        }
    }
}

/// Chunk cache bounds. `memory_threshold` is the fraction of
/// `memory_budget_bytes` past which new inserts are refused.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl: Duration,
    pub cleanup_interval: Duration,
    pub memory_budget_bytes: usize,
    pub memory_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            memory_budget_bytes: 256 * 1024 * 1024,
            memory_threshold: 0.75,
        }
    }
}

/// Embedding client settings (OpenAI-style REST endpoint).
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimension: usize,
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "text-embedding-ada-002".to_string(),
            dimension: 1536,
            max_batch_size: 100,
            max_concurrency: 10,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Completion-model client settings for reasoning and selection.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub reason_max_tokens: u32,
    pub select_max_tokens: u32,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4".to_string(),
            temperature: 0.0,
            reason_max_tokens: 1000,
            select_max_tokens: 500,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Blob store adapter settings.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub bucket: String,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound on blob operations per second.
    pub ops_per_second: u32,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            bucket: "mnemo-documents".to_string(),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            ops_per_second: 50,
        }
    }
}

/// Envelope-encryption settings.
#[derive(Debug, Clone)]
pub struct CryptoConfig {
    /// Master key id handed to the key manager.
    pub key_id: String,
    /// How long wrapped data keys stay in the key cache.
    pub key_cache_ttl: Duration,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_id: "mnemo-master".to_string(),
            key_cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Knowledge graph settings.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub max_depth: u32,
    pub min_similarity: f32,
    pub min_edge_weight: f32,
    pub query_cache_ttl: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_similarity: 0.7,
            min_edge_weight: 0.1,
            query_cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// Retrieval planner settings: similarity floor and per-strategy latency
/// budgets.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub similarity_threshold: f32,
    pub vector_budget: Duration,
    pub llm_budget: Duration,
    pub hybrid_budget: Duration,
    pub rag_kg_budget: Duration,
    pub default_limit: usize,
    /// Cap on the catalog candidate pool fed to the llm strategy.
    pub llm_candidate_cap: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            vector_budget: Duration::from_millis(500),
            llm_budget: Duration::from_millis(3000),
            hybrid_budget: Duration::from_millis(3500),
            rag_kg_budget: Duration::from_millis(4000),
            default_limit: 10,
            llm_candidate_cap: 40,
        }
    }
}

/// Failure counting for external services: after `failure_threshold`
/// consecutive failures the breaker opens for `open_for`.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_for: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_for: Duration::from_secs(60),
        }
    }
}

/// Workflow engine bounds.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub max_concurrent_activities: usize,
    pub max_cached_workflows: usize,
    pub retry: RetryPolicy,
    pub timeout: TimeoutPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent_activities: 50,
            max_cached_workflows: 1000,
            retry: RetryPolicy::default(),
            timeout: TimeoutPolicy::default(),
        }
    }
}

/// Top-level configuration handed to the service container.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    pub chunker: ChunkerConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub blob: BlobConfig,
    pub crypto: CryptoConfig,
    pub graph: GraphConfig,
    pub planner: PlannerConfig,
    pub breaker: CircuitBreakerConfig,
    pub workflow: WorkflowConfig,
    /// SQLite URL for the catalog store.
    pub catalog_url: String,
}

impl MemoryConfig {
    /// Environment-driven configuration for the worker binary. Only the
    /// secrets and endpoints come from the environment; tunables keep
    /// their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("MNEMO_CATALOG_URL") {
            config.catalog_url = url;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.embedding.api_key = key.clone();
            config.llm.api_key = key;
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.embedding.base_url = url.clone();
            config.llm.base_url = url;
        }
        if let Ok(bucket) = std::env::var("MNEMO_BLOB_BUCKET") {
            config.blob.bucket = bucket;
        }
        config
    }
}
