// MNEMO - document memory service for LLM agents
// Service container wiring the memory engine together

pub mod memory;

use std::sync::Arc;
use tracing::{info, warn};

use memory::config::MemoryConfig;
use memory::core::{
    spawn_sweeper, BlobStoreAdapter, BlobTransport, CatalogStore, ChunkCache, EntityExtractor,
    EnvelopeCrypto, KeyManager, KnowledgeGraph, LocalKeyManager, MemoryBlobTransport,
    WordFrequencyExtractor,
};
use memory::processing::{
    Chunker, EmbeddingClient, EmbeddingTransport, HttpEmbeddingTransport, HttpLlmTransport,
    LlmClient, LlmTransport,
};
use memory::search::RetrievalPlanner;
use memory::service::DocumentService;
use memory::workflow::{Activities, WorkflowEngine, Workflows};
use memory::MemoryResult;

/// External collaborators the engine consumes. Production deployments
/// plug vendor transports in here; tests use the in-process ones.
pub struct Transports {
    pub blob: Arc<dyn BlobTransport>,
    pub key_manager: Arc<dyn KeyManager>,
    pub embedding: Arc<dyn EmbeddingTransport>,
    pub llm: Arc<dyn LlmTransport>,
    pub extractor: Arc<dyn EntityExtractor>,
}

impl Transports {
    /// HTTP transports for the model APIs plus in-process blob store and
    /// key manager. The master secret comes from `MNEMO_MASTER_KEY`; a
    /// random one is generated (and logged as a warning) otherwise.
    pub fn from_config(config: &MemoryConfig) -> MemoryResult<Self> {
        let master_secret = match std::env::var("MNEMO_MASTER_KEY") {
            Ok(secret) => secret.into_bytes(),
            Err(_) => {
                warn!("MNEMO_MASTER_KEY not set, using an ephemeral master key");
                uuid::Uuid::new_v4().as_bytes().to_vec()
            }
        };

        Ok(Self {
            blob: Arc::new(MemoryBlobTransport::new()),
            key_manager: Arc::new(LocalKeyManager::new(master_secret)),
            embedding: Arc::new(HttpEmbeddingTransport::new(&config.embedding)?),
            llm: Arc::new(HttpLlmTransport::new(&config.llm)?),
            extractor: Arc::new(WordFrequencyExtractor),
        })
    }
}

/// Explicit collaborator graph constructed once at startup. No global
/// mutable state: everything downstream borrows from here.
pub struct ServiceContainer {
    pub config: MemoryConfig,
    pub service: Arc<DocumentService>,
    pub workflows: Arc<Workflows>,
    pub planner: Arc<RetrievalPlanner>,
    pub activities: Arc<Activities>,
    pub cache: Arc<ChunkCache>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ServiceContainer {
    /// Wire the full engine: verify the blob bucket, open the catalog,
    /// start the cache sweeper, and assemble the service façade.
    pub async fn new(config: MemoryConfig, transports: Transports) -> MemoryResult<Self> {
        let catalog = Arc::new(if config.catalog_url.is_empty() {
            CatalogStore::in_memory().await?
        } else {
            CatalogStore::connect(&config.catalog_url).await?
        });

        let blob = Arc::new(BlobStoreAdapter::new(
            config.blob.clone(),
            transports.blob,
            config.breaker.clone(),
        ));
        blob.verify().await?;

        let crypto = Arc::new(EnvelopeCrypto::new(config.crypto.clone(), transports.key_manager));
        let embedding = Arc::new(EmbeddingClient::new(
            config.embedding.clone(),
            transports.embedding,
            config.breaker.clone(),
        ));
        let llm = Arc::new(LlmClient::new(
            config.llm.clone(),
            transports.llm,
            config.breaker.clone(),
        ));

        let cache = Arc::new(ChunkCache::new(config.cache.clone()));
        let sweeper = spawn_sweeper(cache.clone());

        let graph = Arc::new(KnowledgeGraph::new(config.graph.clone()));

        let activities = Arc::new(Activities {
            chunker: Chunker::new(config.chunker.clone()),
            embedding,
            llm,
            cache: cache.clone(),
            crypto,
            blob,
            catalog,
            graph,
            extractor: transports.extractor,
        });

        let engine = Arc::new(WorkflowEngine::new(config.workflow.clone()));
        let workflows = Arc::new(Workflows::new(engine, activities.clone()));
        let planner = Arc::new(RetrievalPlanner::new(activities.clone(), config.planner.clone()));
        let service = Arc::new(DocumentService::new(workflows.clone(), planner.clone()));

        info!("service container assembled");
        Ok(Self {
            config,
            service,
            workflows,
            planner,
            activities,
            cache,
            sweeper,
        })
    }
}

impl Drop for ServiceContainer {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
