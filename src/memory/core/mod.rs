// MNEMO Core - storage, caching, crypto and graph infrastructure

pub mod blob;
pub mod breaker;
pub mod cache;
pub mod catalog;
pub mod crypto;
pub mod graph;

pub use blob::{BlobObject, BlobStoreAdapter, BlobTransport, BucketConfig, MemoryBlobTransport};
pub use breaker::CircuitBreaker;
pub use cache::{spawn_sweeper, CacheOutcome, CacheStats, ChunkCache};
pub use catalog::CatalogStore;
pub use crypto::{DataKey, EncryptedPayload, EnvelopeCrypto, KeyManager, LocalKeyManager};
pub use graph::{
    CommonEntity, EntityExtractor, KnowledgeGraph, RelatedDocument, WordFrequencyExtractor,
};
