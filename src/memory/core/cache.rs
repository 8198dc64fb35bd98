// MNEMO Core - chunk cache
// LRU + TTL map from chunk id to chunk payload with memory-pressure control

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::memory::config::CacheConfig;
use crate::memory::DocumentChunk;

/// Outcome of a `put`. A skipped insert under memory pressure is normal
/// operation, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Stored,
    Skipped,
}

#[derive(Debug)]
struct CacheEntry {
    chunk: DocumentChunk,
    inserted_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    approx_size: usize,
}

impl CacheEntry {
    fn new(chunk: DocumentChunk, ttl: Duration) -> Self {
        let now = Instant::now();
        let approx_size = approximate_size(&chunk);
        Self {
            chunk,
            inserted_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            access_count: 0,
            approx_size,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

fn approximate_size(chunk: &DocumentChunk) -> usize {
    let embedding_bytes = chunk.embedding.as_ref().map(|e| e.len() * 4).unwrap_or(0);
    chunk.content.len() + embedding_bytes + 128
}

/// Counter snapshot for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub skipped: u64,
    pub entries: usize,
    pub memory_bytes: usize,
}

struct CacheInner {
    entries: LruCache<Uuid, CacheEntry>,
    memory_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    skipped: u64,
}

/// Bounded chunk cache. One exclusive lock guards the map; every
/// operation is O(1) map work with no I/O under the lock. Callers treat
/// the cache as best-effort: a miss or eviction is never an error.
pub struct ChunkCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ChunkCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries.max(1)).unwrap();
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                memory_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                skipped: 0,
            }),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    /// Fetch a chunk. Expired entries are removed on sight and reported
    /// as misses.
    pub fn get(&self, chunk_id: &Uuid) -> Option<DocumentChunk> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let expired = match inner.entries.peek(chunk_id) {
            Some(entry) => entry.is_expired(now),
            None => {
                inner.misses += 1;
                return None;
            }
        };

        if expired {
            if let Some(entry) = inner.entries.pop(chunk_id) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.approx_size);
            }
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        let chunk = {
            let entry = inner.entries.get_mut(chunk_id)?;
            entry.last_accessed = now;
            entry.access_count += 1;
            entry.chunk.clone()
        };
        inner.hits += 1;
        Some(chunk)
    }

    /// Insert a chunk. Under memory pressure the insert is refused and
    /// `Skipped` is returned; capacity overflow evicts the least
    /// recently accessed entries first.
    pub fn put(&self, chunk: DocumentChunk, ttl: Option<Duration>) -> CacheOutcome {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry::new(chunk, ttl);
        let entry_size = entry.approx_size;
        let chunk_id = entry.chunk.id;

        let mut inner = self.inner.lock().unwrap();

        let threshold =
            (self.config.memory_budget_bytes as f64 * self.config.memory_threshold) as usize;
        let replaced_size = inner
            .entries
            .peek(&chunk_id)
            .map(|existing| existing.approx_size)
            .unwrap_or(0);
        if inner.memory_bytes - replaced_size + entry_size > threshold {
            inner.skipped += 1;
            debug!(%chunk_id, entry_size, "cache insert skipped under memory pressure");
            return CacheOutcome::Skipped;
        }

        if let Some((evicted_id, evicted)) = inner.entries.push(chunk_id, entry) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(evicted.approx_size);
            if evicted_id != chunk_id {
                inner.evictions += 1;
                debug!(%evicted_id, "cache evicted least-recently-used entry");
            }
        }
        inner.memory_bytes += entry_size;
        CacheOutcome::Stored
    }

    /// Remove one entry; true when it was present.
    pub fn delete(&self, chunk_id: &Uuid) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.pop(chunk_id) {
            Some(entry) => {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.approx_size);
                true
            }
            None => false,
        }
    }

    /// Drop every cached chunk of a document. Returns the removed count.
    pub fn invalidate_document(&self, document_id: &Uuid) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<Uuid> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.chunk.document_id == *document_id)
            .map(|(id, _)| *id)
            .collect();

        for id in &doomed {
            if let Some(entry) = inner.entries.pop(id) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.approx_size);
            }
        }
        if !doomed.is_empty() {
            debug!(%document_id, count = doomed.len(), "cache invalidated for document");
        }
        doomed.len()
    }

    /// Remove all expired entries; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let expired: Vec<Uuid> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = inner.entries.pop(id) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.approx_size);
                inner.expirations += 1;
            }
        }

        if !expired.is_empty() {
            info!(removed = expired.len(), "cache sweep removed expired entries");
        }
        expired.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.memory_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            skipped: inner.skipped,
            entries: inner.entries.len(),
            memory_bytes: inner.memory_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Background sweeper: runs `sweep` every cleanup interval until the
/// task is aborted.
pub fn spawn_sweeper(cache: std::sync::Arc<ChunkCache>) -> tokio::task::JoinHandle<()> {
    let interval = cache.cleanup_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            cache.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u128, doc: u128, content: &str) -> DocumentChunk {
        DocumentChunk {
            id: Uuid::from_u128(id),
            document_id: Uuid::from_u128(doc),
            content: content.to_string(),
            chunk_number: 0,
            token_count: 1,
            embedding: None,
        }
    }

    fn small_cache(max_entries: usize) -> ChunkCache {
        ChunkCache::new(CacheConfig {
            max_entries,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_get_put_roundtrip() {
        let cache = small_cache(10);
        let c = chunk(1, 100, "payload");
        assert_eq!(cache.put(c.clone(), None), CacheOutcome::Stored);
        let fetched = cache.get(&c.id).unwrap();
        assert_eq!(fetched.content, "payload");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = small_cache(3);
        for i in 1..=4u128 {
            cache.put(chunk(i, 100, "x"), None);
        }
        // c1 was least recently used and must be gone.
        assert!(cache.get(&Uuid::from_u128(1)).is_none());
        for i in 2..=4u128 {
            assert!(cache.get(&Uuid::from_u128(i)).is_some(), "c{i} missing");
        }
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.len() <= 3);
    }

    #[test]
    fn test_ttl_expiry_and_sweep() {
        let cache = small_cache(10);
        cache.put(chunk(1, 100, "short lived"), Some(Duration::from_millis(10)));
        cache.put(chunk(2, 100, "long lived"), Some(Duration::from_secs(3600)));

        std::thread::sleep(Duration::from_millis(25));

        assert!(cache.get(&Uuid::from_u128(1)).is_none());
        assert_eq!(cache.stats().expirations, 1);

        cache.put(chunk(3, 100, "also short"), Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.sweep(), 1);
        assert!(cache.get(&Uuid::from_u128(2)).is_some());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let cache = small_cache(10);
        cache.put(chunk(1, 100, "x"), None);
        assert!(cache.delete(&Uuid::from_u128(1)));
        assert!(!cache.delete(&Uuid::from_u128(1)));
    }

    #[test]
    fn test_invalidate_document_removes_all_its_chunks() {
        let cache = small_cache(10);
        cache.put(chunk(1, 100, "a"), None);
        cache.put(chunk(2, 100, "b"), None);
        cache.put(chunk(3, 200, "c"), None);

        assert_eq!(cache.invalidate_document(&Uuid::from_u128(100)), 2);
        assert!(cache.get(&Uuid::from_u128(1)).is_none());
        assert!(cache.get(&Uuid::from_u128(3)).is_some());
    }

    #[test]
    fn test_memory_pressure_skips_put() {
        let cache = ChunkCache::new(CacheConfig {
            max_entries: 100,
            memory_budget_bytes: 1024,
            memory_threshold: 0.5,
            ..CacheConfig::default()
        });

        // Each entry is ~128 bytes of overhead plus content.
        let big = "z".repeat(600);
        assert_eq!(cache.put(chunk(1, 100, &big), None), CacheOutcome::Skipped);
        assert_eq!(cache.put(chunk(2, 100, "small"), None), CacheOutcome::Stored);
        assert_eq!(cache.stats().skipped, 1);
    }

    #[test]
    fn test_capacity_invariant_after_mutations() {
        let cache = small_cache(5);
        for i in 0..50u128 {
            cache.put(chunk(i, 1, "x"), None);
            assert!(cache.len() <= 5);
        }
    }
}
