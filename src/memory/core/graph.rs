// MNEMO Core - knowledge graph
// Weighted bipartite graph of documents and entities with k-hop traversal

use dashmap::DashMap;
use petgraph::stable_graph::{NodeIndex, StableUnGraph};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::RwLock;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::memory::config::GraphConfig;
use crate::memory::{Metadata, MemoryError, MemoryResult};

/// Upper bound on traversal results.
const MAX_RELATED_RESULTS: usize = 100;

/// Weight multipliers for entity extraction: document body vs chunks.
const BODY_WEIGHT: f32 = 0.6;
const CHUNK_WEIGHT: f32 = 0.4;

#[derive(Debug, Clone)]
enum GraphNode {
    Document {
        id: Uuid,
        metadata: Metadata,
        entities: HashMap<String, f32>,
    },
    Entity {
        name: String,
        document_count: usize,
    },
}

/// One traversal hit: a document reachable from the query document,
/// with the path strength (product of edge weights) and shared entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedDocument {
    pub document_id: Uuid,
    pub strength: f32,
    pub depth: u32,
    pub metadata: Metadata,
    pub common_entities: Vec<CommonEntity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonEntity {
    pub name: String,
    pub weight: f32,
}

/// Pluggable entity extraction. The default lowercases word tokens
/// longer than three characters; a named-entity recognizer can replace
/// it without touching the graph.
pub trait EntityExtractor: Send + Sync {
    /// Weighted name → score map, normalized to (0, 1] with a floor.
    fn extract(&self, body: &str, chunks: &[String], min_weight: f32) -> HashMap<String, f32>;
}

#[derive(Debug, Default)]
pub struct WordFrequencyExtractor;

impl WordFrequencyExtractor {
    fn frequencies(content: &str) -> HashMap<String, f32> {
        let words: Vec<String> = content
            .split_whitespace()
            .map(|w| {
                w.chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|w| w.len() > 3)
            .collect();

        let total = content.split_whitespace().count().max(1) as f32;
        let mut counts: HashMap<String, f32> = HashMap::new();
        for word in words {
            *counts.entry(word).or_insert(0.0) += 1.0;
        }
        counts.into_iter().map(|(word, count)| (word, count / total)).collect()
    }
}

impl EntityExtractor for WordFrequencyExtractor {
    fn extract(&self, body: &str, chunks: &[String], min_weight: f32) -> HashMap<String, f32> {
        let mut weights: HashMap<String, f32> = HashMap::new();

        for (name, frequency) in Self::frequencies(body) {
            *weights.entry(name).or_insert(0.0) += frequency * BODY_WEIGHT;
        }
        for chunk in chunks {
            for (name, frequency) in Self::frequencies(chunk) {
                *weights.entry(name).or_insert(0.0) += frequency * CHUNK_WEIGHT;
            }
        }

        let max_weight = weights.values().cloned().fold(0.0_f32, f32::max);
        if max_weight <= 0.0 {
            return HashMap::new();
        }
        weights
            .into_iter()
            .map(|(name, weight)| (name, (weight / max_weight).max(min_weight)))
            .collect()
    }
}

struct GraphInner {
    graph: StableUnGraph<GraphNode, f32>,
    documents: HashMap<Uuid, NodeIndex>,
    entities: HashMap<String, NodeIndex>,
}

/// Heap entry for the weighted traversal; strongest paths first.
struct Frontier {
    strength: f32,
    depth: u32,
    node: NodeIndex,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.strength == other.strength
    }
}
impl Eq for Frontier {}
impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.strength.partial_cmp(&other.strength).unwrap_or(Ordering::Equal)
    }
}

/// Knowledge graph guarded by a single reader/writer lock. Mutators take
/// the write lock; `related_documents` takes the read lock. Entity
/// extraction happens outside the lock with inputs snapshotted by the
/// caller.
pub struct KnowledgeGraph {
    config: GraphConfig,
    inner: RwLock<GraphInner>,
    query_cache: DashMap<String, (Instant, Vec<RelatedDocument>)>,
}

impl KnowledgeGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(GraphInner {
                graph: StableUnGraph::default(),
                documents: HashMap::new(),
                entities: HashMap::new(),
            }),
            query_cache: DashMap::new(),
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Add or replace a document node and its entity edges.
    pub fn insert_document(
        &self,
        document_id: Uuid,
        metadata: Metadata,
        entities: HashMap<String, f32>,
    ) {
        let mut inner = self.inner.write().unwrap();
        Self::remove_doc_edges(&mut inner, &document_id);

        let clamped: HashMap<String, f32> = entities
            .into_iter()
            .map(|(name, weight)| (name, weight.clamp(self.config.min_edge_weight, 1.0)))
            .collect();

        let doc_idx = match inner.documents.get(&document_id).copied() {
            Some(idx) => {
                if let Some(GraphNode::Document { metadata: m, entities: e, .. }) =
                    inner.graph.node_weight_mut(idx)
                {
                    *m = metadata;
                    *e = clamped.clone();
                }
                idx
            }
            None => {
                let idx = inner.graph.add_node(GraphNode::Document {
                    id: document_id,
                    metadata,
                    entities: clamped.clone(),
                });
                inner.documents.insert(document_id, idx);
                idx
            }
        };

        for (name, weight) in clamped {
            let entity_idx = match inner.entities.get(&name).copied() {
                Some(idx) => {
                    if let Some(GraphNode::Entity { document_count, .. }) =
                        inner.graph.node_weight_mut(idx)
                    {
                        *document_count += 1;
                    }
                    idx
                }
                None => {
                    let idx = inner.graph.add_node(GraphNode::Entity {
                        name: name.clone(),
                        document_count: 1,
                    });
                    inner.entities.insert(name, idx);
                    idx
                }
            };
            inner.graph.add_edge(doc_idx, entity_idx, weight);
        }

        drop(inner);
        self.query_cache.clear();
        debug!(%document_id, "graph node inserted");
    }

    /// Recompute a document's entity edges. With `force_full` all
    /// existing edges are removed first; otherwise this is equivalent to
    /// an insert-or-replace.
    pub fn update_document(
        &self,
        document_id: Uuid,
        metadata: Metadata,
        entities: HashMap<String, f32>,
        force_full: bool,
    ) -> MemoryResult<()> {
        {
            let inner = self.inner.read().unwrap();
            if !inner.documents.contains_key(&document_id) {
                return Err(MemoryError::NotFound(format!(
                    "document not in graph: {document_id}"
                )));
            }
        }
        if force_full {
            let mut inner = self.inner.write().unwrap();
            Self::remove_doc_edges(&mut inner, &document_id);
        }
        self.insert_document(document_id, metadata, entities);
        Ok(())
    }

    /// Replace a document node's metadata without touching its edges
    /// (metadata-only update path).
    pub fn update_metadata(&self, document_id: &Uuid, metadata: Metadata) -> MemoryResult<()> {
        let mut inner = self.inner.write().unwrap();
        let idx = *inner.documents.get(document_id).ok_or_else(|| {
            MemoryError::NotFound(format!("document not in graph: {document_id}"))
        })?;
        if let Some(GraphNode::Document { metadata: m, .. }) = inner.graph.node_weight_mut(idx) {
            *m = metadata;
        }
        drop(inner);
        self.query_cache.clear();
        Ok(())
    }

    /// Remove a document node, its edges, and any entity node left with
    /// no documents.
    pub fn remove_document(&self, document_id: &Uuid) -> bool {
        let mut inner = self.inner.write().unwrap();
        Self::remove_doc_edges(&mut inner, document_id);
        let removed = match inner.documents.remove(document_id) {
            Some(idx) => {
                inner.graph.remove_node(idx);
                true
            }
            None => false,
        };
        drop(inner);
        self.query_cache.clear();
        removed
    }

    pub fn contains(&self, document_id: &Uuid) -> bool {
        self.inner.read().unwrap().documents.contains_key(document_id)
    }

    pub fn document_count(&self) -> usize {
        self.inner.read().unwrap().documents.len()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.read().unwrap().entities.len()
    }

    /// Edge weight between a document and an entity, if present.
    pub fn edge_weight(&self, document_id: &Uuid, entity: &str) -> Option<f32> {
        let inner = self.inner.read().unwrap();
        let doc_idx = *inner.documents.get(document_id)?;
        let entity_idx = *inner.entities.get(entity)?;
        inner
            .graph
            .find_edge(doc_idx, entity_idx)
            .and_then(|e| inner.graph.edge_weight(e))
            .copied()
    }

    /// Weighted k-hop traversal from `document_id`. Path strength is the
    /// product of edge weights; results are filtered by `min_similarity`,
    /// bounded by `max_depth` document hops, sorted by strength
    /// descending, and capped at 100.
    pub fn related_documents(
        &self,
        document_id: &Uuid,
        max_depth: Option<u32>,
        min_similarity: Option<f32>,
    ) -> MemoryResult<Vec<RelatedDocument>> {
        let max_depth = max_depth.unwrap_or(self.config.max_depth);
        let min_similarity = min_similarity.unwrap_or(self.config.min_similarity);

        let cache_key = format!("{document_id}:{max_depth}:{}", min_similarity.to_bits());
        if let Some(cached) = self.query_cache.get(&cache_key) {
            let (at, results) = cached.value();
            if at.elapsed() < self.config.query_cache_ttl {
                return Ok(results.clone());
            }
        }

        let inner = self.inner.read().unwrap();
        let start = *inner
            .documents
            .get(document_id)
            .ok_or_else(|| MemoryError::NotFound(format!("document not in graph: {document_id}")))?;

        let mut visited: HashSet<NodeIndex> = HashSet::from([start]);
        let mut heap = BinaryHeap::new();
        heap.push(Frontier {
            strength: 1.0,
            depth: 0,
            node: start,
        });
        let mut results: Vec<RelatedDocument> = Vec::new();

        while let Some(Frontier { strength, depth, node }) = heap.pop() {
            if depth >= max_depth || results.len() >= MAX_RELATED_RESULTS {
                continue;
            }

            for entity_edge in inner.graph.edges(node) {
                let entity_idx = entity_edge.target();
                if !matches!(inner.graph[entity_idx], GraphNode::Entity { .. }) {
                    continue;
                }
                let to_entity = *entity_edge.weight();

                for doc_edge in inner.graph.edges(entity_idx) {
                    let doc_idx = doc_edge.target();
                    let GraphNode::Document { id, metadata, .. } = &inner.graph[doc_idx] else {
                        continue;
                    };
                    if visited.contains(&doc_idx) {
                        continue;
                    }

                    let path_strength = strength * to_entity * doc_edge.weight();
                    if path_strength < min_similarity {
                        continue;
                    }

                    visited.insert(doc_idx);
                    heap.push(Frontier {
                        strength: path_strength,
                        depth: depth + 1,
                        node: doc_idx,
                    });
                    results.push(RelatedDocument {
                        document_id: *id,
                        strength: path_strength,
                        depth: depth + 1,
                        metadata: metadata.clone(),
                        common_entities: Self::common_entities(&inner, start, doc_idx),
                    });
                }
            }
        }

        results.sort_by(|a, b| {
            b.strength
                .partial_cmp(&a.strength)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        results.truncate(MAX_RELATED_RESULTS);

        drop(inner);
        self.query_cache.insert(cache_key, (Instant::now(), results.clone()));
        Ok(results)
    }

    fn common_entities(inner: &GraphInner, a: NodeIndex, b: NodeIndex) -> Vec<CommonEntity> {
        let entity_neighbors = |node: NodeIndex| -> HashMap<NodeIndex, f32> {
            inner
                .graph
                .edges(node)
                .filter(|e| matches!(inner.graph[e.target()], GraphNode::Entity { .. }))
                .map(|e| (e.target(), *e.weight()))
                .collect()
        };

        let from_a = entity_neighbors(a);
        let from_b = entity_neighbors(b);

        let mut common: Vec<CommonEntity> = from_a
            .iter()
            .filter_map(|(idx, weight_a)| {
                let weight_b = from_b.get(idx)?;
                let GraphNode::Entity { name, .. } = &inner.graph[*idx] else {
                    return None;
                };
                Some(CommonEntity {
                    name: name.clone(),
                    weight: (weight_a + weight_b) / 2.0,
                })
            })
            .collect();
        common.sort_by(|x, y| y.weight.partial_cmp(&x.weight).unwrap_or(Ordering::Equal));
        common
    }

    /// Drop every edge of a document, fixing entity document counts and
    /// pruning orphaned entity nodes. Caller holds the write lock.
    fn remove_doc_edges(inner: &mut GraphInner, document_id: &Uuid) {
        let Some(doc_idx) = inner.documents.get(document_id).copied() else {
            return;
        };

        let entity_neighbors: Vec<NodeIndex> = inner
            .graph
            .edges(doc_idx)
            .map(|e| e.target())
            .filter(|idx| matches!(inner.graph[*idx], GraphNode::Entity { .. }))
            .collect();

        let edges: Vec<_> = inner.graph.edges(doc_idx).map(|e| e.id()).collect();
        for edge in edges {
            inner.graph.remove_edge(edge);
        }

        for entity_idx in entity_neighbors {
            let orphaned = match inner.graph.node_weight_mut(entity_idx) {
                Some(GraphNode::Entity { document_count, .. }) => {
                    *document_count = document_count.saturating_sub(1);
                    *document_count == 0
                }
                _ => false,
            };
            if orphaned {
                if let Some(GraphNode::Entity { name, .. }) = inner.graph.node_weight(entity_idx) {
                    let name = name.clone();
                    inner.entities.remove(&name);
                }
                inner.graph.remove_node(entity_idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entities(pairs: &[(&str, f32)]) -> HashMap<String, f32> {
        pairs.iter().map(|(n, w)| (n.to_string(), *w)).collect()
    }

    fn meta() -> Metadata {
        json!({}).as_object().unwrap().clone()
    }

    fn graph() -> KnowledgeGraph {
        KnowledgeGraph::new(GraphConfig::default())
    }

    #[test]
    fn test_insert_creates_entities_and_edges() {
        let graph = graph();
        let doc = Uuid::from_u128(1);
        graph.insert_document(doc, meta(), entities(&[("alpha", 0.9), ("beta", 0.5)]));

        assert!(graph.contains(&doc));
        assert_eq!(graph.entity_count(), 2);
        assert_eq!(graph.edge_weight(&doc, "alpha"), Some(0.9));
    }

    #[test]
    fn test_weights_clamped_to_floor() {
        let graph = graph();
        let doc = Uuid::from_u128(1);
        graph.insert_document(doc, meta(), entities(&[("weak", 0.01), ("strong", 5.0)]));
        assert_eq!(graph.edge_weight(&doc, "weak"), Some(0.1));
        assert_eq!(graph.edge_weight(&doc, "strong"), Some(1.0));
    }

    #[test]
    fn test_traversal_strength_products() {
        let graph = graph();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);
        graph.insert_document(a, meta(), entities(&[("x", 0.9), ("y", 0.5)]));
        graph.insert_document(b, meta(), entities(&[("y", 0.8), ("z", 0.6)]));
        graph.insert_document(c, meta(), entities(&[("z", 0.9)]));

        let related = graph.related_documents(&a, Some(3), Some(0.25)).unwrap();

        // A→y→B has strength 0.5 * 0.8 = 0.40. A→…→C is 0.216, filtered.
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].document_id, b);
        assert!((related[0].strength - 0.40).abs() < 1e-6);
        assert_eq!(related[0].depth, 1);
        assert_eq!(related[0].common_entities.len(), 1);
        assert_eq!(related[0].common_entities[0].name, "y");

        // Lower floor reaches C through B.
        let related = graph.related_documents(&a, Some(3), Some(0.1)).unwrap();
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].document_id, b);
        assert_eq!(related[1].document_id, c);
        assert!((related[1].strength - 0.216).abs() < 1e-6);
        assert_eq!(related[1].depth, 2);
    }

    #[test]
    fn test_depth_limit() {
        let graph = graph();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);
        graph.insert_document(a, meta(), entities(&[("p", 1.0)]));
        graph.insert_document(b, meta(), entities(&[("p", 1.0), ("q", 1.0)]));
        graph.insert_document(c, meta(), entities(&[("q", 1.0)]));

        let related = graph.related_documents(&a, Some(1), Some(0.0)).unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].document_id, b);
    }

    #[test]
    fn test_remove_prunes_orphan_entities() {
        let graph = graph();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        graph.insert_document(a, meta(), entities(&[("shared", 0.9), ("only_a", 0.9)]));
        graph.insert_document(b, meta(), entities(&[("shared", 0.9)]));

        assert!(graph.remove_document(&a));
        assert!(!graph.contains(&a));
        // `only_a` lost its last document and is gone; `shared` survives.
        assert_eq!(graph.entity_count(), 1);
        assert!(!graph.remove_document(&a));
    }

    #[test]
    fn test_update_force_full_replaces_edges() {
        let graph = graph();
        let doc = Uuid::from_u128(1);
        graph.insert_document(doc, meta(), entities(&[("old", 0.9)]));
        graph
            .update_document(doc, meta(), entities(&[("new", 0.7)]), true)
            .unwrap();

        assert_eq!(graph.edge_weight(&doc, "old"), None);
        assert_eq!(graph.edge_weight(&doc, "new"), Some(0.7));
        assert_eq!(graph.entity_count(), 1);
    }

    #[test]
    fn test_unknown_document_not_found() {
        let graph = graph();
        assert!(matches!(
            graph.related_documents(&Uuid::from_u128(9), None, None),
            Err(MemoryError::NotFound(_))
        ));
        assert!(graph
            .update_document(Uuid::from_u128(9), meta(), HashMap::new(), true)
            .is_err());
    }

    #[test]
    fn test_extractor_weights_and_floor() {
        let extractor = WordFrequencyExtractor;
        let body = "database database database engine";
        let chunks = vec!["database engine".to_string()];
        let weights = extractor.extract(body, &chunks, 0.1);

        // Most frequent word normalizes to 1.0, everything floors at 0.1+.
        assert!((weights["database"] - 1.0).abs() < 1e-6);
        assert!(weights["engine"] >= 0.1);
        // Short words are filtered out entirely.
        assert!(weights.keys().all(|k| k.len() > 3));
    }

    #[test]
    fn test_extractor_empty_content() {
        let extractor = WordFrequencyExtractor;
        assert!(extractor.extract("a an it", &[], 0.1).is_empty());
    }
}
