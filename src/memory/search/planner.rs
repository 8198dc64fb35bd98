// MNEMO Search - retrieval planner
// Dispatches the four strategies under per-strategy latency budgets

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::memory::config::PlannerConfig;
use crate::memory::search::{RetrievalStrategy, ScoredDocument, SearchOutcome};
use crate::memory::workflow::{Activities, ActivityContext};
use crate::memory::{
    metadata_matches, DocumentChunk, Metadata, MemoryError, MemoryResult, MAX_SEARCH_LIMIT,
};

/// Shared accumulator: strategies publish document-level results as each
/// stage completes, so a blown budget still yields a usable partial set.
type Partial = Arc<Mutex<Vec<ScoredDocument>>>;

pub struct RetrievalPlanner {
    activities: Arc<Activities>,
    config: PlannerConfig,
}

impl RetrievalPlanner {
    pub fn new(activities: Arc<Activities>, config: PlannerConfig) -> Self {
        Self { activities, config }
    }

    /// Execute one strategy. Failures after the first ranked stage and
    /// blown budgets degrade to the accumulated partial set; only the
    /// total unavailability of the embedding client (for the three
    /// vector-seeded strategies) is terminal.
    pub async fn search(
        &self,
        query: &str,
        strategy: RetrievalStrategy,
        filters: &Metadata,
        limit: usize,
    ) -> MemoryResult<SearchOutcome> {
        if limit == 0 {
            return Ok(SearchOutcome {
                results: Vec::new(),
                strategy,
                degraded: false,
                reasoning: None,
            });
        }
        if limit > MAX_SEARCH_LIMIT {
            return Err(MemoryError::Validation(format!(
                "limit {limit} exceeds maximum of {MAX_SEARCH_LIMIT}"
            )));
        }

        // Vector-seeded strategies need the query embedding up front;
        // an unavailable embedding client is a terminal error here.
        let query_vector = match strategy {
            RetrievalStrategy::Llm => None,
            _ => Some(self.activities.embedding.embed(query).await?),
        };

        let partial: Partial = Arc::new(Mutex::new(Vec::new()));
        let reasoning: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let budget = match strategy {
            RetrievalStrategy::Vector => self.config.vector_budget,
            RetrievalStrategy::Llm => self.config.llm_budget,
            RetrievalStrategy::Hybrid => self.config.hybrid_budget,
            RetrievalStrategy::RagKg => self.config.rag_kg_budget,
        };

        let run = async {
            match strategy {
                RetrievalStrategy::Vector => {
                    self.vector_strategy(query_vector.as_deref().unwrap(), filters, limit, &partial)
                        .await
                }
                RetrievalStrategy::Llm => {
                    self.llm_strategy(query, filters, limit, &partial, &reasoning).await
                }
                RetrievalStrategy::Hybrid => {
                    self.hybrid_strategy(
                        query,
                        query_vector.as_deref().unwrap(),
                        filters,
                        limit,
                        &partial,
                    )
                    .await
                }
                RetrievalStrategy::RagKg => {
                    self.rag_kg_strategy(
                        query,
                        query_vector.as_deref().unwrap(),
                        filters,
                        limit,
                        &partial,
                    )
                    .await
                }
            }
        };

        let (results, degraded) = match timeout(budget, run).await {
            Ok(Ok(results)) => (results, false),
            Ok(Err(err)) => {
                warn!(%strategy, "strategy failed, returning partial set: {err}");
                (partial.lock().unwrap().clone(), true)
            }
            Err(_) => {
                warn!(%strategy, ?budget, "strategy exceeded latency budget");
                (partial.lock().unwrap().clone(), true)
            }
        };

        let ranked = rank_and_truncate(results, limit);
        self.record_access_async(&ranked);

        let reasoning = reasoning.lock().unwrap().take();
        Ok(SearchOutcome {
            results: ranked,
            strategy,
            degraded,
            reasoning,
        })
    }

    /// vector: candidates → threshold filter → distinct by document.
    async fn vector_strategy(
        &self,
        query_vector: &[f32],
        filters: &Metadata,
        limit: usize,
        partial: &Partial,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        let ctx = ActivityContext::new("search_vector", "vector_candidates");
        let candidates = self
            .activities
            .vector_candidates(&ctx, query_vector, filters, self.config.similarity_threshold, limit)
            .await?;

        let scored: Vec<ScoredDocument> = self
            .documents_from_chunks(candidates)
            .await?
            .into_iter()
            .map(|(doc, _)| doc)
            .collect();
        publish(partial, &scored);
        Ok(scored)
    }

    /// llm: bounded recency candidate pool → reason → select.
    async fn llm_strategy(
        &self,
        query: &str,
        filters: &Metadata,
        limit: usize,
        partial: &Partial,
        reasoning_slot: &Arc<Mutex<Option<String>>>,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        let pool_size = (4 * limit).min(self.config.llm_candidate_cap);
        let pool = self.activities.catalog.recently_accessed_documents(pool_size).await?;
        let pool: Vec<_> = pool
            .into_iter()
            .filter(|doc| filters.is_empty() || metadata_matches(&doc.metadata, filters))
            .collect();
        if pool.is_empty() {
            return Ok(Vec::new());
        }

        // Representative text per candidate: its first chunk.
        let mut texts = Vec::with_capacity(pool.len());
        let mut by_text: HashMap<String, usize> = HashMap::new();
        for (i, doc) in pool.iter().enumerate() {
            let chunks = self.activities.catalog.get_chunks(&doc.id).await?;
            let text = chunks
                .first()
                .map(|c| c.content.clone())
                .unwrap_or_else(|| format!("document {}", doc.id));
            by_text.insert(text.clone(), i);
            texts.push(text);
        }

        // Recency-ranked fallback set before the model runs.
        let fallback: Vec<ScoredDocument> = {
            let n = pool.len() as f32;
            let mut scored = Vec::with_capacity(pool.len());
            for (i, doc) in pool.iter().enumerate() {
                scored.push(self.scored(doc.clone(), 1.0 - (i as f32) / n).await?);
            }
            scored
        };
        publish(partial, &fallback);

        let ctx = ActivityContext::new("search_llm", "llm_reason");
        let reasoning = self.activities.llm_reason(&ctx, query, &texts).await?;
        *reasoning_slot.lock().unwrap() = Some(reasoning.reasoning);

        let ctx = ActivityContext::new("search_llm", "llm_select");
        let selected = self.activities.llm_select(&ctx, query, &texts).await?;
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let n = selected.len() as f32;
        let mut results = Vec::with_capacity(selected.len());
        for (rank, text) in selected.iter().enumerate() {
            let Some(&pool_index) = by_text.get(text) else {
                continue;
            };
            let score = 1.0 - (rank as f32) / n;
            results.push(self.scored(pool[pool_index].clone(), score).await?);
        }
        publish(partial, &results);
        Ok(results)
    }

    /// hybrid: wide vector pass, then LLM reranking; unselected
    /// candidates keep their vector order behind the selected ones.
    async fn hybrid_strategy(
        &self,
        query: &str,
        query_vector: &[f32],
        filters: &Metadata,
        limit: usize,
        partial: &Partial,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        let ctx = ActivityContext::new("search_hybrid", "vector_candidates");
        let candidates = self
            .activities
            .vector_candidates(
                &ctx,
                query_vector,
                filters,
                self.config.similarity_threshold,
                2 * limit,
            )
            .await?;

        // Texts stay aligned with the document-level candidates: each
        // document is represented by its best-scoring chunk.
        let pairs = self.documents_from_chunks(candidates).await?;
        let (scored, texts): (Vec<ScoredDocument>, Vec<String>) = pairs.into_iter().unzip();
        publish(partial, &scored);
        if scored.is_empty() {
            return Ok(scored);
        }

        let ctx = ActivityContext::new("search_hybrid", "llm_select");
        let selected = self.activities.llm_select(&ctx, query, &texts).await?;
        let reranked = rerank_by_selection(scored, &texts, &selected);
        publish(partial, &reranked);
        Ok(reranked)
    }

    /// rag_kg: vector seeds, graph expansion merged by max strength,
    /// then LLM selection over the merged candidates.
    async fn rag_kg_strategy(
        &self,
        query: &str,
        query_vector: &[f32],
        filters: &Metadata,
        limit: usize,
        partial: &Partial,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        let ctx = ActivityContext::new("search_rag_kg", "vector_candidates");
        let seeds = self
            .activities
            .vector_candidates(&ctx, query_vector, filters, self.config.similarity_threshold, limit)
            .await?;

        let seed_docs: Vec<ScoredDocument> = self
            .documents_from_chunks(seeds)
            .await?
            .into_iter()
            .map(|(doc, _)| doc)
            .collect();
        publish(partial, &seed_docs);

        // Merge graph neighborhoods: score is max(similarity, strength).
        let mut merged: HashMap<Uuid, ScoredDocument> = seed_docs
            .iter()
            .map(|s| (s.document.id, s.clone()))
            .collect();

        for seed in &seed_docs {
            let related = match self
                .activities
                .graph
                .related_documents(&seed.document.id, None, None)
            {
                Ok(related) => related,
                Err(MemoryError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };

            for neighbor in related {
                let strength = (seed.score * neighbor.strength).clamp(0.0, 1.0);
                if let Some(existing) = merged.get_mut(&neighbor.document_id) {
                    existing.score = existing.score.max(strength);
                    continue;
                }

                let Ok(document) =
                    self.activities.catalog.get_document(&neighbor.document_id).await
                else {
                    continue;
                };
                if !filters.is_empty() && !metadata_matches(&document.metadata, filters) {
                    continue;
                }
                merged.insert(neighbor.document_id, self.scored(document, strength).await?);
            }
        }

        let mut candidates: Vec<ScoredDocument> = merged.into_values().collect();
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        publish(partial, &candidates);
        if candidates.is_empty() {
            return Ok(candidates);
        }

        // Final ranking by LLM selection over first-chunk texts.
        let mut texts = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let chunks = self.activities.catalog.get_chunks(&candidate.document.id).await?;
            texts.push(
                chunks
                    .first()
                    .map(|c| c.content.clone())
                    .unwrap_or_else(|| format!("document {}", candidate.document.id)),
            );
        }
        let ctx = ActivityContext::new("search_rag_kg", "llm_select");
        let selected = self.activities.llm_select(&ctx, query, &texts).await?;
        let reranked = rerank_by_selection(candidates, &texts, &selected);
        publish(partial, &reranked);
        Ok(reranked)
    }

    /// Collapse chunk-level candidates to document granularity: only the
    /// highest-scoring chunk per document is retained, and its content
    /// becomes the document's representative text.
    async fn documents_from_chunks(
        &self,
        candidates: Vec<(DocumentChunk, f32)>,
    ) -> MemoryResult<Vec<(ScoredDocument, String)>> {
        let mut best: HashMap<Uuid, (f32, String)> = HashMap::new();
        for (chunk, score) in candidates {
            if let Some(entry) = best.get_mut(&chunk.document_id) {
                if score > entry.0 {
                    *entry = (score, chunk.content);
                }
                continue;
            }
            best.insert(chunk.document_id, (score, chunk.content));
        }

        let mut scored = Vec::with_capacity(best.len());
        for (document_id, (score, text)) in best {
            let document = self.activities.catalog.get_document(&document_id).await?;
            scored.push((self.scored(document, score).await?, text));
        }
        scored.sort_by(|a, b| b.0.score.partial_cmp(&a.0.score).unwrap_or(Ordering::Equal));
        Ok(scored)
    }

    async fn scored(
        &self,
        document: crate::memory::Document,
        score: f32,
    ) -> MemoryResult<ScoredDocument> {
        let last_accessed = match self.activities.catalog.get_index(&document.id).await {
            Ok(index) => index.last_accessed,
            Err(MemoryError::NotFound(_)) => document.created_at,
            Err(err) => return Err(err),
        };
        Ok(ScoredDocument {
            document,
            score: score.clamp(0.0, 1.0),
            last_accessed,
        })
    }

    /// Fire-and-forget access recording for every returned document.
    fn record_access_async(&self, results: &[ScoredDocument]) {
        for result in results {
            let activities = self.activities.clone();
            let document_id = result.document.id;
            tokio::spawn(async move {
                if let Err(err) = activities.record_access(&document_id).await {
                    debug!(%document_id, "access recording failed: {err}");
                }
            });
        }
    }
}

fn publish(partial: &Partial, results: &[ScoredDocument]) {
    *partial.lock().unwrap() = results.to_vec();
}

/// Deterministic final ordering: score descending, then most recently
/// accessed, then document id ascending. Documents are already distinct.
fn rank_and_truncate(mut results: Vec<ScoredDocument>, limit: usize) -> Vec<ScoredDocument> {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.last_accessed.cmp(&a.last_accessed))
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    results.truncate(limit);
    results
}

/// Order LLM-selected candidates first (in selection order), keeping
/// everything else behind them in prior score order.
fn rerank_by_selection(
    candidates: Vec<ScoredDocument>,
    texts: &[String],
    selected: &[String],
) -> Vec<ScoredDocument> {
    let text_to_doc: HashMap<&str, Uuid> = texts
        .iter()
        .zip(candidates.iter())
        .map(|(text, scored)| (text.as_str(), scored.document.id))
        .collect();

    let mut order: HashMap<Uuid, usize> = HashMap::new();
    for (rank, text) in selected.iter().enumerate() {
        if let Some(&doc_id) = text_to_doc.get(text.as_str()) {
            order.entry(doc_id).or_insert(rank);
        }
    }

    let mut reranked = candidates;
    reranked.sort_by(|a, b| {
        let rank_a = order.get(&a.document.id);
        let rank_b = order.get(&b.document.id);
        match (rank_a, rank_b) {
            (Some(x), Some(y)) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal),
        }
    });
    reranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn doc(id: u128) -> crate::memory::Document {
        let now = Utc::now();
        crate::memory::Document {
            id: Uuid::from_u128(id),
            blob_ref: format!("documents/{id}"),
            blob_version: "v1".into(),
            format: crate::memory::DocumentFormat::Text,
            metadata: json!({}).as_object().unwrap().clone(),
            token_count: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn scored(id: u128, score: f32) -> ScoredDocument {
        ScoredDocument {
            document: doc(id),
            score,
            last_accessed: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_rank_orders_by_score_then_id() {
        let ranked = rank_and_truncate(
            vec![scored(2, 0.5), scored(1, 0.9), scored(3, 0.5)],
            10,
        );
        assert_eq!(ranked[0].document.id, Uuid::from_u128(1));
        // Equal scores and equal access times: id ascending.
        assert_eq!(ranked[1].document.id, Uuid::from_u128(2));
        assert_eq!(ranked[2].document.id, Uuid::from_u128(3));
    }

    #[test]
    fn test_recent_access_breaks_score_ties() {
        let mut early = scored(5, 0.5);
        early.last_accessed = chrono::DateTime::from_timestamp(1_600_000_000, 0).unwrap();
        let late = scored(9, 0.5);

        let ranked = rank_and_truncate(vec![early, late], 10);
        assert_eq!(ranked[0].document.id, Uuid::from_u128(9));
    }

    #[test]
    fn test_rank_truncates() {
        let ranked = rank_and_truncate(vec![scored(1, 0.9), scored(2, 0.8)], 1);
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_rerank_selected_first() {
        let candidates = vec![scored(1, 0.95), scored(2, 0.90), scored(3, 0.85)];
        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let selected = vec!["three".to_string(), "one".to_string()];

        let reranked = rerank_by_selection(candidates, &texts, &selected);
        assert_eq!(reranked[0].document.id, Uuid::from_u128(3));
        assert_eq!(reranked[1].document.id, Uuid::from_u128(1));
        assert_eq!(reranked[2].document.id, Uuid::from_u128(2));
    }
}
