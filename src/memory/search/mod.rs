// MNEMO Search - retrieval strategies and ranked results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::memory::{Document, MemoryError, MemoryResult};

pub mod planner;

pub use planner::RetrievalPlanner;

/// How candidate documents are identified and ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    Vector,
    Llm,
    Hybrid,
    RagKg,
}

impl RetrievalStrategy {
    /// Accepts both historical spellings of the graph strategy
    /// (`rag_kg` and `rag+kg`); everything canonicalizes to `rag_kg`.
    pub fn parse(raw: &str) -> MemoryResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "vector" => Ok(RetrievalStrategy::Vector),
            "llm" => Ok(RetrievalStrategy::Llm),
            "hybrid" => Ok(RetrievalStrategy::Hybrid),
            "rag_kg" | "rag+kg" => Ok(RetrievalStrategy::RagKg),
            other => Err(MemoryError::Validation(format!(
                "unknown retrieval strategy: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Vector => "vector",
            RetrievalStrategy::Llm => "llm",
            RetrievalStrategy::Hybrid => "hybrid",
            RetrievalStrategy::RagKg => "rag_kg",
        }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ranked hit at document granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
    pub last_accessed: DateTime<Utc>,
}

/// Search result set. `degraded` marks a partial but usable ranking
/// produced after a non-critical failure or a blown latency budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub results: Vec<ScoredDocument>,
    pub strategy: RetrievalStrategy,
    pub degraded: bool,
    /// Reasoning text from the llm strategy, when it ran.
    pub reasoning: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_spellings() {
        assert_eq!(RetrievalStrategy::parse("vector").unwrap(), RetrievalStrategy::Vector);
        assert_eq!(RetrievalStrategy::parse("rag_kg").unwrap(), RetrievalStrategy::RagKg);
        assert_eq!(RetrievalStrategy::parse("rag+kg").unwrap(), RetrievalStrategy::RagKg);
        assert_eq!(RetrievalStrategy::parse("RAG+KG").unwrap(), RetrievalStrategy::RagKg);
        assert!(RetrievalStrategy::parse("keyword").is_err());
    }

    #[test]
    fn test_canonical_spelling() {
        assert_eq!(RetrievalStrategy::parse("rag+kg").unwrap().as_str(), "rag_kg");
    }
}
