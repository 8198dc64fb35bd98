// MNEMO Processing - token-aware document chunker
// Paragraph-first splitting with semantic boundary fallback and overlap

use lru::LruCache;
use once_cell::sync::Lazy;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tiktoken_rs::{get_bpe_from_model, CoreBPE};
use tracing::debug;

use crate::memory::config::ChunkerConfig;
use crate::memory::{MemoryError, MemoryResult};

/// Models the chunker can tokenize for, with their context limits.
pub const SUPPORTED_MODELS: [(&str, usize); 2] =
    [("gpt-3.5-turbo", 16384), ("gpt-4", 32768)];

/// Semantic boundaries in descending strength. Earlier entries are
/// preferred when an oversize paragraph has to be split.
const SEMANTIC_BOUNDARIES: [&str; 9] =
    [".\n\n", "\n\n", ".\n", ".", "\n", ";", ":", "!", "?"];

const TOKEN_COUNT_CACHE_SIZE: usize = 1000;

static BPE_REGISTRY: Lazy<dashmap::DashMap<String, Arc<CoreBPE>>> =
    Lazy::new(dashmap::DashMap::new);

static TOKEN_COUNT_CACHE: Lazy<Mutex<LruCache<[u8; 32], usize>>> = Lazy::new(|| {
    Mutex::new(LruCache::new(NonZeroUsize::new(TOKEN_COUNT_CACHE_SIZE).unwrap()))
});

/// Context limit for a supported model; `Validation` otherwise.
pub fn model_token_limit(model: &str) -> MemoryResult<usize> {
    SUPPORTED_MODELS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, limit)| *limit)
        .ok_or_else(|| {
            MemoryError::Validation(format!(
                "unsupported model: {model} (supported: gpt-3.5-turbo, gpt-4)"
            ))
        })
}

fn bpe_for(model: &str) -> MemoryResult<Arc<CoreBPE>> {
    if let Some(bpe) = BPE_REGISTRY.get(model) {
        return Ok(bpe.clone());
    }
    let bpe = get_bpe_from_model(model)
        .map_err(|e| MemoryError::Validation(format!("tokenizer unavailable for {model}: {e}")))?;
    let bpe = Arc::new(bpe);
    BPE_REGISTRY.insert(model.to_string(), bpe.clone());
    Ok(bpe)
}

/// Count tokens with the model tokenizer. Counts are memoized by content
/// hash because chunking re-counts the same fragments repeatedly.
pub fn count_tokens(text: &str, model: &str) -> MemoryResult<usize> {
    model_token_limit(model)?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(model.as_bytes());
    hasher.update(&[0]);
    hasher.update(text.as_bytes());
    let key = *hasher.finalize().as_bytes();

    if let Some(count) = TOKEN_COUNT_CACHE.lock().unwrap().get(&key) {
        return Ok(*count);
    }

    let bpe = bpe_for(model)?;
    let count = bpe.encode_with_special_tokens(text).len();
    TOKEN_COUNT_CACHE.lock().unwrap().put(key, count);
    Ok(count)
}

/// One produced chunk. `chunk_number` is contiguous from 0 in source
/// order; `token_count` includes the overlap borrowed from neighbours.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    pub chunk_number: u32,
    pub token_count: u32,
    pub overlap_tokens: u32,
    pub has_previous: bool,
    pub has_next: bool,
}

/// Token-aware splitter. A pure function of (text, target, model):
/// repeated calls produce identical output.
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Split `text` into chunks of at most `target` tokens (before
    /// overlap), preferring paragraph and sentence boundaries. Every
    /// chunk stays within `target + 2 * overlap` tokens.
    pub fn chunk(
        &self,
        text: &str,
        target: Option<usize>,
        model: &str,
    ) -> MemoryResult<Vec<TextChunk>> {
        let limit = model_token_limit(model)?;
        if text.trim().is_empty() {
            return Err(MemoryError::Validation("empty input: nothing to chunk".into()));
        }

        let target = target.unwrap_or(self.config.target_tokens).min(limit).max(1);

        let bodies = self.primary_split(text, target, model)?;
        let bodies = self.merge_small(bodies, target, model)?;
        let chunks = self.apply_overlap(bodies, model)?;

        debug!(chunk_count = chunks.len(), target, model, "document chunked");
        Ok(chunks)
    }

    /// First pass: accumulate paragraphs while the running total fits the
    /// target; route oversize paragraphs through the boundary splitter.
    fn primary_split(
        &self,
        text: &str,
        target: usize,
        model: &str,
    ) -> MemoryResult<Vec<String>> {
        let mut bodies: Vec<String> = Vec::new();
        let mut current = String::new();

        for paragraph in text.split("\n\n") {
            if paragraph.trim().is_empty() {
                continue;
            }
            let paragraph_tokens = count_tokens(paragraph, model)?;

            if paragraph_tokens > target {
                // Flush before the oversize paragraph so its pieces keep
                // their own boundaries.
                if !current.is_empty() {
                    bodies.push(std::mem::take(&mut current));
                }
                bodies.extend(split_oversize(paragraph, target, model, &SEMANTIC_BOUNDARIES)?);
                continue;
            }

            if current.is_empty() {
                current.push_str(paragraph);
                continue;
            }

            // Exact accounting: re-count the joined candidate so the
            // separator tokens never push a body past the target.
            let candidate = format!("{current}\n\n{paragraph}");
            if count_tokens(&candidate, model)? > target {
                bodies.push(std::mem::replace(&mut current, paragraph.to_string()));
            } else {
                current = candidate;
            }
        }

        if !current.is_empty() {
            bodies.push(current);
        }
        Ok(bodies)
    }

    /// Merge pass: adjacent bodies whose combined size still fits the
    /// target collapse into one, preserving order.
    fn merge_small(
        &self,
        bodies: Vec<String>,
        target: usize,
        model: &str,
    ) -> MemoryResult<Vec<String>> {
        if bodies.len() < 2 {
            return Ok(bodies);
        }

        let mut merged: Vec<String> = Vec::with_capacity(bodies.len());
        for body in bodies {
            if let Some(last) = merged.last_mut() {
                let candidate = format!("{last}\n\n{body}");
                if count_tokens(&candidate, model)? <= target {
                    *last = candidate;
                    continue;
                }
            }
            merged.push(body);
        }
        Ok(merged)
    }

    /// Prepend up to `overlap_tokens` from the previous body's tail and
    /// append up to `overlap_tokens` from the next body's head.
    fn apply_overlap(&self, bodies: Vec<String>, model: &str) -> MemoryResult<Vec<TextChunk>> {
        let count = bodies.len();
        let mut chunks = Vec::with_capacity(count);

        for (i, body) in bodies.iter().enumerate() {
            let overlap_start = if i > 0 {
                overlap_text(&bodies[i - 1], self.config.overlap_tokens, model, false)?
            } else {
                String::new()
            };
            let overlap_end = if i + 1 < count {
                overlap_text(&bodies[i + 1], self.config.overlap_tokens, model, true)?
            } else {
                String::new()
            };

            let mut content = String::with_capacity(
                overlap_start.len() + body.len() + overlap_end.len() + 2,
            );
            if !overlap_start.is_empty() {
                content.push_str(&overlap_start);
                content.push(' ');
            }
            content.push_str(body);
            if !overlap_end.is_empty() {
                content.push(' ');
                content.push_str(&overlap_end);
            }

            let overlap_tokens = if overlap_start.is_empty() && overlap_end.is_empty() {
                0
            } else {
                let mut combined = overlap_start.clone();
                combined.push_str(&overlap_end);
                count_tokens(&combined, model)?
            };

            chunks.push(TextChunk {
                token_count: count_tokens(&content, model)? as u32,
                content,
                chunk_number: i as u32,
                overlap_tokens: overlap_tokens as u32,
                has_previous: i > 0,
                has_next: i + 1 < count,
            });
        }
        Ok(chunks)
    }
}

/// Split an oversize paragraph at the strongest boundary that produces
/// fitting pieces; fall back to whitespace. Never splits mid-word.
fn split_oversize(
    text: &str,
    target: usize,
    model: &str,
    boundaries: &[&str],
) -> MemoryResult<Vec<String>> {
    if count_tokens(text, model)? <= target {
        return Ok(vec![text.to_string()]);
    }

    for (idx, boundary) in boundaries.iter().enumerate() {
        if !text.contains(boundary) {
            continue;
        }

        let segments: Vec<&str> = text.split(boundary).filter(|s| !s.trim().is_empty()).collect();
        if segments.len() < 2 {
            continue;
        }

        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();

        for segment in segments {
            let segment_tokens = count_tokens(segment, model)?;

            if segment_tokens > target {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
                // Only weaker boundaries can break this segment further.
                pieces.extend(split_oversize(segment, target, model, &boundaries[idx + 1..])?);
                continue;
            }

            if current.is_empty() {
                current.push_str(segment);
                continue;
            }

            let candidate = format!("{current}{boundary}{segment}");
            if count_tokens(&candidate, model)? > target {
                pieces.push(std::mem::replace(&mut current, segment.to_string()));
            } else {
                current = candidate;
            }
        }

        if !current.is_empty() {
            pieces.push(current);
        }
        if !pieces.is_empty() {
            return Ok(pieces);
        }
    }

    split_whitespace_bounded(text, target, model)
}

/// Last resort: accumulate whitespace-separated words. A single word
/// whose token count exceeds the target cannot be represented at all.
fn split_whitespace_bounded(text: &str, target: usize, model: &str) -> MemoryResult<Vec<String>> {
    let mut pieces: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0usize;

    for word in text.split_whitespace() {
        let word_tokens = count_tokens(word, model)?;
        if word_tokens > target {
            return Err(MemoryError::Validation(format!(
                "single token of {word_tokens} tokens exceeds chunk target {target}"
            )));
        }

        // The +1 covers the joining space; conservative, never over.
        if current_tokens + word_tokens + 1 > target && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_tokens = 0;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
        current_tokens += word_tokens + 1;
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    Ok(pieces)
}

/// Take up to `budget` tokens of whole words from the head or tail of a
/// neighbour body for overlap.
fn overlap_text(text: &str, budget: usize, model: &str, from_start: bool) -> MemoryResult<String> {
    if budget == 0 {
        return Ok(String::new());
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Ok(String::new());
    }

    let mut selected: Vec<&str> = Vec::new();
    let mut used = 0usize;

    let iter: Box<dyn Iterator<Item = &str>> = if from_start {
        Box::new(words.iter().copied())
    } else {
        Box::new(words.iter().rev().copied())
    };

    for word in iter {
        let word_tokens = count_tokens(word, model)?;
        // The +1 per word covers joining spaces, keeping the realized
        // overlap strictly under the budget.
        if used + word_tokens + 1 > budget {
            break;
        }
        selected.push(word);
        used += word_tokens + 1;
    }

    if !from_start {
        selected.reverse();
    }
    Ok(selected.join(" "))
}
