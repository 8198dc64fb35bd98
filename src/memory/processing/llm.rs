// MNEMO Processing - LLM client for reasoning and document selection
// Chat-completion transport with prompt shaping and defensive parsing

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::memory::config::{CircuitBreakerConfig, LlmConfig};
use crate::memory::core::breaker::CircuitBreaker;
use crate::memory::processing::chunker::{count_tokens, model_token_limit};
use crate::memory::{MemoryError, MemoryResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Raw completion output.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub tokens_used: u32,
    pub finished: bool,
}

/// Reasoning output surfaced by the `llm_reason` activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningResult {
    pub reasoning: String,
    pub confidence: f32,
    pub tokens_used: u32,
}

/// Vendor protocol for chat completion. Tests plug in scripted
/// transports.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> MemoryResult<Completion>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    total_tokens: u32,
}

/// OpenAI-style chat-completions REST transport.
pub struct HttpLlmTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpLlmTransport {
    pub fn new(config: &LlmConfig) -> MemoryResult<Self> {
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
impl LlmTransport for HttpLlmTransport {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
    ) -> MemoryResult<Completion> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = CompletionRequest {
            model,
            messages,
            temperature,
            max_tokens,
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
                429 => MemoryError::RateLimited(format!("completion API throttled: {body}")),
                401 | 403 => MemoryError::Authentication(format!("completion API rejected key: {status}")),
                400 => MemoryError::Validation(format!("completion API rejected input: {body}")),
                _ => MemoryError::Upstream(format!("completion API error {status}: {body}")),
            });
        }

        let parsed: CompletionResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::Upstream("completion API returned no choices".into()))?;

        Ok(Completion {
            finished: choice.finish_reason.as_deref() == Some("stop"),
            content: choice.message.content,
            tokens_used: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

/// Reasoning and selection over candidate documents.
pub struct LlmClient {
    config: LlmConfig,
    transport: Arc<dyn LlmTransport>,
    breaker: CircuitBreaker,
}

impl LlmClient {
    pub fn new(
        config: LlmConfig,
        transport: Arc<dyn LlmTransport>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            config,
            transport,
            breaker: CircuitBreaker::new("llm", breaker_config),
        }
    }

    /// Reason about `documents` in the context of `query`.
    pub async fn reason(&self, query: &str, documents: &[String]) -> MemoryResult<ReasoningResult> {
        self.validate_budget(documents)?;
        let prompt = reasoning_prompt(query, documents);
        let completion = self
            .complete_with_retry(&[ChatMessage::user(prompt)], self.config.reason_max_tokens)
            .await?;

        Ok(ReasoningResult {
            confidence: if completion.finished { 1.0 } else { 0.5 },
            reasoning: completion.content,
            tokens_used: completion.tokens_used,
        })
    }

    /// Ask the model which candidates answer the query. Returns the
    /// selected subset in the model's relevance order; unparseable or
    /// out-of-range picks are dropped.
    pub async fn select(&self, query: &str, candidates: &[String]) -> MemoryResult<Vec<String>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_budget(candidates)?;

        let prompt = selection_prompt(query, candidates);
        let completion = self
            .complete_with_retry(&[ChatMessage::user(prompt)], self.config.select_max_tokens)
            .await?;

        let selected = parse_selection(&completion.content, candidates);
        debug!(
            candidates = candidates.len(),
            selected = selected.len(),
            "llm selection complete"
        );
        Ok(selected)
    }

    /// Input documents must fit the model context window.
    fn validate_budget(&self, documents: &[String]) -> MemoryResult<()> {
        let limit = model_token_limit(&self.config.model)?;
        let mut total = 0usize;
        for doc in documents {
            total += count_tokens(doc, &self.config.model)?;
            if total > limit {
                return Err(MemoryError::Validation(format!(
                    "candidate set exceeds {limit}-token context window of {}",
                    self.config.model
                )));
            }
        }
        Ok(())
    }

    async fn complete_with_retry(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> MemoryResult<Completion> {
        let mut attempt = 0u32;
        loop {
            self.breaker.check()?;
            match self
                .transport
                .complete(&self.config.model, messages, self.config.temperature, max_tokens)
                .await
            {
                Ok(completion) => {
                    self.breaker.record_success();
                    return Ok(completion);
                }
                Err(err @ MemoryError::RateLimited(_)) if attempt < self.config.max_retries => {
                    let delay = self.config.retry_base_delay * 2u32.pow(attempt);
                    warn!(attempt, ?delay, "completion rate limited, backing off: {err}");
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

fn reasoning_prompt(query: &str, documents: &[String]) -> String {
    let mut prompt = String::from("Given the following documents, answer the query:\nDocuments:\n");
    for (i, doc) in documents.iter().enumerate() {
        let _ = writeln!(prompt, "[{}] {}", i + 1, doc);
    }
    let _ = write!(
        prompt,
        "\nQuery: {query}\n\nProvide a detailed reasoning based on the documents above."
    );
    prompt
}

fn selection_prompt(query: &str, candidates: &[String]) -> String {
    let mut prompt = format!("Select the most relevant documents for the query:\nQuery: {query}\n\nDocuments:\n");
    for (i, doc) in candidates.iter().enumerate() {
        let _ = writeln!(prompt, "[{}] {}", i + 1, doc);
    }
    let _ = write!(prompt, "\nReturn only the numbers of relevant documents in order of relevance.");
    prompt
}

/// Pull 1-based indices like `[2]`, `2.` or bare `2` out of the model
/// answer, dedupe, and map back to candidate texts.
fn parse_selection(response: &str, candidates: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut selected = Vec::new();

    for token in response.split_whitespace() {
        let trimmed = token.trim_matches(|c: char| !c.is_ascii_digit());
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(number) = trimmed.parse::<usize>() {
            if number >= 1 && number <= candidates.len() && seen.insert(number) {
                selected.push(candidates[number - 1].clone());
            }
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted transport returning canned completions in order.
    pub struct ScriptedTransport {
        responses: Mutex<Vec<MemoryResult<Completion>>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<MemoryResult<Completion>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl LlmTransport for ScriptedTransport {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _temperature: f32,
            _max_tokens: u32,
        ) -> MemoryResult<Completion> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn completion(content: &str) -> Completion {
        Completion {
            content: content.to_string(),
            tokens_used: 42,
            finished: true,
        }
    }

    fn client(responses: Vec<MemoryResult<Completion>>) -> LlmClient {
        let config = LlmConfig {
            retry_base_delay: std::time::Duration::from_millis(1),
            ..LlmConfig::default()
        };
        LlmClient::new(
            config,
            Arc::new(ScriptedTransport::new(responses)),
            CircuitBreakerConfig::default(),
        )
    }

    #[test]
    fn test_selection_parsing() {
        let candidates = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        assert_eq!(parse_selection("[2] [1]", &candidates), vec!["two", "one"]);
        assert_eq!(parse_selection("3., 3, nonsense 99", &candidates), vec!["three"]);
        assert!(parse_selection("no numbers here", &candidates).is_empty());
    }

    #[tokio::test]
    async fn test_select_returns_subset_in_model_order() {
        let client = client(vec![Ok(completion("[3] [1]"))]);
        let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let selected = client.select("query", &candidates).await.unwrap();
        assert_eq!(selected, vec!["c".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_select_empty_candidates_short_circuits() {
        let client = client(vec![]);
        assert!(client.select("query", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reason_reports_confidence() {
        let client = client(vec![Ok(completion("because of [1]"))]);
        let result = client
            .reason("why", &["doc one".to_string()])
            .await
            .unwrap();
        assert_eq!(result.reasoning, "because of [1]");
        assert!((result.confidence - 1.0).abs() < f32::EPSILON);
        assert_eq!(result.tokens_used, 42);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_succeeds() {
        let client = client(vec![
            Err(MemoryError::RateLimited("slow down".into())),
            Ok(completion("[1]")),
        ]);
        let selected = client.select("q", &["only".to_string()]).await.unwrap();
        assert_eq!(selected, vec!["only".to_string()]);
    }
}
