// MNEMO Processing - chunking, embedding and LLM reasoning

pub mod chunker;
pub mod embedding;
pub mod llm;

pub use chunker::{count_tokens, model_token_limit, Chunker, TextChunk};
pub use embedding::{
    normalize_vector, similarity, EmbeddingClient, EmbeddingTransport, HttpEmbeddingTransport,
};
pub use llm::{ChatMessage, Completion, HttpLlmTransport, LlmClient, LlmTransport, ReasoningResult};
