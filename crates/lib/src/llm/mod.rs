//! LLM abstraction and Groq client.
//!
//! The bot talks to one OpenAI-compatible chat-completions endpoint (Groq by
//! default). `ChatBackend` is the seam the agent and tests program against.

mod groq;

pub use groq::{ChatChoice, ChatMessage, ChatResponse, GroqClient, LlmError};

use async_trait::async_trait;

/// Chat-completion backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// One non-streaming completion for the given model and message list.
    async fn chat(&self, model: &str, messages: Vec<ChatMessage>) -> Result<ChatResponse, LlmError>;
}
