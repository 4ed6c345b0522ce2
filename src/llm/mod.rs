//! Streaming chat completion: the OpenAI-compatible client and the pipeline
//! stage that turns recognized sentences into streamed model output.

pub mod client;
pub mod stage;

use std::pin::Pin;

use futures::Stream;

pub use client::OpenAiChatClient;
pub use stage::LlmStage;

/// One message of conversation history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// Chat model configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Bounded history size in messages.
    pub max_history: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_tokens: None,
            max_history: stage::DEFAULT_MAX_HISTORY,
        }
    }
}

/// Error types for chat operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Malformed response: {0}")]
    Parse(String),
}

/// Stream of content chunks from a completion in progress. Dropping the
/// stream cancels the underlying request.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// A chat backend. The production implementation streams from an
/// OpenAI-compatible endpoint; tests substitute scripted streams.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    /// Start a streaming completion for `messages`.
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<ChunkStream, LlmError>;

    /// Blocking (non-streaming) completion.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}
