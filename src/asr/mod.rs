//! Streaming speech recognition: a WebSocket client for the realtime
//! recognizer service and the pipeline stage that feeds it PCM.

pub mod client;
pub mod stage;

pub use client::{AsrClient, AsrConnectionState};
pub use stage::AsrStage;

/// Recognizer configuration.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub app_id: String,
    pub secret_id: String,
    pub secret_key: String,
    /// Engine model, e.g. `16k_zh`.
    pub engine_model_type: String,
    /// Bytes per audio write to the recognizer.
    pub slice_size: usize,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            secret_id: String::new(),
            secret_key: String::new(),
            engine_model_type: "16k_zh".to_string(),
            slice_size: 6400,
        }
    }
}

/// Error types for recognizer operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AsrError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Provider error: {0}")]
    ProviderError(String),
}

/// Callbacks invoked from the recognizer's network task. Implementations
/// must not block.
pub trait AsrListener: Send + Sync {
    fn on_start(&self, _voice_id: &str) {}
    fn on_sentence_begin(&self, _voice_id: &str) {}
    /// Partial text for the sentence in progress.
    fn on_result_change(&self, _text: &str) {}
    /// Final text for a finished sentence.
    fn on_sentence_end(&self, text: &str);
    fn on_complete(&self) {}
    fn on_fail(&self, _err: &AsrError) {}
}
