//! Streaming speech synthesis: the flowing-synthesis WebSocket client and
//! the dual-session pipeline stage that hot-swaps on barge-in.

pub mod stage;
pub mod synthesizer;

pub use stage::TtsStage;
pub use synthesizer::FlowingSynthesizer;

/// Actions of the flowing-synthesis protocol.
pub const ACTION_SYNTHESIS: &str = "ACTION_SYNTHESIS";
pub const ACTION_COMPLETE: &str = "ACTION_COMPLETE";
pub const ACTION_RESET: &str = "ACTION_RESET";

/// Synthesizer configuration.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub app_id: i64,
    pub secret_id: String,
    pub secret_key: String,
    pub voice_type: i64,
    /// Output codec, `pcm` or `mp3`.
    pub codec: String,
    pub sample_rate: u32,
    pub volume: i32,
    pub speed: i32,
    pub enable_subtitle: bool,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            secret_id: String::new(),
            secret_key: String::new(),
            voice_type: 0,
            codec: "pcm".to_string(),
            sample_rate: 16000,
            volume: 0,
            speed: 0,
            enable_subtitle: false,
        }
    }
}

/// Error types for synthesis operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TtsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Provider not ready: {0}")]
    NotReady(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Callbacks invoked from a synthesizer's network task. Implementations
/// must not block.
pub trait SynthesisListener: Send + Sync {
    fn on_start(&self, _session_id: &str) {}
    /// Synthesized audio. An empty payload marks the end of a segment.
    fn on_audio(&self, audio: &[u8]);
    /// Subtitle/text result frames.
    fn on_text(&self, _response: &serde_json::Value) {}
    fn on_end(&self) {}
    fn on_fail(&self, _response: &serde_json::Value) {}
}
