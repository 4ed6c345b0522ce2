//! Server configuration.
//!
//! Configuration is a YAML file mapped straight onto these structs; every
//! section and key has a default so a partial file works. Credential values
//! beginning with `$` are resolved from the corresponding process
//! environment variable at use time, never stored resolved.

use std::path::Path;

use serde::Deserialize;

use crate::asr::AsrConfig;
use crate::llm::LlmConfig;
use crate::tts::TtsConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("error parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub asr: AsrSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub tts: TtsSection,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen port for WHIP signaling.
    pub http_port: u16,
    /// Single multiplexed UDP port for WebRTC media.
    pub udp_port: u16,
    /// Advertised ICE candidate addresses.
    pub public_ip: Vec<String>,
    /// Enable external (command) barge-in.
    pub interrupt: bool,
    /// Enable sentence-boundary (semantic) barge-in.
    pub semantic_interrupt: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            udp_port: 8443,
            public_ip: Vec::new(),
            interrupt: true,
            semantic_interrupt: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AsrSection {
    pub r#type: String,
    pub tencent_asr: TencentAsrConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TencentAsrConfig {
    pub app_id: String,
    pub secret_id: String,
    pub secret_key: String,
    pub engine_model_type: String,
    pub slice_size: usize,
}

impl Default for TencentAsrConfig {
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

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub r#type: String,
    pub openai: OpenAiConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub max_history: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_tokens: None,
            max_history: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TtsSection {
    pub r#type: String,
    pub tencent_tts: TencentTtsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TencentTtsConfig {
    pub app_id: String,
    pub secret_id: String,
    pub secret_key: String,
    pub voice_type: i64,
    pub codec: String,
}

impl Default for TencentTtsConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            secret_id: String::new(),
            secret_key: String::new(),
            voice_type: 0,
            codec: "pcm".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Log file path; empty logs to stdout only.
    pub file: String,
    pub max_size: u32,
    pub max_backups: u32,
    pub max_age: u32,
    pub compress: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
            max_size: 100,
            max_backups: 5,
            max_age: 30,
            compress: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub health_check_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
        }
    }
}

/// Resolve a `$VAR` value from the environment; anything else passes
/// through unchanged.
pub fn resolve_env(value: &str) -> String {
    match value.strip_prefix('$') {
        Some(name) => std::env::var(name).unwrap_or_default(),
        None => value.to_string(),
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Recognizer config with credentials resolved.
    pub fn asr_config(&self) -> AsrConfig {
        let section = &self.asr.tencent_asr;
        AsrConfig {
            app_id: resolve_env(&section.app_id),
            secret_id: resolve_env(&section.secret_id),
            secret_key: resolve_env(&section.secret_key),
            engine_model_type: section.engine_model_type.clone(),
            slice_size: section.slice_size,
        }
    }

    /// Chat config with credentials resolved.
    pub fn llm_config(&self) -> LlmConfig {
        let section = &self.llm.openai;
        LlmConfig {
            api_key: resolve_env(&section.api_key),
            base_url: resolve_env(&section.base_url),
            model: section.model.clone(),
            temperature: section.temperature,
            max_tokens: section.max_tokens,
            max_history: section.max_history,
        }
    }

    /// Synthesizer config with credentials resolved.
    pub fn tts_config(&self) -> Result<TtsConfig, ConfigError> {
        let section = &self.tts.tencent_tts;
        let app_id = resolve_env(&section.app_id);
        let app_id = if app_id.is_empty() {
            0
        } else {
            app_id
                .parse::<i64>()
                .map_err(|e| ConfigError::Invalid(format!("tts app_id: {e}")))?
        };
        Ok(TtsConfig {
            app_id,
            secret_id: resolve_env(&section.secret_id),
            secret_key: resolve_env(&section.secret_key),
            voice_type: section.voice_type,
            codec: section.codec.clone(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let yaml = r#"
server:
  http_port: 9090
  udp_port: 9443
  public_ip: ["198.51.100.7"]
  interrupt: true
  semantic_interrupt: false
asr:
  type: tencent_asr
  tencent_asr:
    app_id: "1234"
    secret_id: $ASR_SECRET_ID
    secret_key: $ASR_SECRET_KEY
    engine_model_type: 16k_zh
    slice_size: 3200
llm:
  type: openai
  openai:
    api_key: $OPENAI_API_KEY
    base_url: https://api.deepseek.com/v1
    model: deepseek-chat
    temperature: 0.7
    max_tokens: 512
    max_history: 6
tts:
  type: tencent_tts
  tencent_tts:
    app_id: "1234"
    secret_id: sid
    secret_key: skey
    voice_type: 101001
    codec: pcm
log:
  level: debug
  file: logs/voicelink.log
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.http_port, 9090);
        assert!(!config.server.semantic_interrupt);
        assert_eq!(config.asr.tencent_asr.slice_size, 3200);
        assert_eq!(config.llm.openai.model, "deepseek-chat");
        assert_eq!(config.llm.openai.max_history, 6);
        assert_eq!(config.tts.tencent_tts.voice_type, 101001);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.pipeline.health_check_interval_secs, 30);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.http_port, 8080);
        assert!(config.server.interrupt);
        assert_eq!(config.asr.tencent_asr.engine_model_type, "16k_zh");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn env_substitution_applies_to_credentials() {
        // SAFETY: test-local variable, no concurrent reader depends on it.
        unsafe { std::env::set_var("VOICELINK_TEST_SECRET", "resolved-secret") };
        assert_eq!(resolve_env("$VOICELINK_TEST_SECRET"), "resolved-secret");
        assert_eq!(resolve_env("plain-value"), "plain-value");
        assert_eq!(resolve_env("$VOICELINK_TEST_MISSING"), "");
    }

    #[test]
    fn tts_app_id_must_be_numeric() {
        let mut config = Config::default();
        config.tts.tencent_tts.app_id = "not-a-number".to_string();
        assert!(config.tts_config().is_err());

        config.tts.tencent_tts.app_id = "1400000000".to_string();
        assert_eq!(config.tts_config().unwrap().app_id, 1400000000);
    }
}
