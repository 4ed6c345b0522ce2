//! Per-connection voice agent: builds the stage graph for one conversation
//! and drives its lifecycle.
//!
//! Ingress: source → Opus decode → 48k/2ch → 16k/1ch → ASR → turn manager.
//! Egress: → LLM → TTS → 16k/1ch → 48k/2ch → Opus encode → sink.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::asr::AsrStage;
use crate::audio::{AudioError, OpusDecoder, OpusEncoder, Resampler};
use crate::config::{Config, ConfigError};
use crate::llm::{LlmStage, LlmError, OpenAiChatClient};
use crate::pipeline::{Pipeline, Stage, StageError, TurnInfo, TurnManager, TurnManagerConfig};
use crate::tts::TtsStage;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Stage(#[from] StageError),
}

pub struct VoiceAgent {
    pipeline: Pipeline,
    turn_manager: Arc<TurnManager>,
    llm: Arc<LlmStage>,
    interrupt_enabled: bool,
}

impl VoiceAgent {
    pub fn new(
        config: &Config,
        source: Arc<dyn Stage>,
        sink: Arc<dyn Stage>,
    ) -> Result<Self, AgentError> {
        let asr = AsrStage::new(config.asr_config());

        let llm_config = config.llm_config();
        let max_history = llm_config.max_history;
        let chat_client = Arc::new(OpenAiChatClient::new(llm_config)?);
        let llm = LlmStage::new(chat_client, max_history);

        let tts = TtsStage::new(config.tts_config()?);

        let decoder = OpusDecoder::new(48_000, 2)?;
        let downsampler = Resampler::new(48_000, 16_000, 2, 1)?;
        let upsampler = Resampler::new(16_000, 48_000, 1, 2)?;
        let encoder = OpusEncoder::new(48_000, 2)?;

        // The turn manager constructs with its stale filter disabled: it is
        // the authority that assigns turn sequences, and packets arriving
        // from ASR carry that stage's own counter.
        let turn_manager = TurnManager::new(TurnManagerConfig::default());
        turn_manager.set_semantic_interrupt(config.server.semantic_interrupt);

        // Stages ahead of the turn manager never see turn assignments, so
        // the stale filter must not run there either.
        source.base().set_ignore_turn(true);
        decoder.base().set_ignore_turn(true);
        downsampler.base().set_ignore_turn(true);
        asr.base().set_ignore_turn(true);

        let mut pipeline = Pipeline::with_source(source);
        pipeline.set_health_check_interval(Duration::from_secs(
            config.pipeline.health_check_interval_secs.max(1),
        ));
        let stages: Vec<Arc<dyn Stage>> = vec![
            decoder,
            downsampler,
            asr,
            turn_manager.clone(),
            llm.clone(),
            tts,
            upsampler,
            encoder,
            sink,
        ];
        pipeline.connect(stages)?;

        Ok(Self {
            pipeline,
            turn_manager,
            llm,
            interrupt_enabled: config.server.interrupt,
        })
    }

    pub async fn start(&self) -> Result<(), StageError> {
        self.pipeline.start().await
    }

    pub async fn stop(&self) {
        self.pipeline.stop().await;
    }

    /// External barge-in. The turn manager assigns the new sequence.
    pub fn interrupt(&self) {
        if !self.interrupt_enabled {
            info!("voice agent: interrupt disabled by config");
            return;
        }
        self.pipeline.send_interrupt(0);
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn llm(&self) -> &Arc<LlmStage> {
        &self.llm
    }

    pub fn current_turn(&self) -> Option<TurnInfo> {
        self.turn_manager.current_turn()
    }

    pub fn previous_turn(&self) -> Option<TurnInfo> {
        self.turn_manager.previous_turn()
    }
}
