//! End-to-end conversation over live ASR/LLM/TTS services.
//!
//! These tests talk to real cloud endpoints and are `#[ignore]`d. They need:
//! - `TENCENT_ASR_APP_ID` / `TENCENT_ASR_SECRET_ID` / `TENCENT_ASR_SECRET_KEY`
//! - `OPENAI_API_KEY` (and optionally `OPENAI_BASE_URL`, `OPENAI_MODEL`)
//! - `TENCENT_TTS_APP_ID` / `TENCENT_TTS_SECRET_ID` / `TENCENT_TTS_SECRET_KEY`
//! - `VOICELINK_TEST_WAV`: a 48 kHz stereo WAV of a short utterance
//!   (e.g. "你好")
//!
//! Run with: `cargo test --test e2e_voice_test -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use voicelink::asr::AsrStage;
use voicelink::audio::{OpusEncoder, Resampler};
use voicelink::config::Config;
use voicelink::llm::{LlmStage, OpenAiChatClient};
use voicelink::pipeline::{PacketPayload, Pipeline, Stage, TurnManager, TurnManagerConfig};
use voicelink::stream::{FileSource, WavDumper};
use voicelink::tts::TtsStage;

fn live_config() -> Option<(Config, String)> {
    let required = [
        "TENCENT_ASR_APP_ID",
        "TENCENT_ASR_SECRET_ID",
        "TENCENT_ASR_SECRET_KEY",
        "OPENAI_API_KEY",
        "TENCENT_TTS_APP_ID",
        "TENCENT_TTS_SECRET_ID",
        "TENCENT_TTS_SECRET_KEY",
        "VOICELINK_TEST_WAV",
    ];
    for name in required {
        if std::env::var(name).map(|v| v.is_empty()).unwrap_or(true) {
            eprintln!("skipping live e2e test: {name} not set");
            return None;
        }
    }

    let mut config = Config::default();
    config.asr.tencent_asr.app_id = "$TENCENT_ASR_APP_ID".to_string();
    config.asr.tencent_asr.secret_id = "$TENCENT_ASR_SECRET_ID".to_string();
    config.asr.tencent_asr.secret_key = "$TENCENT_ASR_SECRET_KEY".to_string();
    config.llm.openai.api_key = "$OPENAI_API_KEY".to_string();
    if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
        config.llm.openai.base_url = base_url;
    }
    if let Ok(model) = std::env::var("OPENAI_MODEL") {
        config.llm.openai.model = model;
    }
    config.tts.tencent_tts.app_id = "$TENCENT_TTS_APP_ID".to_string();
    config.tts.tencent_tts.secret_id = "$TENCENT_TTS_SECRET_ID".to_string();
    config.tts.tencent_tts.secret_key = "$TENCENT_TTS_SECRET_KEY".to_string();

    let wav = std::env::var("VOICELINK_TEST_WAV").unwrap();
    Some((config, wav))
}

/// Happy-path single turn: WAV in, synthesized audio frames and a two-entry
/// chat history out.
#[tokio::test]
#[ignore]
async fn single_turn_produces_audio_and_history() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
    let Some((config, wav_path)) = live_config() else {
        return;
    };

    let out_dir = tempfile::tempdir().unwrap();
    let dump_path = out_dir.path().join("agent_reply.wav");

    let source = FileSource::new(&wav_path, 48_000);
    let downsampler = Resampler::new(48_000, 16_000, 2, 1).unwrap();
    let asr = AsrStage::new(config.asr_config());
    let turn_manager = TurnManager::new(TurnManagerConfig::default());
    let llm_config = config.llm_config();
    let max_history = llm_config.max_history;
    let llm = LlmStage::new(
        Arc::new(OpenAiChatClient::new(llm_config).unwrap()),
        max_history,
    );
    let tts = TtsStage::new(config.tts_config().unwrap());
    let upsampler = Resampler::new(16_000, 48_000, 1, 2).unwrap();
    let dumper = WavDumper::new(&dump_path, 48_000, 2).unwrap();
    let encoder = OpusEncoder::new(48_000, 2).unwrap();

    source.base().set_ignore_turn(true);
    downsampler.base().set_ignore_turn(true);
    asr.base().set_ignore_turn(true);

    let mut pipeline = Pipeline::with_source(source.clone());
    let stages: Vec<Arc<dyn Stage>> = vec![
        downsampler,
        asr,
        turn_manager,
        llm.clone(),
        tts,
        upsampler,
        dumper.clone(),
        encoder.clone(),
    ];
    pipeline.connect(stages).unwrap();
    pipeline.start().await.unwrap();
    source.start().await.unwrap();

    // Wait for synthesized audio to come back through the egress chain.
    let mut encoded = encoder.output_queue().take_receiver().unwrap();
    let first_frame = tokio::time::timeout(Duration::from_secs(10), encoded.recv()).await;
    assert!(
        matches!(
            first_frame,
            Ok(Some(ref packet)) if matches!(packet.payload, PacketPayload::Audio(_))
        ),
        "no synthesized audio within 10 s"
    );

    // One user utterance, one assistant reply.
    assert_eq!(llm.history_len(), 2);

    pipeline.stop().await;
    dumper.stop().await;
    let dumped = std::fs::metadata(&dump_path).unwrap();
    assert!(dumped.len() > 44, "dump file is empty");
}
