//! Pipeline stage feeding PCM to the streaming recognizer and emitting
//! recognized sentences as text packets.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{info, warn};

use super::client::AsrClient;
use super::{AsrConfig, AsrError, AsrListener};
use crate::pipeline::{
    BaseStage, Packet, PacketCommand, PacketPayload, PacketQueue, Stage, StageError, StageHealth,
    TurnMetric,
};
use crate::util::{pcm_to_le_bytes, unix_millis};

pub struct AsrStage {
    base: Arc<BaseStage>,
    client: Arc<AsrClient>,
}

impl AsrStage {
    pub fn new(config: AsrConfig) -> Arc<Self> {
        let base = BaseStage::new("TencentASR", 4000);
        let client = Arc::new(AsrClient::new(config));

        base.register_command_handler(
            PacketCommand::Interrupt,
            Arc::new(|base, packet| {
                info!("{}: interrupt for turn {}", base.name(), packet.turn_seq);
                base.incr_turn_seq();
                base.forward_packet(packet);
            }),
        );

        {
            let client = Arc::clone(&client);
            base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
                let client = Arc::clone(&client);
                Box::pin(async move {
                    let bytes = match &packet.payload {
                        PacketPayload::Pcm(samples) => pcm_to_le_bytes(samples),
                        PacketPayload::Raw(bytes) => bytes.clone(),
                        other => {
                            base.handle_unsupported(other);
                            return;
                        }
                    };
                    if let Err(e) = client.send_audio(&bytes) {
                        warn!("{}: failed to write audio data: {e}", base.name());
                        base.record_error(e);
                    }
                })
            }));
        }

        Arc::new(Self { base, client })
    }

    pub fn client(&self) -> &Arc<AsrClient> {
        &self.client
    }
}

#[async_trait::async_trait]
impl Stage for AsrStage {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }

    /// Recognition is a critical stage: a connect failure propagates and the
    /// caller tears the connection down.
    async fn start(&self) -> Result<(), StageError> {
        let listener = Arc::new(StageListener {
            name: self.base.name().to_string(),
            output: self.base.output_queue(),
            health: self.base.health_handle(),
            turn_counter: self.base.turn_counter(),
            seq: AtomicU64::new(0),
            sentence_start_ms: AtomicI64::new(0),
        });
        self.client.set_listener(listener);
        self.client
            .connect()
            .await
            .map_err(|e| StageError::StartFailed(self.base.name().to_string(), e.to_string()))?;
        self.base.start()
    }

    async fn stop(&self) {
        self.base.stop();
        self.client.disconnect();
    }
}

/// Bridges recognizer callbacks onto the stage's output queue. Holds only
/// the queue/health/turn handles so the network task never reaches back into
/// the stage itself.
struct StageListener {
    name: String,
    output: Arc<PacketQueue>,
    health: Arc<RwLock<StageHealth>>,
    turn_counter: Arc<AtomicU64>,
    seq: AtomicU64,
    sentence_start_ms: AtomicI64,
}

impl AsrListener for StageListener {
    fn on_start(&self, voice_id: &str) {
        info!("{}: recognition started, voice_id={voice_id}", self.name);
    }

    fn on_sentence_begin(&self, voice_id: &str) {
        info!("{}: sentence begin, voice_id={voice_id}", self.name);
        self.sentence_start_ms.store(unix_millis(), Ordering::Relaxed);
    }

    fn on_sentence_end(&self, text: &str) {
        info!("{}: sentence end, text={text}", self.name);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut packet = Packet {
            payload: PacketPayload::Text(text.to_string()),
            seq,
            src: self.name.clone(),
            turn_seq: self.turn_counter.load(Ordering::Acquire),
            ..Default::default()
        };
        packet.push_metric(
            format!("{}_{seq}", self.name),
            TurnMetric {
                start_ms: self.sentence_start_ms.load(Ordering::Relaxed),
                end_ms: unix_millis(),
            },
        );
        if self.output.try_push(packet).is_err() {
            warn!("{}: output queue full, dropping sentence", self.name);
            self.health.write().dropped += 1;
        }
    }

    fn on_complete(&self) {
        info!("{}: recognition complete", self.name);
    }

    fn on_fail(&self, err: &AsrError) {
        warn!("{}: recognition failed: {err}", self.name);
        let mut health = self.health.write();
        health.last_error = Some(err.to_string());
        health.last_error_time = Some(std::time::SystemTime::now());
    }
}
