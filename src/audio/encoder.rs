//! Opus encoder stage.
//!
//! PCM packets accumulate in a buffer; whole 960 × channels frames are handed
//! to a dedicated encode task over a bounded channel (drop-on-full, like
//! every other edge). The encode task releases frame *n* no earlier than
//! `first_emit + n × 20 ms`, pacing output toward realtime on a monotonic
//! schedule, and abandons a request as soon as its turn goes stale.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{AudioError, OPUS_FRAME_SAMPLES, opus_channels, opus_sample_rate};
use crate::pipeline::{
    AudioFrame, BaseStage, Packet, PacketCommand, PacketPayload, Stage, StageError,
};
use crate::util::unix_millis;

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_ENCODE_CAPACITY: usize = 100;
const MAX_OPUS_PACKET: usize = 2048;

struct EncodeRequest {
    samples: Vec<i16>,
    turn_seq: u64,
}

struct EncoderInner {
    buffer: Mutex<Vec<i16>>,
    encode_tx: mpsc::Sender<EncodeRequest>,
    frame_size: usize,
}

pub struct OpusEncoder {
    base: Arc<BaseStage>,
    inner: Arc<EncoderInner>,
    encode_rx: Mutex<Option<mpsc::Receiver<EncodeRequest>>>,
    encoder: Mutex<Option<audiopus::coder::Encoder>>,
}

impl OpusEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Arc<Self>, AudioError> {
        Self::with_encode_capacity(sample_rate, channels, DEFAULT_ENCODE_CAPACITY)
    }

    /// Constructor with an explicit encode-channel capacity, for tests that
    /// exercise backpressure.
    pub fn with_encode_capacity(
        sample_rate: u32,
        channels: u16,
        encode_capacity: usize,
    ) -> Result<Arc<Self>, AudioError> {
        let encoder = audiopus::coder::Encoder::new(
            opus_sample_rate(sample_rate)?,
            opus_channels(channels)?,
            audiopus::Application::Voip,
        )
        .map_err(|e| AudioError::OpusCoder(e.to_string()))?;

        let (encode_tx, encode_rx) = mpsc::channel(encode_capacity);
        let base = BaseStage::new("OpusEncoder", 4000);
        let inner = Arc::new(EncoderInner {
            buffer: Mutex::new(Vec::new()),
            encode_tx,
            frame_size: OPUS_FRAME_SAMPLES * channels as usize,
        });

        {
            let inner = Arc::clone(&inner);
            base.register_command_handler(
                PacketCommand::Interrupt,
                Arc::new(move |base, packet| {
                    info!("{}: interrupt for turn {}", base.name(), packet.turn_seq);
                    base.set_cur_turn_seq(packet.turn_seq);
                    base.forward_packet(packet);
                    inner.buffer.lock().clear();
                }),
            );
        }

        {
            let inner = Arc::clone(&inner);
            base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    inner.handle_packet(&base, packet);
                })
            }));
        }

        Ok(Arc::new(Self {
            base,
            inner,
            encode_rx: Mutex::new(Some(encode_rx)),
            encoder: Mutex::new(Some(encoder)),
        }))
    }
}

impl EncoderInner {
    fn handle_packet(&self, base: &Arc<BaseStage>, packet: Packet) {
        // A packet from a superseded turn invalidates everything buffered
        // with it.
        if packet.turn_seq < base.cur_turn_seq() {
            debug!(
                "{}: cur turn {}, dropping old turn packet (seq {})",
                base.name(),
                base.cur_turn_seq(),
                packet.turn_seq
            );
            self.buffer.lock().clear();
            return;
        }

        let PacketPayload::Pcm(samples) = &packet.payload else {
            base.handle_unsupported(&packet.payload);
            return;
        };

        let request = {
            let mut buffer = self.buffer.lock();
            buffer.extend_from_slice(samples);
            let whole = (buffer.len() / self.frame_size) * self.frame_size;
            if whole == 0 {
                return;
            }
            EncodeRequest {
                samples: buffer.drain(..whole).collect(),
                turn_seq: packet.turn_seq,
            }
        };

        if self.encode_tx.try_send(request).is_err() {
            error!("{}: encode channel full, dropping data", base.name());
            base.record_drop();
            return;
        }

        // This is the tail of the egress path; surface any latency spans the
        // packet collected on its way here.
        for key in &packet.metric_keys {
            if let Some(metric) = packet.metrics.get(key) {
                info!(
                    "turn metric: {key} start={} end={} latency={} ms",
                    metric.start_ms,
                    metric.end_ms,
                    metric.latency_ms()
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl Stage for OpusEncoder {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }

    async fn start(&self) -> Result<(), StageError> {
        let rx = self.encode_rx.lock().take();
        let encoder = self.encoder.lock().take();
        if let (Some(rx), Some(encoder)) = (rx, encoder) {
            spawn_encode_task(Arc::clone(&self.base), self.inner.frame_size, rx, encoder);
        }
        self.base.start()
    }
}

fn spawn_encode_task(
    base: Arc<BaseStage>,
    frame_size: usize,
    mut rx: mpsc::Receiver<EncodeRequest>,
    mut encoder: audiopus::coder::Encoder,
) {
    let mut shutdown = base.shutdown_signal();
    tokio::spawn(async move {
        let mut first_emit: Option<Instant> = None;
        let mut frames_emitted: u32 = 0;

        loop {
            let request = tokio::select! {
                _ = shutdown.recv() => return,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => return,
                },
            };

            let mut samples = request.samples;
            while samples.len() >= frame_size {
                if request.turn_seq < base.cur_turn_seq() {
                    debug!(
                        "{}: encode loop dropping old turn (seq {})",
                        base.name(),
                        request.turn_seq
                    );
                    break;
                }

                let mut opus = vec![0u8; MAX_OPUS_PACKET];
                match encoder.encode(&samples[..frame_size], &mut opus) {
                    Ok(len) => {
                        opus.truncate(len);
                        // Stamp the turn validated above; a concurrent
                        // interrupt must not relabel this frame as fresh.
                        base.send_packet_with_turn(
                            request.turn_seq,
                            PacketPayload::Audio(AudioFrame::new(opus, unix_millis() as u32)),
                        );
                        base.record_processed();
                    }
                    Err(e) => {
                        warn!("{}: Opus encoding failed: {e}", base.name());
                        base.record_error(e);
                        break;
                    }
                }
                samples.drain(..frame_size);

                // Pace toward realtime: frame n is due at first_emit + n*20ms.
                // After an idle gap the schedule restarts from now instead of
                // bursting to catch up.
                let baseline = *first_emit.get_or_insert_with(Instant::now);
                frames_emitted += 1;
                let mut deadline = baseline + FRAME_INTERVAL * frames_emitted;
                let now = Instant::now();
                if deadline < now {
                    first_emit = Some(now);
                    frames_emitted = 0;
                    deadline = now;
                }
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        }
    });
}
