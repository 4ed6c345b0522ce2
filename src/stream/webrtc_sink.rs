//! WebRTC egress: writes audio-frame packets to the local track as 20 ms
//! samples and reports end-to-end turn latency on the first frame of each
//! turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::pipeline::{BaseStage, Packet, PacketCommand, PacketPayload, Stage};
use crate::util::unix_millis;

const SAMPLE_DURATION: Duration = Duration::from_millis(20);

/// Buffer several minutes of 20 ms frames so a TTS burst never stalls the
/// encoder.
const SINK_QUEUE_CAPACITY: usize = 5 * 60 * 50;

pub struct WebRtcSink {
    base: Arc<BaseStage>,
}

impl WebRtcSink {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Arc<Self> {
        let base = BaseStage::new("WebRTCSink", SINK_QUEUE_CAPACITY);
        let first_of_turn = Arc::new(AtomicBool::new(true));

        {
            let first_of_turn = Arc::clone(&first_of_turn);
            base.register_command_handler(
                PacketCommand::Interrupt,
                Arc::new(move |base, packet| {
                    info!("{}: interrupt for turn {}", base.name(), packet.turn_seq);
                    base.set_cur_turn_seq(packet.turn_seq);
                    base.set_turn_start_ms(unix_millis());
                    first_of_turn.store(true, Ordering::Release);
                }),
            );
        }

        base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
            let track = Arc::clone(&track);
            let first_of_turn = Arc::clone(&first_of_turn);
            Box::pin(async move {
                let PacketPayload::Audio(frame) = &packet.payload else {
                    base.handle_unsupported(&packet.payload);
                    return;
                };

                if first_of_turn.swap(false, Ordering::AcqRel) {
                    let turn_start = base.turn_start_ms();
                    if turn_start > 0 {
                        info!(
                            "{}: turn {} first audio after {} ms",
                            base.name(),
                            packet.turn_seq,
                            unix_millis() - turn_start
                        );
                    }
                }

                let sample = Sample {
                    data: frame.payload.clone(),
                    duration: SAMPLE_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    warn!("{}: failed to write sample: {e}", base.name());
                    base.record_error(e);
                }
            })
        }));

        Arc::new(Self { base })
    }
}

impl Stage for WebRtcSink {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }
}
