//! WebRTC ingest: reads RTP packets off the remote audio track and turns
//! them into audio-frame packets.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::pipeline::{AudioFrame, BaseStage, PacketPayload, Stage, StageError, StageState};

pub struct WebRtcSource {
    base: Arc<BaseStage>,
    track: Mutex<Option<Arc<TrackRemote>>>,
}

impl WebRtcSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: BaseStage::new("WebRTCSource", 100),
            track: Mutex::new(None),
        })
    }

    /// Install the remote track. Called from the peer connection's on-track
    /// callback before `start`.
    pub fn set_track(&self, track: Arc<TrackRemote>) {
        *self.track.lock() = Some(track);
    }
}

#[async_trait::async_trait]
impl Stage for WebRtcSource {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }

    async fn start(&self) -> Result<(), StageError> {
        let Some(track) = self.track.lock().clone() else {
            return Err(StageError::NotConfigured(
                self.base.name().to_string(),
                "remote track not set".into(),
            ));
        };

        self.base.mark_started();
        self.base.set_state(StageState::Running);
        info!("started source stage {}", self.base.name());

        let base = Arc::clone(&self.base);
        let mut shutdown = self.base.shutdown_signal();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    result = track.read_rtp() => match result {
                        Ok((rtp, _)) => {
                            base.send_packet(PacketPayload::Audio(AudioFrame::new(
                                rtp.payload,
                                rtp.header.timestamp,
                            )));
                            base.record_processed();
                        }
                        Err(e) => {
                            // A closed track ends the stream; anything else
                            // is recorded and the loop keeps reading.
                            if matches!(e, webrtc::Error::ErrClosedPipe)
                                || e.to_string().contains("EOF")
                            {
                                break;
                            }
                            warn!("{}: failed to read RTP packet: {e}", base.name());
                            base.record_error(e);
                        }
                    }
                }
            }
            base.set_state(StageState::Stopped);
        });

        Ok(())
    }
}
