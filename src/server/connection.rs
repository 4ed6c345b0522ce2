//! One WebRTC peer connection: local/remote audio tracks bridged onto a
//! voice-agent pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::agent::VoiceAgent;
use crate::config::Config;
use crate::errors::AppError;
use crate::pipeline::Stage;
use crate::stream::{WebRtcSink, WebRtcSource};
use crate::util::unix_millis;

pub struct WebRtcConnection {
    id: String,
    peer_connection: Arc<RTCPeerConnection>,
    config: Config,
    source: Arc<WebRtcSource>,
    sink: Arc<WebRtcSink>,
    agent: Mutex<Option<Arc<VoiceAgent>>>,
    stopped: AtomicBool,
}

impl WebRtcConnection {
    pub async fn create(
        api: &API,
        rtc_config: RTCConfiguration,
        config: Config,
    ) -> Result<Arc<Self>, AppError> {
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        // Local Opus track the encoder writes 20 ms samples into.
        let local_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            "voicelink".to_owned(),
        ));
        let rtp_sender = peer_connection
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain RTCP for the sender so interceptors keep working.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtp_sender.read(&mut buf).await {}
        });

        let connection = Arc::new(Self {
            id: format!("{}", unix_millis()),
            peer_connection: Arc::clone(&peer_connection),
            config,
            source: WebRtcSource::new(),
            sink: WebRtcSink::new(local_track),
            agent: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        Self::register_callbacks(&connection);
        Ok(connection)
    }

    fn register_callbacks(connection: &Arc<Self>) {
        let conn = Arc::downgrade(connection);
        connection
            .peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let conn = conn.clone();
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        return;
                    }
                    let Some(conn) = conn.upgrade() else { return };
                    info!("[{}] remote audio track arrived", conn.id);
                    conn.source.set_track(track);
                    if let Err(e) = conn.source.start().await {
                        warn!("[{}] failed to start WebRTC source: {e}", conn.id);
                    }
                })
            }));

        let conn = Arc::downgrade(connection);
        connection
            .peer_connection
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let conn = conn.clone();
                Box::pin(async move {
                    let Some(conn) = conn.upgrade() else { return };
                    info!("[{}] ICE connection state changed: {state}", conn.id);
                    if matches!(
                        state,
                        RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed
                    ) {
                        conn.stop().await;
                    }
                })
            }));

        let id = connection.id.clone();
        connection
            .peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                info!("[{id}] connection state changed: {state}");
                Box::pin(async {})
            }));

        let id = connection.id.clone();
        connection
            .peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(candidate) = candidate {
                    debug!("[{id}] local ICE candidate: {candidate:?}");
                }
                Box::pin(async {})
            }));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn set_remote_description(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<(), AppError> {
        Ok(self.peer_connection.set_remote_description(offer).await?)
    }

    /// Create the SDP answer, waiting for ICE gathering so the answer
    /// carries the host candidates of the muxed UDP port.
    pub async fn create_answer(&self) -> Result<RTCSessionDescription, AppError> {
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        let _ = gather_complete.recv().await;
        self.peer_connection
            .local_description()
            .await
            .ok_or_else(|| {
                AppError::InternalServerError("local description unavailable".to_string())
            })
    }

    /// Build and start the voice agent. Stage start failures propagate so
    /// the WHIP handler can surface HTTP 500.
    pub async fn start(&self) -> Result<(), AppError> {
        info!("[{}] WebRTC connection start", self.id);
        let agent = VoiceAgent::new(
            &self.config,
            Arc::clone(&self.source) as Arc<dyn Stage>,
            Arc::clone(&self.sink) as Arc<dyn Stage>,
        )
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;
        agent
            .start()
            .await
            .map_err(|e| AppError::InternalServerError(e.to_string()))?;
        *self.agent.lock().await = Some(Arc::new(agent));
        Ok(())
    }

    /// External barge-in on this conversation.
    pub async fn interrupt(&self) {
        if let Some(agent) = self.agent.lock().await.as_ref() {
            agent.interrupt();
        }
    }

    /// Tear down the agent and the peer connection. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{}] WebRTC connection stop", self.id);
        if let Some(agent) = self.agent.lock().await.take() {
            agent.stop().await;
        }
        if let Err(e) = self.peer_connection.close().await {
            warn!("[{}] error closing peer connection: {e}", self.id);
        }
    }
}
