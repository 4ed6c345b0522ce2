//! WHIP signaling boundary: the WebRTC API/session registry and the axum
//! handlers that drive it.

pub mod agent;
pub mod connection;
pub mod handlers;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::info;
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::UDPNetwork;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub use agent::VoiceAgent;
pub use connection::WebRtcConnection;

use crate::config::Config;
use crate::errors::AppError;

/// Shared axum state.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<WhipServer>,
    pub config: Config,
}

/// Registry of live WebRTC sessions behind the WHIP endpoints. All media
/// flows over one multiplexed UDP socket.
pub struct WhipServer {
    api: API,
    rtc_config: RTCConfiguration,
    config: Config,
    connections: Mutex<HashMap<String, Arc<WebRtcConnection>>>,
}

impl WhipServer {
    pub async fn init(config: Config) -> Result<Self, AppError> {
        let udp_socket = UdpSocket::bind(("0.0.0.0", config.server.udp_port))
            .await
            .map_err(|e| AppError::InternalServerError(format!("bind UDP port: {e}")))?;
        info!("listening for media on UDP port {}", config.server.udp_port);
        let udp_mux = UDPMuxDefault::new(UDPMuxParams::new(udp_socket));

        let mut setting_engine = SettingEngine::default();
        setting_engine.set_udp_network(UDPNetwork::Muxed(udp_mux));
        setting_engine.set_network_types(vec![NetworkType::Udp4]);
        if !config.server.public_ip.is_empty() {
            setting_engine
                .set_nat_1to1_ips(config.server.public_ip.clone(), RTCIceCandidateType::Host);
        }

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        Ok(Self {
            api,
            rtc_config: RTCConfiguration::default(),
            config,
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Answer an SDP offer with a fully started conversation session.
    pub async fn handle_new_connection(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<(RTCSessionDescription, String), AppError> {
        let connection =
            WebRtcConnection::create(&self.api, self.rtc_config.clone(), self.config.clone())
                .await?;

        if let Err(e) = connection.set_remote_description(offer).await {
            connection.stop().await;
            return Err(e);
        }
        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                connection.stop().await;
                return Err(e);
            }
        };
        if let Err(e) = connection.start().await {
            connection.stop().await;
            return Err(e);
        }

        let session_id = connection.id().to_string();
        self.connections
            .lock()
            .await
            .insert(session_id.clone(), connection);
        info!("session created: {session_id}");
        Ok((answer, session_id))
    }

    /// Stop and dispose one session. Returns false when unknown.
    pub async fn delete_connection(&self, session_id: &str) -> bool {
        let connection = self.connections.lock().await.remove(session_id);
        match connection {
            Some(connection) => {
                connection.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Stop every session; used on process shutdown.
    pub async fn shutdown(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (_, connection) in connections {
            connection.stop().await;
        }
    }
}
