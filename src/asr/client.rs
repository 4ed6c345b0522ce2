//! WebSocket client for the realtime speech recognizer.
//!
//! The recognizer speaks a signed-URL WebSocket protocol: the client opens
//! `wss://.../asr/v2/{app_id}?<sorted params>&signature=<hmac-sha1>`, streams
//! raw PCM as binary frames in `slice_size` chunks, and receives JSON text
//! frames describing sentence progress (`slice_type` 0 = begin, 1 = partial,
//! 2 = end) until a `final` frame closes the stream.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Deserialize;
use sha1::Sha1;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::{AsrConfig, AsrError, AsrListener};
use crate::util::unix_millis;

const ASR_HOST: &str = "asr.cloud.tencent.com";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type HmacSha1 = Hmac<Sha1>;

/// Connection state of the recognizer session.
#[derive(Debug, Clone, PartialEq)]
pub enum AsrConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Wire format of recognizer responses.
#[derive(Debug, Deserialize)]
struct AsrResponse {
    code: i32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    voice_id: String,
    #[serde(default)]
    r#final: i32,
    result: Option<AsrSentenceResult>,
}

#[derive(Debug, Deserialize)]
struct AsrSentenceResult {
    slice_type: i32,
    #[serde(default)]
    voice_text_str: String,
}

pub struct AsrClient {
    config: AsrConfig,
    state: Arc<Mutex<AsrConnectionState>>,
    audio_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
    listener: Mutex<Option<Arc<dyn AsrListener>>>,
}

impl AsrClient {
    pub fn new(config: AsrConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(AsrConnectionState::Disconnected)),
            audio_tx: Mutex::new(None),
            shutdown: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn AsrListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn state(&self) -> AsrConnectionState {
        self.state.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.audio_tx.lock().is_some()
    }

    /// Build the signed WebSocket URL for a new recognition session.
    fn build_websocket_url(&self, voice_id: &str) -> Result<String, AsrError> {
        if self.config.secret_id.is_empty() || self.config.secret_key.is_empty() {
            return Err(AsrError::AuthenticationFailed(
                "secret_id and secret_key are required".to_string(),
            ));
        }

        let timestamp = unix_millis() / 1000;
        let mut params: Vec<(&str, String)> = vec![
            ("secretid", self.config.secret_id.clone()),
            ("timestamp", timestamp.to_string()),
            ("expired", (timestamp + 24 * 60 * 60).to_string()),
            ("nonce", (rand::random::<u32>() % 1_000_000).to_string()),
            ("engine_model_type", self.config.engine_model_type.clone()),
            ("voice_id", voice_id.to_string()),
            ("voice_format", "1".to_string()),
            ("needvad", "1".to_string()),
        ];
        params.sort_by(|a, b| a.0.cmp(b.0));

        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let path = format!("/asr/v2/{}", self.config.app_id);
        let sign_input = format!("{ASR_HOST}{path}?{query}");

        let mut mac = HmacSha1::new_from_slice(self.config.secret_key.as_bytes())
            .map_err(|e| AsrError::ConfigurationError(e.to_string()))?;
        mac.update(sign_input.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        let signature: String = url::form_urlencoded::byte_serialize(signature.as_bytes()).collect();

        Ok(format!("wss://{ASR_HOST}{path}?{query}&signature={signature}"))
    }

    /// Open the recognition session and spawn the connection task.
    pub async fn connect(&self) -> Result<(), AsrError> {
        if self.is_ready() {
            return Err(AsrError::ConnectionFailed(
                "recognizer already started".to_string(),
            ));
        }

        let voice_id = format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>());
        let ws_url = self.build_websocket_url(&voice_id)?;

        *self.state.lock() = AsrConnectionState::Connecting;

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&ws_url))
            .await
            .map_err(|_| AsrError::ConnectionFailed("connection timeout".to_string()))?
            .map_err(|e| {
                *self.state.lock() = AsrConnectionState::Error(e.to_string());
                AsrError::ConnectionFailed(e.to_string())
            })?;

        info!("connected to recognizer, voice_id={voice_id}");
        *self.state.lock() = AsrConnectionState::Connected;

        let (audio_tx, mut audio_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        *self.audio_tx.lock() = Some(audio_tx);
        *self.shutdown.lock() = Some(shutdown_tx);

        let state = Arc::clone(&self.state);
        let listener = self.listener.lock().clone();
        tokio::spawn(async move {
            let (mut ws_sink, mut ws_stream) = ws_stream.split();
            let mut started = false;

            loop {
                tokio::select! {
                    chunk = audio_rx.recv() => {
                        let Some(chunk) = chunk else { break };
                        if let Err(e) = ws_sink.send(Message::Binary(chunk.into())).await {
                            error!("recognizer: failed to send audio: {e}");
                            if let Some(listener) = &listener {
                                listener.on_fail(&AsrError::NetworkError(e.to_string()));
                            }
                            break;
                        }
                    }
                    message = ws_stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                if handle_text_frame(text.as_str(), &listener, &mut started) {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!("recognizer connection closed: {frame:?}");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("recognizer websocket error: {e}");
                                if let Some(listener) = &listener {
                                    listener.on_fail(&AsrError::NetworkError(e.to_string()));
                                }
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        // Flush the end-of-stream marker so the service
                        // finalizes the last sentence.
                        let _ = ws_sink.send(Message::Text(r#"{"type": "end"}"#.into())).await;
                        break;
                    }
                }
            }

            *state.lock() = AsrConnectionState::Disconnected;
            debug!("recognizer connection task finished");
        });

        Ok(())
    }

    /// Queue PCM bytes toward the recognizer in `slice_size` writes.
    pub fn send_audio(&self, audio: &[u8]) -> Result<(), AsrError> {
        let guard = self.audio_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(AsrError::ConnectionFailed("not connected".to_string()));
        };
        let slice = self.config.slice_size.max(1);
        for chunk in audio.chunks(slice) {
            tx.send(chunk.to_vec())
                .map_err(|_| AsrError::NetworkError("connection task gone".to_string()))?;
        }
        Ok(())
    }

    /// Close the session. Idempotent.
    pub fn disconnect(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        *self.audio_tx.lock() = None;
    }
}

impl Drop for AsrClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Returns true when the stream is finished.
fn handle_text_frame(
    text: &str,
    listener: &Option<Arc<dyn AsrListener>>,
    started: &mut bool,
) -> bool {
    let response: AsrResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            warn!("recognizer: unparseable frame: {e}");
            return false;
        }
    };

    if response.code != 0 {
        error!(
            "recognizer failure: code={} message={}",
            response.code, response.message
        );
        if let Some(listener) = listener {
            listener.on_fail(&AsrError::ProviderError(format!(
                "{}: {}",
                response.code, response.message
            )));
        }
        return true;
    }

    if !*started {
        *started = true;
        if let Some(listener) = listener {
            listener.on_start(&response.voice_id);
        }
    }

    if let Some(result) = &response.result {
        if let Some(listener) = listener {
            match result.slice_type {
                0 => listener.on_sentence_begin(&response.voice_id),
                1 => listener.on_result_change(&result.voice_text_str),
                2 => listener.on_sentence_end(&result.voice_text_str),
                other => warn!("recognizer: unknown slice_type {other}"),
            }
        }
    }

    if response.r#final == 1 {
        if let Some(listener) = listener {
            listener.on_complete();
        }
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Collector {
        ends: Mutex<Vec<String>>,
        partials: AtomicUsize,
        fails: AtomicUsize,
    }

    impl AsrListener for Collector {
        fn on_result_change(&self, _text: &str) {
            self.partials.fetch_add(1, Ordering::SeqCst);
        }
        fn on_sentence_end(&self, text: &str) {
            self.ends.lock().push(text.to_string());
        }
        fn on_fail(&self, _err: &AsrError) {
            self.fails.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn collector() -> Arc<Collector> {
        Arc::new(Collector {
            ends: Mutex::new(Vec::new()),
            partials: AtomicUsize::new(0),
            fails: AtomicUsize::new(0),
        })
    }

    #[test]
    fn signed_url_contains_sorted_params_and_signature() {
        let client = AsrClient::new(AsrConfig {
            app_id: "125".to_string(),
            secret_id: "sid".to_string(),
            secret_key: "skey".to_string(),
            ..Default::default()
        });
        let url = client.build_websocket_url("abc").unwrap();
        assert!(url.starts_with("wss://asr.cloud.tencent.com/asr/v2/125?"));
        assert!(url.contains("engine_model_type=16k_zh"));
        assert!(url.contains("voice_format=1"));
        assert!(url.contains("&signature="));
        // Sorted: engine_model_type before expired before needvad.
        let e = url.find("engine_model_type").unwrap();
        let x = url.find("expired").unwrap();
        let n = url.find("needvad").unwrap();
        assert!(e < x && x < n);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let client = AsrClient::new(AsrConfig::default());
        let err = client.build_websocket_url("abc").unwrap_err();
        assert!(matches!(err, AsrError::AuthenticationFailed(_)));
    }

    #[test]
    fn sentence_frames_dispatch_to_listener() {
        let listener = collector();
        let dyn_listener: Option<Arc<dyn AsrListener>> = Some(listener.clone());
        let mut started = false;

        let begin = r#"{"code":0,"voice_id":"v1","final":0,"result":{"slice_type":0,"voice_text_str":""}}"#;
        let partial = r#"{"code":0,"voice_id":"v1","final":0,"result":{"slice_type":1,"voice_text_str":"你"}}"#;
        let end = r#"{"code":0,"voice_id":"v1","final":0,"result":{"slice_type":2,"voice_text_str":"你好。"}}"#;

        assert!(!handle_text_frame(begin, &dyn_listener, &mut started));
        assert!(!handle_text_frame(partial, &dyn_listener, &mut started));
        assert!(!handle_text_frame(end, &dyn_listener, &mut started));
        assert!(started);

        assert_eq!(listener.partials.load(Ordering::SeqCst), 1);
        assert_eq!(*listener.ends.lock(), vec!["你好。".to_string()]);
    }

    #[test]
    fn failure_frame_terminates_stream() {
        let listener = collector();
        let dyn_listener: Option<Arc<dyn AsrListener>> = Some(listener.clone());
        let mut started = false;

        let failure = r#"{"code":4001,"message":"bad params"}"#;
        assert!(handle_text_frame(failure, &dyn_listener, &mut started));
        assert_eq!(listener.fails.load(Ordering::SeqCst), 1);
    }
}
