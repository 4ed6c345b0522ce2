//! One flowing-synthesis WebSocket session.
//!
//! The session opens against a signed URL, accepts `ACTION_SYNTHESIS` /
//! `ACTION_COMPLETE` / `ACTION_RESET` requests as JSON text frames, and
//! delivers binary audio frames plus JSON status frames (`ready`,
//! `heartbeat`, `final`, failures, subtitle results) which are dispatched to
//! the owning listener. Cancelling a session takes hundreds of
//! milliseconds server-side, which is why the stage above keeps a pre-warmed
//! spare.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::json;
use sha1::Sha1;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::{SynthesisListener, TtsConfig, TtsError};
use crate::util::unix_millis;

const TTS_HOST: &str = "tts.cloud.tencent.com";
const TTS_PATH: &str = "/stream_wsv2";
const TTS_ACTION: &str = "TextToStreamAudioWSv2";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type HmacSha1 = Hmac<Sha1>;

pub struct FlowingSynthesizer {
    config: TtsConfig,
    session_id: String,
    listener: Arc<dyn SynthesisListener>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    ready_rx: watch::Receiver<bool>,
    ready_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    closed_tx: watch::Sender<bool>,
    shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl FlowingSynthesizer {
    pub fn new(
        config: TtsConfig,
        session_id: impl Into<String>,
        listener: Arc<dyn SynthesisListener>,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            session_id: session_id.into(),
            listener,
            outgoing: Mutex::new(None),
            ready_rx,
            ready_tx,
            closed_rx,
            closed_tx,
            shutdown,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    fn build_websocket_url(&self) -> Result<String, TtsError> {
        if self.config.secret_id.is_empty() || self.config.secret_key.is_empty() {
            return Err(TtsError::Configuration(
                "secret_id and secret_key are required".to_string(),
            ));
        }

        let timestamp = unix_millis() / 1000;
        let mut params: Vec<(&str, String)> = vec![
            ("Action", TTS_ACTION.to_string()),
            ("AppId", self.config.app_id.to_string()),
            ("SecretId", self.config.secret_id.clone()),
            ("ModelType", "1".to_string()),
            ("VoiceType", self.config.voice_type.to_string()),
            ("Codec", self.config.codec.clone()),
            ("SampleRate", self.config.sample_rate.to_string()),
            ("Speed", self.config.speed.to_string()),
            ("Volume", self.config.volume.to_string()),
            ("SessionId", self.session_id.clone()),
            ("EnableSubtitle", self.config.enable_subtitle.to_string()),
            ("Timestamp", timestamp.to_string()),
            ("Expired", (timestamp + 24 * 60 * 60).to_string()),
        ];
        params.sort_by(|a, b| a.0.cmp(b.0));

        // The signature covers the unescaped sorted query string.
        let sign_query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let sign_input = format!("GET{TTS_HOST}{TTS_PATH}?{sign_query}");
        let mut mac = HmacSha1::new_from_slice(self.config.secret_key.as_bytes())
            .map_err(|e| TtsError::Configuration(e.to_string()))?;
        mac.update(sign_input.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let escaped_query = params
            .iter()
            .map(|(k, v)| {
                let k: String = url::form_urlencoded::byte_serialize(k.as_bytes()).collect();
                let v: String = url::form_urlencoded::byte_serialize(v.as_bytes()).collect();
                format!("{k}={v}")
            })
            .collect::<Vec<_>>()
            .join("&");
        let signature: String = url::form_urlencoded::byte_serialize(signature.as_bytes()).collect();

        Ok(format!(
            "wss://{TTS_HOST}{TTS_PATH}?{escaped_query}&Signature={signature}"
        ))
    }

    /// Connect and spawn the session task.
    pub async fn start(&self) -> Result<(), TtsError> {
        let ws_url = self.build_websocket_url()?;
        debug!("synthesizer {}: connecting", self.session_id);

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&ws_url))
            .await
            .map_err(|_| TtsError::ConnectionFailed("connection timeout".to_string()))?
            .map_err(|e| TtsError::ConnectionFailed(e.to_string()))?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        *self.outgoing.lock() = Some(outgoing_tx);

        let listener = Arc::clone(&self.listener);
        let ready_tx = self.ready_tx.clone();
        let closed_tx = self.closed_tx.clone();
        let session_id = self.session_id.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let (mut ws_sink, mut ws_stream) = ws_stream.split();
            loop {
                tokio::select! {
                    message = outgoing_rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(e) = ws_sink.send(message).await {
                            error!("synthesizer {session_id}: send failed: {e}");
                            break;
                        }
                    }
                    message = ws_stream.next() => {
                        match message {
                            Some(Ok(Message::Binary(audio))) => listener.on_audio(&audio),
                            Some(Ok(Message::Text(text))) => {
                                if handle_status_frame(&session_id, text.as_str(), &listener, &ready_tx) {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                if !e.to_string().contains("close") {
                                    warn!("synthesizer {session_id}: read error: {e}");
                                }
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            let _ = closed_tx.send(true);
            debug!("synthesizer {session_id}: session task finished");
        });

        self.listener.on_start(&self.session_id);
        Ok(())
    }

    fn send(&self, action: &str, data: &str) -> Result<(), TtsError> {
        let guard = self.outgoing.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(TtsError::NotReady("session not started".to_string()));
        };
        let message = json!({
            "session_id": self.session_id,
            "message_id": format!("{}", unix_millis()),
            "action": action,
            "data": data,
        });
        tx.send(Message::Text(message.to_string().into()))
            .map_err(|_| TtsError::Network("session task gone".to_string()))
    }

    /// Queue text for synthesis (or a reset/keep-alive token).
    pub fn process(&self, text: &str, action: &str) -> Result<(), TtsError> {
        debug!("synthesizer {}: {action} {text:?}", self.session_id);
        self.send(action, text)
    }

    /// Flush the session.
    pub fn complete(&self) -> Result<(), TtsError> {
        self.send(super::ACTION_COMPLETE, "")
    }

    /// Wait until the server signals `ready`, up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready_rx.clone();
        tokio::time::timeout(timeout, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Wait for the session task to finish, up to `timeout`.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut rx = self.closed_rx.clone();
        tokio::time::timeout(timeout, async {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    return true;
                }
            }
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Close the session. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        *self.outgoing.lock() = None;
    }
}

/// Returns true when the session is finished.
fn handle_status_frame(
    session_id: &str,
    text: &str,
    listener: &Arc<dyn SynthesisListener>,
    ready_tx: &watch::Sender<bool>,
) -> bool {
    let response: serde_json::Value = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            warn!("synthesizer {session_id}: unparseable frame: {e}");
            return false;
        }
    };

    if response.get("code").and_then(|c| c.as_i64()).unwrap_or(0) != 0 {
        error!("synthesizer {session_id}: server failure: {response}");
        listener.on_fail(&response);
        return true;
    }
    if response.get("final").and_then(|f| f.as_i64()) == Some(1) {
        info!("synthesizer {session_id}: received FINAL frame");
        listener.on_end();
        return true;
    }
    if response.get("ready").and_then(|r| r.as_i64()) == Some(1) {
        info!("synthesizer {session_id}: received READY frame");
        let _ = ready_tx.send(true);
        return false;
    }
    if response.get("heartbeat").and_then(|h| h.as_i64()) == Some(1) {
        return false;
    }
    if let Some(result) = response.get("result") {
        let has_subtitles = result
            .get("subtitles")
            .and_then(|s| s.as_array())
            .is_some_and(|s| !s.is_empty());
        if has_subtitles {
            listener.on_text(&response);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NullListener {
        ends: AtomicUsize,
        fails: AtomicUsize,
    }

    impl SynthesisListener for NullListener {
        fn on_audio(&self, _audio: &[u8]) {}
        fn on_end(&self) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
        fn on_fail(&self, _response: &serde_json::Value) {
            self.fails.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn null_listener() -> Arc<NullListener> {
        Arc::new(NullListener {
            ends: AtomicUsize::new(0),
            fails: AtomicUsize::new(0),
        })
    }

    #[test]
    fn signed_url_is_sorted_and_signed() {
        let listener = null_listener();
        let synth = FlowingSynthesizer::new(
            TtsConfig {
                app_id: 42,
                secret_id: "sid".to_string(),
                secret_key: "skey".to_string(),
                ..Default::default()
            },
            "session-1",
            listener,
        );
        let url = synth.build_websocket_url().unwrap();
        assert!(url.starts_with("wss://tts.cloud.tencent.com/stream_wsv2?"));
        assert!(url.contains("Action=TextToStreamAudioWSv2"));
        assert!(url.contains("SessionId=session-1"));
        assert!(url.contains("&Signature="));
        let a = url.find("Action=").unwrap();
        let c = url.find("Codec=").unwrap();
        let v = url.find("VoiceType=").unwrap();
        assert!(a < c && c < v);
    }

    #[test]
    fn ready_and_final_frames_drive_state() {
        let listener = null_listener();
        let dyn_listener: Arc<dyn SynthesisListener> = listener.clone();
        let (ready_tx, ready_rx) = watch::channel(false);

        assert!(!handle_status_frame("s", r#"{"ready":1}"#, &dyn_listener, &ready_tx));
        assert!(*ready_rx.borrow());

        assert!(!handle_status_frame("s", r#"{"heartbeat":1}"#, &dyn_listener, &ready_tx));
        assert!(handle_status_frame("s", r#"{"final":1}"#, &dyn_listener, &ready_tx));
        assert_eq!(listener.ends.load(Ordering::SeqCst), 1);

        assert!(handle_status_frame(
            "s",
            r#"{"code":10001,"message":"quota"}"#,
            &dyn_listener,
            &ready_tx
        ));
        assert_eq!(listener.fails.load(Ordering::SeqCst), 1);
    }
}
