//! Chat completion stage.
//!
//! A text packet for turn `T` appends a user message to the bounded history
//! and starts a detached streaming task, so the worker loop (and therefore
//! barge-in handling) never waits on the network. Each received chunk is
//! forwarded as a text packet still stamped with `T`; when the stage's
//! current turn moves past `T` the task drops the stream, which cancels the
//! underlying request.

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{ChatClient, ChatMessage};
use crate::pipeline::{
    BaseStage, Packet, PacketCommand, PacketPayload, Stage, TurnMetric, forward_interrupt,
};
use crate::util::unix_millis;

pub const DEFAULT_MAX_HISTORY: usize = 10;

struct LlmInner {
    client: Arc<dyn ChatClient>,
    history: Mutex<Vec<ChatMessage>>,
    max_history: usize,
}

pub struct LlmStage {
    base: Arc<BaseStage>,
    inner: Arc<LlmInner>,
}

impl LlmStage {
    pub fn new(client: Arc<dyn ChatClient>, max_history: usize) -> Arc<Self> {
        let base = BaseStage::new("OpenAIChat", 100);
        let inner = Arc::new(LlmInner {
            client,
            history: Mutex::new(Vec::new()),
            max_history: max_history.max(2),
        });

        base.register_command_handler(
            PacketCommand::Interrupt,
            Arc::new(|base, packet| forward_interrupt(base, packet)),
        );

        {
            let inner = Arc::clone(&inner);
            base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    let PacketPayload::Text(text) = &packet.payload else {
                        base.handle_unsupported(&packet.payload);
                        return;
                    };
                    if text.trim().is_empty() {
                        debug!("{}: ignoring empty text input", base.name());
                        return;
                    }
                    info!(
                        "{}: turn_seq={} text={text:?}",
                        base.name(),
                        packet.turn_seq
                    );
                    LlmInner::start_completion(&inner, &base, text.clone(), packet);
                })
            }));
        }

        Arc::new(Self { base, inner })
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.inner.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }
}

impl Stage for LlmStage {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }
}

impl LlmInner {
    fn push_bounded(&self, message: ChatMessage) {
        let mut history = self.history.lock();
        while history.len() >= self.max_history {
            history.remove(0);
        }
        history.push(message);
    }

    /// Spawn the streaming reader for one request.
    fn start_completion(inner: &Arc<LlmInner>, base: &Arc<BaseStage>, text: String, packet: Packet) {
        inner.push_bounded(ChatMessage::user(text));
        let messages = inner.history.lock().clone();

        let inner = Arc::clone(inner);
        let base = Arc::clone(base);
        let turn_seq = packet.turn_seq;
        tokio::spawn(async move {
            let started = Instant::now();
            let start_ms = unix_millis();

            let mut stream = match inner.client.stream_chat(&messages).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("{}: completion request failed: {e}", base.name());
                    base.record_error(e);
                    return;
                }
            };

            let mut full_response = String::new();
            let mut first_token: Option<Instant> = None;
            let mut completed = true;

            while let Some(item) = stream.next().await {
                if turn_seq < base.cur_turn_seq() {
                    info!(
                        "{}: aborting stream for superseded turn {} (cur {})",
                        base.name(),
                        turn_seq,
                        base.cur_turn_seq()
                    );
                    completed = false;
                    break;
                }
                match item {
                    Ok(content) => {
                        if content.is_empty() {
                            continue;
                        }
                        first_token.get_or_insert_with(Instant::now);
                        full_response.push_str(&content);

                        let mut chunk = Packet {
                            payload: PacketPayload::Text(content),
                            seq: base.next_seq(),
                            src: base.name().to_string(),
                            turn_seq,
                            command: PacketCommand::None,
                            metrics: packet.metrics.clone(),
                            metric_keys: packet.metric_keys.clone(),
                        };
                        chunk.push_metric(
                            format!("{}_{turn_seq}", base.name()),
                            TurnMetric {
                                start_ms,
                                end_ms: unix_millis(),
                            },
                        );
                        base.forward_packet(chunk);
                    }
                    Err(e) => {
                        warn!("{}: stream error: {e}", base.name());
                        base.record_error(e);
                        completed = false;
                        break;
                    }
                }
            }

            if completed && !full_response.is_empty() {
                info!(
                    "{}: turn {} complete, first_token={:?} total={:?}",
                    base.name(),
                    turn_seq,
                    first_token.map(|t| t.duration_since(started)),
                    started.elapsed()
                );
                inner.push_bounded(ChatMessage::assistant(full_response));
            }
        });
    }
}
