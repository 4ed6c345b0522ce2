//! Streaming TTS stage with dual-synthesizer hot-swap.
//!
//! Tearing down a flowing-synthesis session and opening a fresh one costs
//! hundreds of milliseconds, so the stage keeps two sessions open and only
//! one active. A barge-in flips the active index immediately (the user hears
//! the agent stop), completes and stops the superseded session, and rebuilds
//! it in the background as the new spare. A 100 ms keep-alive sends a neutral
//! reset token to the inactive session so it does not idle out.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::synthesizer::FlowingSynthesizer;
use super::{ACTION_RESET, ACTION_SYNTHESIS, SynthesisListener, TtsConfig, TtsError};
use crate::pipeline::{
    BaseStage, Packet, PacketCommand, PacketPayload, PacketQueue, Stage, StageError, StageHealth,
};
use crate::util::unix_millis;

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);
const COMPLETE_WAIT: Duration = Duration::from_secs(3);
/// Per-turn latency records kept for observability.
const TURN_RECORDS_KEPT: usize = 10;

struct TtsInner {
    config: TtsConfig,
    synths: Mutex<[Option<Arc<FlowingSynthesizer>>; 2]>,
    /// -1 until the first interrupt; then 0 or 1.
    active_idx: Mutex<i8>,
    listener: Mutex<Option<Arc<TtsTurnListener>>>,
}

pub struct TtsStage {
    base: Arc<BaseStage>,
    inner: Arc<TtsInner>,
}

impl TtsStage {
    pub fn new(config: TtsConfig) -> Arc<Self> {
        let base = BaseStage::new("TencentStreamTTS", 100);
        let inner = Arc::new(TtsInner {
            config,
            synths: Mutex::new([None, None]),
            active_idx: Mutex::new(-1),
            listener: Mutex::new(None),
        });

        {
            let inner = Arc::clone(&inner);
            base.register_command_handler(
                PacketCommand::Interrupt,
                Arc::new(move |base, packet| {
                    info!("{}: interrupt for turn {}", base.name(), packet.turn_seq);
                    base.set_cur_turn_seq(packet.turn_seq);
                    base.forward_packet(packet);
                    TtsInner::swap_active(&inner, base);
                }),
            );
        }

        {
            let inner = Arc::clone(&inner);
            base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    inner.handle_text(&base, packet);
                })
            }));
        }

        Arc::new(Self { base, inner })
    }

    /// Which session is active: -1 before the first interrupt, else 0 or 1.
    pub fn active_idx(&self) -> i8 {
        *self.inner.active_idx.lock()
    }
}

impl TtsInner {
    fn handle_text(&self, base: &Arc<BaseStage>, packet: Packet) {
        let PacketPayload::Text(text) = &packet.payload else {
            base.handle_unsupported(&packet.payload);
            return;
        };
        if packet.turn_seq < base.cur_turn_seq() {
            info!(
                "{}: skip turn_seq={} text={text:?}",
                base.name(),
                packet.turn_seq
            );
            return;
        }

        let synth = {
            let mut active = self.active_idx.lock();
            if *active == -1 {
                *active = 0;
            }
            self.synths.lock()[*active as usize].clone()
        };
        let Some(synth) = synth else {
            base.record_error("active synthesizer not initialized");
            return;
        };

        if let Some(listener) = self.listener.lock().clone() {
            listener.reset(synth.session_id(), &packet);
        }
        if let Err(e) = synth.process(text, ACTION_SYNTHESIS) {
            warn!("{}: synthesis request failed: {e}", base.name());
            base.record_error(e);
        }
    }

    /// The interrupt effect: flip the active session and rebuild the
    /// superseded one in the background.
    fn swap_active(inner: &Arc<TtsInner>, base: &Arc<BaseStage>) {
        let stopped_idx = {
            let mut active = inner.active_idx.lock();
            // First interrupt after start: no session has been used yet, so
            // there is nothing to tear down.
            if *active == -1 {
                *active = 0;
                return;
            }
            let old_idx = *active as usize;
            let old = inner.synths.lock()[old_idx].take();
            if let Some(old) = old {
                if let Err(e) = old.complete() {
                    debug!("{}: complete on stopped session: {e}", base.name());
                }
                old.stop();
                info!("{}: closed active synthesizer idx={old_idx}", base.name());
            }
            *active = 1 - *active;
            info!("{}: switched synthesizer to {}", base.name(), *active);
            old_idx
        };

        // Pre-warm the replacement; the keep-alive no-ops for this side
        // until it is ready.
        let inner = Arc::clone(inner);
        let base = Arc::clone(base);
        tokio::spawn(async move {
            match inner.build_synthesizer(stopped_idx).await {
                Ok(synth) => {
                    inner.synths.lock()[stopped_idx] = Some(synth);
                }
                Err(e) => {
                    warn!(
                        "{}: failed to rebuild synthesizer {stopped_idx}: {e}",
                        base.name()
                    );
                    base.record_error(e);
                }
            }
        });
    }

    async fn build_synthesizer(&self, idx: usize) -> Result<Arc<FlowingSynthesizer>, TtsError> {
        let listener = self
            .listener
            .lock()
            .clone()
            .ok_or_else(|| TtsError::NotReady("listener not installed".to_string()))?;
        let session_id = format!("TTS_Flow_{idx}_{}", unix_millis());
        let synth = FlowingSynthesizer::new(self.config.clone(), session_id, listener);
        synth.start().await?;
        if !synth.wait_ready(READY_TIMEOUT).await {
            synth.stop();
            return Err(TtsError::NotReady(format!(
                "synthesizer {idx} ready timeout"
            )));
        }
        Ok(synth)
    }

    fn active_synth(&self) -> Option<Arc<FlowingSynthesizer>> {
        let active = *self.active_idx.lock();
        let idx = if active <= 0 { 0 } else { 1 };
        self.synths.lock()[idx].clone()
    }

    fn inactive_synth(&self) -> Option<Arc<FlowingSynthesizer>> {
        let active = *self.active_idx.lock();
        let idx = if active <= 0 { 1 } else { 0 };
        self.synths.lock()[idx].clone()
    }
}

#[async_trait::async_trait]
impl Stage for TtsStage {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }

    /// Open both sessions and wait for both to become ready; failure of
    /// either tears both down and fails the start.
    async fn start(&self) -> Result<(), StageError> {
        let listener = Arc::new(TtsTurnListener::new(
            self.base.name().to_string(),
            self.base.output_queue(),
            self.base.health_handle(),
            self.base.turn_counter(),
        ));
        *self.inner.listener.lock() = Some(listener);

        for idx in 0..2 {
            match self.inner.build_synthesizer(idx).await {
                Ok(synth) => self.inner.synths.lock()[idx] = Some(synth),
                Err(e) => {
                    for synth in self.inner.synths.lock().iter().flatten() {
                        synth.stop();
                    }
                    *self.inner.synths.lock() = [None, None];
                    return Err(StageError::StartFailed(
                        self.base.name().to_string(),
                        e.to_string(),
                    ));
                }
            }
        }

        self.spawn_keepalive();
        self.base.start()
    }

    async fn stop(&self) {
        // Flush the active session and give it a moment to deliver its final
        // frame before closing both sides.
        if let Some(active) = self.inner.active_synth() {
            if active.complete().is_ok() {
                active.wait_closed(COMPLETE_WAIT).await;
            }
        }
        self.base.stop();

        let synths = std::mem::replace(&mut *self.inner.synths.lock(), [None, None]);
        for synth in synths.into_iter().flatten() {
            synth.stop();
        }
    }
}

impl TtsStage {
    fn spawn_keepalive(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.base.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => {
                        if let Some(spare) = inner.inactive_synth() {
                            let _ = spare.process("。", ACTION_RESET);
                        }
                    }
                }
            }
        });
    }
}

struct ListenerState {
    session_id: String,
    turn_seq: u64,
    packet_has_first_token: bool,
    turn_started: HashMap<u64, Instant>,
    turn_first_token: HashMap<u64, Instant>,
    processed_turns: Vec<u64>,
}

/// Bridges synthesizer callbacks onto the stage's output queue and keeps the
/// per-turn latency records. Holds only queue/health/turn handles.
struct TtsTurnListener {
    name: String,
    output: Arc<PacketQueue>,
    health: Arc<RwLock<StageHealth>>,
    turn_counter: Arc<AtomicU64>,
    seq: AtomicU64,
    state: Mutex<ListenerState>,
}

impl TtsTurnListener {
    fn new(
        name: String,
        output: Arc<PacketQueue>,
        health: Arc<RwLock<StageHealth>>,
        turn_counter: Arc<AtomicU64>,
    ) -> Self {
        Self {
            name,
            output,
            health,
            turn_counter,
            seq: AtomicU64::new(0),
            state: Mutex::new(ListenerState {
                session_id: String::new(),
                turn_seq: 0,
                packet_has_first_token: false,
                turn_started: HashMap::new(),
                turn_first_token: HashMap::new(),
                processed_turns: Vec::new(),
            }),
        }
    }

    /// Per-packet bookkeeping reset, called before each synthesis request.
    fn reset(&self, session_id: &str, packet: &Packet) {
        let mut state = self.state.lock();
        state.session_id = session_id.to_string();
        state.turn_seq = packet.turn_seq;
        state.packet_has_first_token = false;
        if !state.turn_started.contains_key(&packet.turn_seq) {
            state.turn_started.insert(packet.turn_seq, Instant::now());
            info!("{}: new turn {} started", self.name, packet.turn_seq);
        }
    }

    fn cleanup_old_turns(state: &mut ListenerState) {
        if state.processed_turns.len() <= TURN_RECORDS_KEPT {
            return;
        }
        state.processed_turns.sort_unstable();
        let remove: Vec<u64> = state
            .processed_turns
            .drain(..state.processed_turns.len() - TURN_RECORDS_KEPT)
            .collect();
        for turn in remove {
            state.turn_started.remove(&turn);
            state.turn_first_token.remove(&turn);
        }
    }
}

impl SynthesisListener for TtsTurnListener {
    fn on_start(&self, session_id: &str) {
        info!("{session_id}: synthesis session started");
    }

    fn on_audio(&self, audio: &[u8]) {
        let turn_seq = {
            let mut state = self.state.lock();
            if !audio.is_empty() {
                let turn = state.turn_seq;
                if !state.turn_first_token.contains_key(&turn) {
                    let now = Instant::now();
                    state.turn_first_token.insert(turn, now);
                    if let Some(started) = state.turn_started.get(&turn) {
                        info!(
                            "{}: turn {turn} first audio token after {:?}",
                            self.name,
                            now.duration_since(*started)
                        );
                    }
                }
                state.packet_has_first_token = true;
            }
            state.turn_seq
        };

        let packet = Packet {
            payload: PacketPayload::Raw(audio.to_vec()),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            src: self.name.clone(),
            turn_seq,
            ..Default::default()
        };
        if self.output.try_push(packet).is_err() {
            warn!("{}: output queue full, dropping audio", self.name);
            self.health.write().dropped += 1;
        }
    }

    fn on_text(&self, _response: &serde_json::Value) {
        debug!("{}: text result received", self.name);
    }

    fn on_end(&self) {
        let mut state = self.state.lock();
        let turn = state.turn_seq;
        info!("{}: synthesis ended, session {}", self.name, state.session_id);

        let started = match state.turn_started.get(&turn) {
            Some(started) => *started,
            None => {
                warn!("{}: no start time recorded for turn {turn}", self.name);
                Instant::now() - Duration::from_secs(1)
            }
        };
        let total = started.elapsed();
        let first_token = state
            .turn_first_token
            .get(&turn)
            .map(|t| t.duration_since(started));
        info!(
            "{}: turn {turn} completed, total={total:?} first_token={first_token:?}",
            self.name
        );

        state.processed_turns.push(turn);
        Self::cleanup_old_turns(&mut state);

        if turn < self.turn_counter.load(Ordering::Acquire) {
            debug!("{}: turn {turn} already superseded at end", self.name);
        }
    }

    fn on_fail(&self, response: &serde_json::Value) {
        warn!("{}: synthesis failed: {response}", self.name);
        let mut health = self.health.write();
        health.last_error = Some(format!("synthesis failed: {response}"));
        health.last_error_time = Some(std::time::SystemTime::now());
    }
}
