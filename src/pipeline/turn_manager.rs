//! Turn boundary detection and interrupt broadcast.
//!
//! The turn manager translates incremental ASR text and asynchronous barge-in
//! signals into a sequence of turns identified by `turn_seq`. A turn is the
//! unit of work the downstream LLM → TTS path commits audio to; when a turn
//! is superseded, the interrupt packet emitted here makes every downstream
//! stage discard in-flight work for it.
//!
//! Interrupts ride the same queues as data. Any packet queued before the
//! interrupt is dequeued first and rejected by the stale-data filter once the
//! interrupt advances the stage's current turn, so no extra synchronization
//! (and no propagation delay) is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::packet::{Packet, PacketCommand, PacketPayload, TurnMetric};
use super::stage::{BaseStage, Stage};
use crate::util::unix_millis;

/// What ended a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptType {
    #[default]
    None,
    /// External barge-in (user spoke over the agent, admin action).
    Command,
    /// End-of-sentence punctuation, silence timeout, or max duration.
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Active,
    Pending,
    Complete,
    Interrupted,
}

/// Bookkeeping for one turn.
#[derive(Debug, Clone)]
pub struct TurnInfo {
    pub turn_seq: u64,
    pub start_time: Instant,
    pub last_update: Instant,
    pub text: String,
    pub state: TurnState,
    pub interrupt_type: InterruptType,
}

impl TurnInfo {
    fn active(turn_seq: u64) -> Self {
        let now = Instant::now();
        Self {
            turn_seq,
            start_time: now,
            last_update: now,
            text: String::new(),
            state: TurnState::Active,
            interrupt_type: InterruptType::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnManagerConfig {
    /// No ASR update for this long closes the current sentence.
    pub silence_timeout: Duration,
    /// Hard cap on a single turn.
    pub max_turn_duration: Duration,
    /// Reserved; the close predicate uses punctuation, not length.
    pub min_sentence_length: usize,
    /// Characters that close a sentence.
    pub punctuation_marks: Vec<char>,
}

impl Default for TurnManagerConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(2),
            max_turn_duration: Duration::from_secs(30),
            min_sentence_length: 4,
            punctuation_marks: vec!['。', '？', '！', '.', '?', '!'],
        }
    }
}

struct TurnManagerState {
    current_turn: Option<TurnInfo>,
    previous_turn: Option<TurnInfo>,
    sentence_buffer: String,
    last_update: Instant,
}

pub struct TurnManager {
    base: Arc<BaseStage>,
    state: Arc<Mutex<TurnManagerState>>,
    config: TurnManagerConfig,
    semantic_interrupt: Arc<AtomicBool>,
}

impl TurnManager {
    pub fn new(config: TurnManagerConfig) -> Arc<Self> {
        let base = BaseStage::new("TurnManager", 100);
        // The manager assigns turn sequences; upstream stages stamp packets
        // with their own counters, which must never gate input here.
        base.set_ignore_turn(true);
        let state = Arc::new(Mutex::new(TurnManagerState {
            current_turn: None,
            previous_turn: None,
            sentence_buffer: String::new(),
            last_update: Instant::now(),
        }));
        let semantic_interrupt = Arc::new(AtomicBool::new(true));

        {
            let state = Arc::clone(&state);
            let config = config.clone();
            let semantic_interrupt = Arc::clone(&semantic_interrupt);
            base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
                let state = Arc::clone(&state);
                let config = config.clone();
                let broadcast = semantic_interrupt.load(Ordering::Relaxed);
                Box::pin(async move {
                    match packet.payload {
                        PacketPayload::Text(_) => {
                            handle_asr_text(&base, &state, &config, broadcast, packet)
                        }
                        // Anything that is not recognized text passes through.
                        _ => base.forward_packet(packet),
                    }
                })
            }));
        }

        {
            let state = Arc::clone(&state);
            base.register_command_handler(
                PacketCommand::Interrupt,
                Arc::new(move |base, packet| handle_command_interrupt(base, &state, packet)),
            );
        }

        Arc::new(Self {
            base,
            state,
            config,
            semantic_interrupt,
        })
    }

    pub fn config(&self) -> &TurnManagerConfig {
        &self.config
    }

    /// Enable or disable the semantic (sentence-boundary) interrupt
    /// broadcast. Turn closure itself is unaffected.
    pub fn set_semantic_interrupt(&self, enabled: bool) {
        self.semantic_interrupt.store(enabled, Ordering::Relaxed);
    }

    pub fn current_turn(&self) -> Option<TurnInfo> {
        self.state.lock().current_turn.clone()
    }

    pub fn previous_turn(&self) -> Option<TurnInfo> {
        self.state.lock().previous_turn.clone()
    }
}

impl Stage for TurnManager {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }
}

fn handle_asr_text(
    base: &Arc<BaseStage>,
    state: &Mutex<TurnManagerState>,
    config: &TurnManagerConfig,
    broadcast_interrupt: bool,
    mut packet: Packet,
) {
    let PacketPayload::Text(text) = &packet.payload else {
        return;
    };

    let mut state = state.lock();
    let now = Instant::now();
    // Idle time is measured against the previous update so a long silence
    // closes the turn on the input that follows it.
    let idle = now.duration_since(state.last_update);
    state.last_update = now;
    let metric_start = unix_millis();

    state.sentence_buffer.push_str(text);

    if !should_close_turn(&state, config, idle) {
        return;
    }

    let turn_seq = base.incr_turn_seq();
    info!(
        "TurnManager: closing turn, new seq={}, text={:?}",
        turn_seq, state.sentence_buffer
    );

    // The semantic interrupt goes out first so every downstream stage adopts
    // the new turn before the sentence that opens it arrives.
    if broadcast_interrupt {
        base.forward_packet(Packet::interrupt(turn_seq));
    }

    if !state.sentence_buffer.is_empty() {
        let seq = base.next_seq();
        packet.push_metric(
            format!("{}_{}", base.name(), seq),
            TurnMetric {
                start_ms: metric_start,
                end_ms: unix_millis(),
            },
        );
        let sentence = Packet {
            payload: PacketPayload::Text(state.sentence_buffer.clone()),
            seq,
            src: base.name().to_string(),
            turn_seq,
            command: PacketCommand::None,
            metrics: packet.metrics,
            metric_keys: packet.metric_keys,
        };
        base.forward_packet(sentence);
    }

    begin_turn(&mut state, turn_seq, InterruptType::Semantic);
}

fn handle_command_interrupt(base: &Arc<BaseStage>, state: &Mutex<TurnManagerState>, _packet: Packet) {
    let turn_seq = base.incr_turn_seq();
    debug!("TurnManager: command interrupt, new seq={turn_seq}");

    // Command interrupts always propagate; only the semantic broadcast is
    // switchable.
    base.forward_packet(Packet::interrupt(turn_seq));

    let mut state = state.lock();
    if !state.sentence_buffer.is_empty() {
        let sentence = Packet {
            payload: PacketPayload::Text(state.sentence_buffer.clone()),
            seq: base.next_seq(),
            src: base.name().to_string(),
            turn_seq,
            ..Default::default()
        };
        base.forward_packet(sentence);
    }

    begin_turn(&mut state, turn_seq, InterruptType::Command);
}

fn should_close_turn(state: &TurnManagerState, config: &TurnManagerConfig, idle: Duration) -> bool {
    if state
        .sentence_buffer
        .chars()
        .any(|c| config.punctuation_marks.contains(&c))
    {
        return true;
    }
    if idle > config.silence_timeout {
        return true;
    }
    if let Some(turn) = &state.current_turn {
        if turn.start_time.elapsed() > config.max_turn_duration {
            return true;
        }
    }
    false
}

fn begin_turn(state: &mut TurnManagerState, turn_seq: u64, cause: InterruptType) {
    if let Some(mut finished) = state.current_turn.take() {
        finished.state = match cause {
            InterruptType::Command => TurnState::Interrupted,
            _ => TurnState::Complete,
        };
        finished.interrupt_type = cause;
        finished.text = std::mem::take(&mut state.sentence_buffer);
        finished.last_update = Instant::now();
        state.previous_turn = Some(finished);
    } else {
        state.sentence_buffer.clear();
    }
    state.current_turn = Some(TurnInfo::active(turn_seq));
}
