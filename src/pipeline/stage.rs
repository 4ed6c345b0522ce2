//! Packet-stage framework.
//!
//! A stage owns a bounded inbound queue and a bounded outbound queue and runs
//! one worker task that dequeues a packet, processes it, and enqueues zero or
//! more packets. Stages never call each other synchronously: adjacency is
//! expressed only by sharing queues, so the producer's outbound queue *is*
//! the consumer's inbound queue and neither holds the other.
//!
//! The worker loop applies a uniform discipline to every packet:
//!
//! 1. Command packets go to the registered command handler, which is
//!    responsible for forwarding (or not) and for local state.
//! 2. Data packets older than the stage's current turn are dropped and
//!    counted (the universal stale-data filter), unless the stage opts out
//!    with `ignore_turn`.
//! 3. Everything else reaches the stage's data handler.
//!
//! Enqueueing is always non-blocking: a full downstream queue drops the
//! packet and bumps the drop counter. Realtime media prefers recency over
//! completeness; a slow consumer must never stall its producers.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use super::packet::{Packet, PacketCommand, PacketPayload};

/// Errors surfaced by stage lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{0}: input queue not connected")]
    InputNotConnected(String),
    #[error("{0}: start failed: {1}")]
    StartFailed(String, String),
    #[error("{0}: not configured: {1}")]
    NotConfigured(String, String),
}

/// Lifecycle state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Initial,
    Starting,
    Running,
    Warning,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::Initial => "Initial",
            StageState::Starting => "Starting",
            StageState::Running => "Running",
            StageState::Warning => "Warning",
            StageState::Stopping => "Stopping",
            StageState::Stopped => "Stopped",
            StageState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Read-only health snapshot of a stage. Queue depths are sampled at
/// snapshot time.
#[derive(Debug, Clone)]
pub struct StageHealth {
    pub state: StageState,
    pub last_error: Option<String>,
    pub last_error_time: Option<SystemTime>,
    pub processed: u64,
    pub dropped: u64,
    pub input_depth: usize,
    pub output_depth: usize,
    pub start_time: SystemTime,
    pub last_update: SystemTime,
}

impl StageHealth {
    fn new() -> Self {
        let now = SystemTime::now();
        Self {
            state: StageState::Initial,
            last_error: None,
            last_error_time: None,
            processed: 0,
            dropped: 0,
            input_depth: 0,
            output_depth: 0,
            start_time: now,
            last_update: now,
        }
    }
}

/// A bounded packet queue shared between exactly one producer stage and one
/// consumer stage. The receiver half is claimed once, by the consumer's
/// worker at start.
pub struct PacketQueue {
    tx: mpsc::Sender<Packet>,
    rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    capacity: usize,
}

impl PacketQueue {
    pub fn bounded(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
        })
    }

    /// Non-blocking enqueue. Returns the packet back on a full or closed
    /// queue so the caller can count the drop.
    pub fn try_push(&self, packet: Packet) -> Result<(), Packet> {
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(p) => p,
            mpsc::error::TrySendError::Closed(p) => p,
        })
    }

    /// Claim the receiver half. Returns `None` if another worker already
    /// owns it.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Packet>> {
        self.rx.lock().take()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of packets currently buffered.
    pub fn depth(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }
}

type ProcessFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Async data handler installed by a concrete stage. The worker clones the
/// stage handle per call so the returned future owns everything it needs.
pub type ProcessFn = Arc<dyn Fn(Arc<BaseStage>, Packet) -> ProcessFuture + Send + Sync>;

/// Synchronous command handler. Handlers run on the worker task, apply the
/// stage's local effect and decide whether to forward the packet.
pub type CommandHandler = Arc<dyn Fn(&Arc<BaseStage>, Packet) + Send + Sync>;

/// Shared plumbing embedded in every stage: queues, worker lifecycle, turn
/// tracking, health, and command dispatch.
pub struct BaseStage {
    name: String,
    /// Weak self-handle so `start` can hand the worker task an owning
    /// reference.
    self_ref: std::sync::Weak<BaseStage>,
    input: Mutex<Option<Arc<PacketQueue>>>,
    output: Mutex<Arc<PacketQueue>>,
    shutdown: broadcast::Sender<()>,
    started: AtomicBool,
    stopped: AtomicBool,
    seq: AtomicU64,
    cur_turn: Arc<AtomicU64>,
    turn_start_ms: AtomicI64,
    ignore_turn: AtomicBool,
    health: Arc<RwLock<StageHealth>>,
    handlers: RwLock<HashMap<PacketCommand, CommandHandler>>,
    process: RwLock<Option<ProcessFn>>,
}

impl BaseStage {
    pub fn new(name: impl Into<String>, output_capacity: usize) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let name = name.into();
        Arc::new_cyclic(|self_ref| Self {
            name,
            self_ref: self_ref.clone(),
            input: Mutex::new(None),
            output: Mutex::new(PacketQueue::bounded(output_capacity)),
            shutdown,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            cur_turn: Arc::new(AtomicU64::new(0)),
            turn_start_ms: AtomicI64::new(0),
            ignore_turn: AtomicBool::new(false),
            health: Arc::new(RwLock::new(StageHealth::new())),
            handlers: RwLock::new(HashMap::new()),
            process: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the data handler. Done once, at stage construction.
    pub fn set_process(&self, process: ProcessFn) {
        *self.process.write() = Some(process);
    }

    /// Register a command handler. Handlers may be hot-registered at init
    /// but not swapped at runtime; dispatch takes a read lock only.
    pub fn register_command_handler(&self, command: PacketCommand, handler: CommandHandler) {
        self.handlers.write().insert(command, handler);
    }

    pub fn input_queue(&self) -> Option<Arc<PacketQueue>> {
        self.input.lock().clone()
    }

    pub fn output_queue(&self) -> Arc<PacketQueue> {
        self.output.lock().clone()
    }

    pub fn set_input_queue(&self, queue: Arc<PacketQueue>) {
        *self.input.lock() = Some(queue);
    }

    pub fn set_output_queue(&self, queue: Arc<PacketQueue>) {
        *self.output.lock() = queue;
    }

    pub fn ignore_turn(&self) -> bool {
        self.ignore_turn.load(Ordering::Relaxed)
    }

    pub fn set_ignore_turn(&self, ignore: bool) {
        self.ignore_turn.store(ignore, Ordering::Relaxed);
    }

    pub fn cur_turn_seq(&self) -> u64 {
        self.cur_turn.load(Ordering::Acquire)
    }

    pub fn set_cur_turn_seq(&self, turn_seq: u64) {
        self.cur_turn.store(turn_seq, Ordering::Release);
    }

    pub fn incr_turn_seq(&self) -> u64 {
        self.cur_turn.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Shared handle on the current turn counter, for detached tasks
    /// (encode loop, streaming readers, service listeners).
    pub fn turn_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.cur_turn)
    }

    pub fn turn_start_ms(&self) -> i64 {
        self.turn_start_ms.load(Ordering::Relaxed)
    }

    pub fn set_turn_start_ms(&self, ts: i64) {
        self.turn_start_ms.store(ts, Ordering::Relaxed);
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Shared handle on the health record, for detached tasks.
    pub fn health_handle(&self) -> Arc<RwLock<StageHealth>> {
        Arc::clone(&self.health)
    }

    /// Health snapshot with live queue depths.
    pub fn health(&self) -> StageHealth {
        let mut snapshot = self.health.read().clone();
        snapshot.input_depth = self.input.lock().as_ref().map_or(0, |q| q.depth());
        snapshot.output_depth = self.output.lock().depth();
        snapshot
    }

    pub fn set_state(&self, state: StageState) {
        let mut health = self.health.write();
        health.state = state;
        health.last_update = SystemTime::now();
    }

    pub fn record_error(&self, err: impl std::fmt::Display) {
        let mut health = self.health.write();
        health.last_error = Some(err.to_string());
        health.last_error_time = Some(SystemTime::now());
        health.last_update = SystemTime::now();
    }

    pub fn record_drop(&self) {
        let mut health = self.health.write();
        health.dropped += 1;
        health.last_update = SystemTime::now();
    }

    pub fn record_processed(&self) {
        let mut health = self.health.write();
        health.processed += 1;
        health.last_update = SystemTime::now();
    }

    /// Uniform handling for payload variants a stage does not accept:
    /// log, record, carry on.
    pub fn handle_unsupported(&self, payload: &PacketPayload) {
        let msg = format!("{}: unsupported payload variant: {}", self.name, payload.kind());
        error!("{msg}");
        self.record_error(msg);
    }

    /// Forward an existing packet downstream, dropping on a full queue.
    pub fn forward_packet(&self, packet: Packet) {
        let queue = self.output.lock().clone();
        if queue.try_push(packet).is_err() {
            warn!("{}: output queue full, dropping packet", self.name);
            self.record_drop();
        }
    }

    /// Emit a new data packet stamped with this stage's sequence and its
    /// current turn, read at send time.
    pub fn send_packet(&self, payload: PacketPayload) {
        self.send_packet_with_turn(self.cur_turn_seq(), payload);
    }

    /// Emit a new data packet stamped with an explicit turn. Detached tasks
    /// that validated a turn before producing data must use this so a
    /// concurrent interrupt cannot relabel their output as current-turn
    /// data.
    pub fn send_packet_with_turn(&self, turn_seq: u64, payload: PacketPayload) {
        let packet = Packet {
            payload,
            seq: self.next_seq(),
            src: self.name.clone(),
            turn_seq,
            ..Default::default()
        };
        self.forward_packet(packet);
    }

    /// Mark the stage started without spawning the queue worker. Sources
    /// that run their own read loop use this so `stop()` reports lifecycle
    /// states consistently.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Start the worker loop. Safe to call once; later calls are no-ops.
    pub fn start(&self) -> Result<(), StageError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let Some(input) = self.input.lock().clone() else {
            return Err(StageError::InputNotConnected(self.name.clone()));
        };
        let Some(rx) = input.take_receiver() else {
            return Err(StageError::StartFailed(
                self.name.clone(),
                "input queue receiver already claimed".into(),
            ));
        };
        let Some(stage) = self.self_ref.upgrade() else {
            return Err(StageError::StartFailed(
                self.name.clone(),
                "stage already dropped".into(),
            ));
        };
        self.set_state(StageState::Starting);
        Self::spawn_worker(stage, rx);
        Ok(())
    }

    fn spawn_worker(stage: Arc<BaseStage>, mut rx: mpsc::Receiver<Packet>) {
        let mut shutdown = stage.shutdown.subscribe();
        tokio::spawn(async move {
            stage.set_state(StageState::Running);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    packet = rx.recv() => {
                        let Some(packet) = packet else { break };
                        Self::dispatch(&stage, packet).await;
                    }
                }
            }
            stage.set_state(StageState::Stopped);
        });
    }

    async fn dispatch(stage: &Arc<BaseStage>, packet: Packet) {
        stage.record_processed();

        if packet.command != PacketCommand::None {
            let handler = stage.handlers.read().get(&packet.command).cloned();
            match handler {
                Some(handler) => handler(stage, packet),
                None => debug!("{}: no handler for {:?}, dropping", stage.name, packet.command),
            }
            return;
        }

        if !stage.ignore_turn() && packet.turn_seq < stage.cur_turn_seq() {
            debug!(
                "{}: drop stale packet turn_seq={} cur_turn_seq={}",
                stage.name,
                packet.turn_seq,
                stage.cur_turn_seq()
            );
            stage.record_drop();
            return;
        }

        let process = stage.process.read().clone();
        if let Some(process) = process {
            process(Arc::clone(stage), packet).await;
        }
    }

    /// Signal the worker (and any stage-owned tasks subscribed to the
    /// shutdown channel) to exit. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(StageState::Stopping);
        let _ = self.shutdown.send(());
        if !self.started.load(Ordering::SeqCst) {
            self.set_state(StageState::Stopped);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

/// The behavior every pipeline node exposes. Default methods delegate to the
/// embedded [`BaseStage`]; stages with external resources (sources, service
/// adapters) override `start`/`stop`.
#[async_trait]
pub trait Stage: Send + Sync {
    fn base(&self) -> &Arc<BaseStage>;

    fn name(&self) -> &str {
        self.base().name()
    }

    async fn start(&self) -> Result<(), StageError> {
        self.base().start()
    }

    async fn stop(&self) {
        self.base().stop();
    }

    fn input_queue(&self) -> Option<Arc<PacketQueue>> {
        self.base().input_queue()
    }

    fn output_queue(&self) -> Arc<PacketQueue> {
        self.base().output_queue()
    }

    fn set_input_queue(&self, queue: Arc<PacketQueue>) {
        self.base().set_input_queue(queue);
    }

    fn set_output_queue(&self, queue: Arc<PacketQueue>) {
        self.base().set_output_queue(queue);
    }

    fn health(&self) -> StageHealth {
        self.base().health()
    }

    /// Wire `next`'s inbound queue to this stage's outbound queue and hand
    /// `next` back for chaining.
    fn connect<'a>(&self, next: &'a dyn Stage) -> &'a dyn Stage {
        debug!(
            "connect stage {}[out cap: {}] to {}",
            self.name(),
            self.output_queue().capacity(),
            next.name()
        );
        next.set_input_queue(self.output_queue());
        next
    }
}

/// The standard interrupt effect shared by most stages: adopt the new turn,
/// forward the interrupt so downstream stages see it in queue order.
pub fn forward_interrupt(base: &Arc<BaseStage>, packet: Packet) {
    debug!(
        "{}: interrupt for turn {} (was {})",
        base.name(),
        packet.turn_seq,
        base.cur_turn_seq()
    );
    base.set_cur_turn_seq(packet.turn_seq);
    base.forward_packet(packet);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Passthrough {
        base: Arc<BaseStage>,
    }

    impl Passthrough {
        fn new(name: &str, capacity: usize) -> Arc<Self> {
            let base = BaseStage::new(name, capacity);
            base.set_process(Arc::new(|base: Arc<BaseStage>, packet: Packet| {
                Box::pin(async move {
                    base.forward_packet(packet);
                })
            }));
            base.register_command_handler(
                PacketCommand::Interrupt,
                Arc::new(|base, packet| forward_interrupt(base, packet)),
            );
            Arc::new(Self { base })
        }
    }

    impl Stage for Passthrough {
        fn base(&self) -> &Arc<BaseStage> {
            &self.base
        }
    }

    #[tokio::test]
    async fn stale_packets_are_dropped_after_interrupt() {
        let stage = Passthrough::new("pass", 16);
        let input = PacketQueue::bounded(16);
        stage.set_input_queue(input.clone());
        stage.start().await.unwrap();

        input.try_push(Packet::interrupt(3)).unwrap();
        input
            .try_push(Packet::data(PacketPayload::Text("old".into()), 1))
            .unwrap();
        input
            .try_push(Packet::data(PacketPayload::Text("new".into()), 3))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let out = stage.output_queue();
        let mut rx = out.take_receiver().unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.command, PacketCommand::Interrupt);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.payload, PacketPayload::Text("new".into()));
        assert!(rx.try_recv().is_err());
        assert_eq!(stage.health().dropped, 1);
    }

    #[tokio::test]
    async fn enqueue_to_full_queue_drops_instead_of_blocking() {
        let stage = Passthrough::new("tiny", 1);
        stage.base().forward_packet(Packet::data(PacketPayload::Empty, 0));
        stage.base().forward_packet(Packet::data(PacketPayload::Empty, 0));
        assert_eq!(stage.health().dropped, 1);
        assert_eq!(stage.output_queue().depth(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let stage = Passthrough::new("stoppable", 4);
        let input = PacketQueue::bounded(4);
        stage.set_input_queue(input);
        stage.start().await.unwrap();

        stage.stop().await;
        stage.stop().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stage.health().state, StageState::Stopped);
    }
}
