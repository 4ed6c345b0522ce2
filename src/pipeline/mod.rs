//! The streaming media pipeline: packet model, stage framework, turn
//! management, and the assembler that wires and supervises a stage graph.

pub mod packet;
pub mod stage;
pub mod turn_manager;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub use packet::{AudioFrame, Packet, PacketCommand, PacketPayload, TurnMetric};
pub use stage::{
    BaseStage, CommandHandler, PacketQueue, ProcessFn, Stage, StageError, StageHealth, StageState,
    forward_interrupt,
};
pub use turn_manager::{InterruptType, TurnInfo, TurnManager, TurnManagerConfig, TurnState};

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// An ordered stage graph plus its audio source.
///
/// The pipeline owns wiring (`connect`), lifecycle (`start`/`stop`) and a
/// periodic health sweep that logs one consolidated line per interval. The
/// source is wired to the first stage but started by whoever owns the media
/// (the WebRTC connection starts it when the remote track arrives; tests
/// start file sources directly).
pub struct Pipeline {
    source: Option<Arc<dyn Stage>>,
    stages: Vec<Arc<dyn Stage>>,
    shutdown: broadcast::Sender<()>,
    health_interval: Duration,
    last_health: Arc<Mutex<HashMap<String, StageHealth>>>,
    stopped: AtomicBool,
}

impl Pipeline {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            source: None,
            stages: Vec::new(),
            shutdown,
            health_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            last_health: Arc::new(Mutex::new(HashMap::new())),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_source(source: Arc<dyn Stage>) -> Self {
        let mut pipeline = Self::new();
        pipeline.source = Some(source);
        pipeline
    }

    pub fn set_source(&mut self, source: Arc<dyn Stage>) {
        self.source = Some(source);
    }

    pub fn set_health_check_interval(&mut self, interval: Duration) {
        self.health_interval = interval;
    }

    /// Wire the source to the first stage and each stage to the next.
    pub fn connect(&mut self, stages: Vec<Arc<dyn Stage>>) -> Result<(), StageError> {
        if stages.is_empty() {
            return Err(StageError::NotConfigured(
                "Pipeline".into(),
                "no stages to connect".into(),
            ));
        }
        let source = self.source.as_ref().ok_or_else(|| {
            StageError::NotConfigured("Pipeline".into(), "no source stage set".into())
        })?;

        info!("initializing pipeline with {} stages", stages.len());
        source.connect(stages[0].as_ref());
        for pair in stages.windows(2) {
            pair[0].connect(pair[1].as_ref());
        }
        self.stages = stages;
        Ok(())
    }

    /// Start every stage in order. On the first failure all stages (and the
    /// source) are stopped and the error propagates to the caller, which
    /// tears down the connection.
    pub async fn start(&self) -> Result<(), StageError> {
        if self.stages.is_empty() {
            return Err(StageError::NotConfigured(
                "Pipeline".into(),
                "no stages connected".into(),
            ));
        }

        for (idx, stage) in self.stages.iter().enumerate() {
            if let Err(e) = stage.start().await {
                error!("failed to start stage {}: {e}", stage.name());
                if let Some(source) = &self.source {
                    source.stop().await;
                }
                for started in &self.stages[..idx] {
                    started.stop().await;
                }
                return Err(e);
            }
            info!("started stage: {}", stage.name());
        }

        self.spawn_health_monitor();
        Ok(())
    }

    /// Inject a data packet at the head of the graph, non-blockingly.
    pub fn process(&self, payload: PacketPayload) {
        self.inject(Packet::data(payload, 0));
    }

    /// Inject a command interrupt at the head of the graph. The turn manager
    /// assigns the real sequence, so callers normally pass 0.
    pub fn send_interrupt(&self, turn_seq: u64) {
        self.inject(Packet::interrupt(turn_seq));
    }

    fn inject(&self, packet: Packet) {
        let Some(first) = self.stages.first() else {
            return;
        };
        let Some(queue) = first.input_queue() else {
            warn!("Pipeline: first stage has no input queue, dropping packet");
            return;
        };
        if queue.try_push(packet).is_err() {
            error!("Pipeline: first stage input queue full, dropping packet");
        }
    }

    /// Stop the health monitor, the source, and every stage. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        if let Some(source) = &self.source {
            source.stop().await;
        }
        for stage in &self.stages {
            stage.stop().await;
        }
    }

    pub fn stage_health(&self, name: &str) -> Option<StageHealth> {
        self.last_health.lock().get(name).cloned()
    }

    pub fn all_health(&self) -> HashMap<String, StageHealth> {
        self.last_health.lock().clone()
    }

    fn spawn_health_monitor(&self) {
        let stages = self.stages.clone();
        let last_health = Arc::clone(&self.last_health);
        let interval = self.health_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = ticker.tick() => sweep(&stages, &last_health),
                }
            }
        });
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// One health sweep: per-stage summary, state transitions, and drop deltas,
/// emitted as a single log record.
fn sweep(stages: &[Arc<dyn Stage>], last_health: &Mutex<HashMap<String, StageHealth>>) {
    let mut summary = Vec::with_capacity(stages.len());
    let mut transitions = Vec::new();
    let mut dropped = Vec::new();

    let mut last = last_health.lock();
    for stage in stages {
        let health = stage.health();
        let name = stage.name();

        if let Some(prev) = last.get(name) {
            if prev.state != health.state {
                transitions.push(format!("{name}:{}->{}", prev.state, health.state));
            }
            if health.dropped > prev.dropped {
                dropped.push(format!("{name}:+{}", health.dropped - prev.dropped));
            }
        } else if health.state != StageState::Initial {
            transitions.push(format!("{name}:Initial->{}", health.state));
        }

        summary.push(format!(
            "[{name}]: state={} in={} out={} proc={} drop={} err={}",
            health.state,
            health.input_depth,
            health.output_depth,
            health.processed,
            health.dropped,
            health.last_error.is_some(),
        ));
        last.insert(name.to_string(), health);
    }
    drop(last);

    let mut parts = vec![format!("stages:\n{}", summary.join("\n"))];
    if !transitions.is_empty() {
        parts.push(format!("state changes:\n{}", transitions.join("\n")));
    }
    if !dropped.is_empty() {
        parts.push(format!("dropped:\n{}", dropped.join("\n")));
    }
    info!("pipeline stats:\n{}", parts.join("\n\n"));
}
