use std::collections::HashMap;

use bytes::Bytes;

/// Latency bookkeeping for one stage's handling of one turn.
///
/// Timestamps are unix milliseconds; `end_ms == 0` means the stage has not
/// finished its work for the turn yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnMetric {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TurnMetric {
    pub fn latency_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// A single encoded audio frame plus its RTP timestamp.
///
/// The payload is opaque to the pipeline: Opus on the wire-facing edges, raw
/// PCM bytes when a file source stands in for the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub payload: Bytes,
    pub timestamp: u32,
}

impl AudioFrame {
    pub fn new(payload: impl Into<Bytes>, timestamp: u32) -> Self {
        Self {
            payload: payload.into(),
            timestamp,
        }
    }
}

/// Payload variants flowing between stages.
///
/// Every stage declares which variants it accepts; anything else goes through
/// the uniform unsupported-payload error path and never panics.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketPayload {
    /// Raw bytes (e.g. synthesized PCM straight from the TTS service).
    Raw(Vec<u8>),
    /// Interleaved signed 16-bit PCM samples.
    Pcm(Vec<i16>),
    /// Encoded audio frame with an RTP timestamp.
    Audio(AudioFrame),
    /// UTF-8 text (ASR results, LLM chunks).
    Text(String),
    /// No payload; used by control packets.
    Empty,
}

impl PacketPayload {
    /// Short variant name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            PacketPayload::Raw(_) => "raw",
            PacketPayload::Pcm(_) => "pcm",
            PacketPayload::Audio(_) => "audio",
            PacketPayload::Text(_) => "text",
            PacketPayload::Empty => "empty",
        }
    }
}

/// Control commands carried by packets. Commands travel the same queues as
/// data so their ordering relative to in-flight packets is the queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PacketCommand {
    #[default]
    None,
    /// Barge-in: every stage applies its local interrupt effect and forwards.
    Interrupt,
}

/// The unit of work flowing on every edge of the stage graph.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub payload: PacketPayload,
    /// Monotonic per-producer sequence; diagnostic only.
    pub seq: u64,
    /// Name of the producing stage; diagnostic only.
    pub src: String,
    /// The turn this packet belongs to. Central to stale-data discard.
    pub turn_seq: u64,
    pub command: PacketCommand,
    /// Per-stage latency spans keyed by `<stage>_<seq>`.
    pub metrics: HashMap<String, TurnMetric>,
    /// Keys inserted into `metrics`, preserving visitation order.
    pub metric_keys: Vec<String>,
}

impl Default for PacketPayload {
    fn default() -> Self {
        PacketPayload::Empty
    }
}

impl Packet {
    /// A plain data packet with no provenance attached.
    pub fn data(payload: PacketPayload, turn_seq: u64) -> Self {
        Self {
            payload,
            turn_seq,
            ..Default::default()
        }
    }

    /// An interrupt command packet for `turn_seq`.
    pub fn interrupt(turn_seq: u64) -> Self {
        Self {
            payload: PacketPayload::Empty,
            turn_seq,
            command: PacketCommand::Interrupt,
            ..Default::default()
        }
    }

    /// Record a latency span under `key`, keeping `metric_keys` ordered.
    pub fn push_metric(&mut self, key: impl Into<String>, metric: TurnMetric) {
        let key = key.into();
        if !self.metrics.contains_key(&key) {
            self.metric_keys.push(key.clone());
        }
        self.metrics.insert(key, metric);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_packet_carries_turn_and_command() {
        let packet = Packet::interrupt(7);
        assert_eq!(packet.turn_seq, 7);
        assert_eq!(packet.command, PacketCommand::Interrupt);
        assert_eq!(packet.payload, PacketPayload::Empty);
    }

    #[test]
    fn push_metric_preserves_key_order() {
        let mut packet = Packet::data(PacketPayload::Empty, 0);
        packet.push_metric("asr_0", TurnMetric { start_ms: 1, end_ms: 5 });
        packet.push_metric("llm_0", TurnMetric { start_ms: 5, end_ms: 9 });
        packet.push_metric("asr_0", TurnMetric { start_ms: 2, end_ms: 6 });

        assert_eq!(packet.metric_keys, vec!["asr_0", "llm_0"]);
        assert_eq!(packet.metrics["asr_0"].latency_ms(), 4);
    }
}
