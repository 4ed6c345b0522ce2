//! Sample-rate and channel conversion stage.
//!
//! Input accumulates until at least one 20 ms block (at the input rate) is
//! available; the stage then converts the largest whole number of blocks and
//! keeps the remainder. Channel conversion happens before rate conversion:
//! stereo→mono averages each pair with clipping, mono→stereo duplicates.
//! Rate conversion runs through `rubato::FftFixedIn` one 20 ms block at a
//! time; equal input/output rates bypass it entirely so the stage is exact
//! for pure channel conversion.

use std::sync::Arc;

use parking_lot::Mutex;
use rubato::{FftFixedIn, Resampler as _};
use tracing::warn;

use super::AudioError;
use crate::pipeline::{
    BaseStage, Packet, PacketCommand, PacketPayload, Stage, TurnMetric, forward_interrupt,
};
use crate::util::{le_bytes_to_pcm, unix_millis};

struct ResampleState {
    pending: Vec<i16>,
    fft: Option<FftFixedIn<f32>>,
}

struct ResamplerInner {
    channels_in: usize,
    channels_out: usize,
    /// Input samples (interleaved) per 20 ms block.
    block_samples: usize,
    /// Frames per 20 ms block, after channel conversion.
    block_frames: usize,
    state: Mutex<ResampleState>,
}

pub struct Resampler {
    base: Arc<BaseStage>,
}

impl Resampler {
    pub fn new(
        sample_rate_in: u32,
        sample_rate_out: u32,
        channels_in: u16,
        channels_out: u16,
    ) -> Result<Arc<Self>, AudioError> {
        if channels_in == 0 || channels_in > 2 {
            return Err(AudioError::UnsupportedChannels(channels_in));
        }
        if channels_out == 0 || channels_out > 2 {
            return Err(AudioError::UnsupportedChannels(channels_out));
        }

        let block_frames = sample_rate_in as usize / 50;
        let fft = if sample_rate_in == sample_rate_out {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    sample_rate_in as usize,
                    sample_rate_out as usize,
                    block_frames,
                    2,
                    channels_out as usize,
                )
                .map_err(|e| AudioError::ResamplerCreate(e.to_string()))?,
            )
        };

        let name = format!(
            "Resampler_{sample_rate_in}Hz_{channels_in}ch_to_{sample_rate_out}Hz_{channels_out}ch"
        );
        let base = BaseStage::new(name, 100);
        base.register_command_handler(
            PacketCommand::Interrupt,
            // The accumulator is per-sample-rate, not per-turn; stale data is
            // caught by the universal filter downstream of the update.
            Arc::new(|base, packet| forward_interrupt(base, packet)),
        );

        let inner = Arc::new(ResamplerInner {
            channels_in: channels_in as usize,
            channels_out: channels_out as usize,
            block_samples: block_frames * channels_in as usize,
            block_frames,
            state: Mutex::new(ResampleState {
                pending: Vec::new(),
                fft,
            }),
        });

        base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                inner.handle_packet(&base, packet);
            })
        }));

        Ok(Arc::new(Self { base }))
    }
}

impl Stage for Resampler {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }
}

impl ResamplerInner {
    fn handle_packet(&self, base: &Arc<BaseStage>, mut packet: Packet) {
        let metric_start = unix_millis();

        let samples: Vec<i16> = match &packet.payload {
            PacketPayload::Pcm(samples) => samples.clone(),
            PacketPayload::Raw(bytes) => le_bytes_to_pcm(bytes),
            PacketPayload::Audio(frame) => le_bytes_to_pcm(&frame.payload),
            other => {
                base.handle_unsupported(other);
                return;
            }
        };
        if samples.is_empty() {
            warn!("{}: received empty input data", base.name());
            base.record_error("received empty input data");
            return;
        }

        let mut state = self.state.lock();
        state.pending.extend_from_slice(&samples);

        let blocks = state.pending.len() / self.block_samples;
        if blocks == 0 {
            return;
        }

        let input: Vec<i16> = state.pending.drain(..blocks * self.block_samples).collect();
        let mut output = Vec::with_capacity(input.len());
        for block in input.chunks_exact(self.block_samples) {
            let converted = self.convert_channels(block);
            match self.convert_rate(&mut state, converted) {
                Ok(mut resampled) => output.append(&mut resampled),
                Err(e) => {
                    warn!("{}: resampling failed: {e}", base.name());
                    base.record_error(e);
                    return;
                }
            }
        }
        drop(state);

        let seq = base.next_seq();
        packet.push_metric(
            format!("{}_{}", base.name(), seq),
            TurnMetric {
                start_ms: metric_start,
                end_ms: unix_millis(),
            },
        );
        base.forward_packet(Packet {
            payload: PacketPayload::Pcm(output),
            seq,
            src: base.name().to_string(),
            turn_seq: base.cur_turn_seq().max(packet.turn_seq),
            command: PacketCommand::None,
            metrics: packet.metrics,
            metric_keys: packet.metric_keys,
        });
    }

    fn convert_channels(&self, block: &[i16]) -> Vec<i16> {
        if self.channels_in > self.channels_out {
            // Stereo to mono: average each (L, R) pair in normalized space
            // and clip back to i16.
            block
                .chunks_exact(2)
                .map(|pair| {
                    let left = pair[0] as f64 / 32768.0;
                    let right = pair[1] as f64 / 32768.0;
                    let mixed = (left + right) * 0.5 * 32768.0;
                    mixed.clamp(-32768.0, 32767.0) as i16
                })
                .collect()
        } else if self.channels_in < self.channels_out {
            let mut out = Vec::with_capacity(block.len() * 2);
            for &sample in block {
                out.push(sample);
                out.push(sample);
            }
            out
        } else {
            block.to_vec()
        }
    }

    /// Rate-convert one channel-converted 20 ms block.
    fn convert_rate(
        &self,
        state: &mut ResampleState,
        block: Vec<i16>,
    ) -> Result<Vec<i16>, rubato::ResampleError> {
        let Some(fft) = state.fft.as_mut() else {
            return Ok(block);
        };

        // Deinterleave into per-channel f32 buffers of block_frames each.
        let mut channels = vec![Vec::with_capacity(self.block_frames); self.channels_out];
        for frame in block.chunks_exact(self.channels_out) {
            for (ch, &sample) in frame.iter().enumerate() {
                channels[ch].push(sample as f32 / 32768.0);
            }
        }

        let resampled = fft.process(&channels, None)?;

        let out_frames = resampled[0].len();
        let mut out = Vec::with_capacity(out_frames * self.channels_out);
        for frame in 0..out_frames {
            for channel in resampled.iter() {
                let sample = (channel[frame] * 32768.0).round().clamp(-32768.0, 32767.0);
                out.push(sample as i16);
            }
        }
        Ok(out)
    }
}
