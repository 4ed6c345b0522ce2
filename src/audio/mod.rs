//! Audio format stages: Opus decode/encode and sample-rate/channel
//! conversion.

pub mod decoder;
pub mod encoder;
pub mod resampler;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use resampler::Resampler;

/// Samples per channel in one 20 ms frame at 48 kHz.
pub const OPUS_FRAME_SAMPLES: usize = 960;

/// Errors raised while constructing audio stages.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),
    #[error("failed to create Opus coder: {0}")]
    OpusCoder(String),
    #[error("failed to create resampler: {0}")]
    ResamplerCreate(String),
}

pub(crate) fn opus_sample_rate(rate: u32) -> Result<audiopus::SampleRate, AudioError> {
    match rate {
        8_000 => Ok(audiopus::SampleRate::Hz8000),
        12_000 => Ok(audiopus::SampleRate::Hz12000),
        16_000 => Ok(audiopus::SampleRate::Hz16000),
        24_000 => Ok(audiopus::SampleRate::Hz24000),
        48_000 => Ok(audiopus::SampleRate::Hz48000),
        other => Err(AudioError::UnsupportedSampleRate(other)),
    }
}

pub(crate) fn opus_channels(channels: u16) -> Result<audiopus::Channels, AudioError> {
    match channels {
        1 => Ok(audiopus::Channels::Mono),
        2 => Ok(audiopus::Channels::Stereo),
        other => Err(AudioError::UnsupportedChannels(other)),
    }
}
