//! Opus decoder stage: audio-frame packets in, PCM packets out.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::{AudioError, OPUS_FRAME_SAMPLES, opus_channels, opus_sample_rate};
use crate::pipeline::{
    BaseStage, Packet, PacketCommand, PacketPayload, Stage, forward_interrupt,
};

pub struct OpusDecoder {
    base: Arc<BaseStage>,
}

impl OpusDecoder {
    /// `sample_rate`/`channels` describe the decoded output (the ingress
    /// leg uses 48 kHz stereo).
    pub fn new(sample_rate: u32, channels: u16) -> Result<Arc<Self>, AudioError> {
        let decoder =
            audiopus::coder::Decoder::new(opus_sample_rate(sample_rate)?, opus_channels(channels)?)
                .map_err(|e| AudioError::OpusCoder(e.to_string()))?;

        let base = BaseStage::new("OpusDecoder", 100);
        base.register_command_handler(
            PacketCommand::Interrupt,
            Arc::new(|base, packet| forward_interrupt(base, packet)),
        );

        let decoder = Arc::new(Mutex::new(decoder));
        let channels = channels as usize;
        base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
            let decoder = Arc::clone(&decoder);
            Box::pin(async move {
                let PacketPayload::Audio(frame) = &packet.payload else {
                    base.handle_unsupported(&packet.payload);
                    return;
                };
                // An empty payload is the codec's "no data supplied" case;
                // skip it silently.
                if frame.payload.is_empty() {
                    return;
                }

                let mut pcm = vec![0i16; OPUS_FRAME_SAMPLES * channels];
                let decoded = {
                    let mut decoder = decoder.lock();
                    decoder.decode(Some(frame.payload.as_ref()), &mut pcm, false)
                };
                match decoded {
                    Ok(samples_per_channel) => {
                        pcm.truncate(samples_per_channel * channels);
                        base.send_packet(PacketPayload::Pcm(pcm));
                    }
                    Err(e) => {
                        warn!("{}: decode failed: {e}", base.name());
                        base.record_error(e);
                    }
                }
            })
        }));

        Ok(Arc::new(Self { base }))
    }
}

impl Stage for OpusDecoder {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }
}
