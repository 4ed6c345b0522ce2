//! Passthrough stage that mirrors PCM traffic into a WAV file.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::pipeline::{
    BaseStage, Packet, PacketCommand, PacketPayload, Stage, forward_interrupt,
};
use crate::util::le_bytes_to_pcm;

type Writer = hound::WavWriter<BufWriter<File>>;

pub struct WavDumper {
    base: Arc<BaseStage>,
    writer: Arc<Mutex<Option<Writer>>>,
}

impl WavDumper {
    pub fn new(
        path: impl AsRef<Path>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Arc<Self>, hound::Error> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(hound::Error::IoError)?;
            }
        }
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = Arc::new(Mutex::new(Some(hound::WavWriter::create(path, spec)?)));

        let base = BaseStage::new("WavDumper", 100);
        base.register_command_handler(
            PacketCommand::Interrupt,
            Arc::new(|base, packet| forward_interrupt(base, packet)),
        );

        {
            let writer = Arc::clone(&writer);
            base.set_process(Arc::new(move |base: Arc<BaseStage>, packet: Packet| {
                let writer = Arc::clone(&writer);
                Box::pin(async move {
                    let samples: Vec<i16> = match &packet.payload {
                        PacketPayload::Pcm(samples) => samples.clone(),
                        PacketPayload::Raw(bytes) => le_bytes_to_pcm(bytes),
                        other => {
                            base.handle_unsupported(other);
                            return;
                        }
                    };
                    if let Some(writer) = writer.lock().as_mut() {
                        for sample in &samples {
                            if let Err(e) = writer.write_sample(*sample) {
                                warn!("{}: failed to write WAV sample: {e}", base.name());
                                base.record_error(e);
                                break;
                            }
                        }
                    }
                    base.forward_packet(packet);
                })
            }));
        }

        Ok(Arc::new(Self { base, writer }))
    }
}

#[async_trait::async_trait]
impl Stage for WavDumper {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }

    async fn stop(&self) {
        self.base.stop();
        if let Some(writer) = self.writer.lock().take() {
            if let Err(e) = writer.finalize() {
                warn!("WavDumper: failed to finalize file: {e}");
            }
        }
    }
}
