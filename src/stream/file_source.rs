//! File-backed audio source for tests: plays a WAV file as 20 ms PCM frames
//! paced in real time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::pipeline::{BaseStage, PacketPayload, Stage, StageError, StageState};

const FRAME_INTERVAL: Duration = Duration::from_millis(20);

pub struct FileSource {
    base: Arc<BaseStage>,
    path: PathBuf,
    sample_rate: u32,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            base: BaseStage::new("FileSource", 100),
            path: path.into(),
            sample_rate,
        })
    }
}

#[async_trait::async_trait]
impl Stage for FileSource {
    fn base(&self) -> &Arc<BaseStage> {
        &self.base
    }

    async fn start(&self) -> Result<(), StageError> {
        let mut reader = hound::WavReader::open(&self.path).map_err(|e| {
            StageError::StartFailed(self.base.name().to_string(), e.to_string())
        })?;
        let spec = reader.spec();
        if spec.sample_rate != self.sample_rate {
            return Err(StageError::StartFailed(
                self.base.name().to_string(),
                format!(
                    "unexpected sample rate: {} (expected {})",
                    spec.sample_rate, self.sample_rate
                ),
            ));
        }

        let samples: Vec<i16> = reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| StageError::StartFailed(self.base.name().to_string(), e.to_string()))?;
        let frame_size = (spec.sample_rate as usize / 50) * spec.channels as usize;

        self.base.mark_started();
        self.base.set_state(StageState::Running);
        info!(
            "started source stage {} ({} samples)",
            self.base.name(),
            samples.len()
        );

        let base = Arc::clone(&self.base);
        let mut shutdown = self.base.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FRAME_INTERVAL);
            for chunk in samples.chunks(frame_size) {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {}
                }
                // Pad a short tail with silence so every frame is whole.
                let mut frame = chunk.to_vec();
                frame.resize(frame_size, 0);
                base.send_packet(PacketPayload::Pcm(frame));
                base.record_processed();
            }
            base.set_state(StageState::Stopped);
        });

        Ok(())
    }
}
