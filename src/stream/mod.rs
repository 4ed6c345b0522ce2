//! Sources and sinks at the edges of the pipeline: WebRTC track adapters,
//! a file-backed source for tests, and a WAV dumper for offline inspection.

pub mod file_source;
pub mod wav_dumper;
pub mod webrtc_sink;
pub mod webrtc_source;

pub use file_source::FileSource;
pub use wav_dumper::WavDumper;
pub use webrtc_sink::WebRtcSink;
pub use webrtc_source::WebRtcSource;
