pub mod asr;
pub mod audio;
pub mod config;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod stream;
pub mod tts;
pub mod util;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::app_error::{AppError, AppResult};
pub use pipeline::{Packet, PacketCommand, PacketPayload, Pipeline, Stage};
pub use server::{AppState, WhipServer};
