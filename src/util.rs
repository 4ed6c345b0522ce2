//! Small helpers shared across stages.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock unix milliseconds, saturating at 0 before the epoch.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Interleaved i16 PCM to little-endian bytes.
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Little-endian byte pairs to interleaved i16 PCM. A trailing odd byte is
/// ignored.
pub fn le_bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
