//! Canonical PCM frame format.
//!
//! The only unit crossing the Station -> Tower bridge: 1024 samples,
//! 2 channels, 16-bit signed little-endian at 48 kHz. Exactly 4096 bytes,
//! 1024/48000 s (~21.333 ms) of audio.

use std::time::Duration;

use bytes::Bytes;

pub const PCM_SAMPLE_RATE: u32 = 48_000;
pub const PCM_CHANNELS: usize = 2;
pub const BYTES_PER_SAMPLE: usize = 2;
pub const FRAME_SAMPLES: usize = 1024;
pub const FRAME_BYTES: usize = FRAME_SAMPLES * PCM_CHANNELS * BYTES_PER_SAMPLE;

/// Duration of one canonical PCM frame.
pub fn frame_duration() -> Duration {
    Duration::from_secs_f64(FRAME_SAMPLES as f64 / PCM_SAMPLE_RATE as f64)
}

/// One frame of digital silence.
pub fn silence_frame() -> Bytes {
    static SILENCE: [u8; FRAME_BYTES] = [0u8; FRAME_BYTES];
    Bytes::from_static(&SILENCE)
}

/// A structurally valid, silent MPEG-1 Layer III frame: 128 kbps at 48 kHz,
/// stereo, 384 bytes. Used as the MP3 frame of last resort when no encoder
/// output and no cached fallback frame exists.
pub fn synthetic_silent_mp3_frame() -> Bytes {
    // 144 * 128000 / 48000 = 384 bytes, no padding.
    let mut frame = vec![0u8; 384];
    frame[0] = 0xFF;
    frame[1] = 0xFB; // MPEG-1, Layer III, no CRC
    frame[2] = 0x94; // 128 kbps, 48 kHz, no padding
    frame[3] = 0x64; // joint stereo
    Bytes::from(frame)
}
