//! MP3 frame extraction from a raw encoder byte stream.
//!
//! Stateful across calls, stateless to callers: feed arbitrary chunks,
//! receive only complete MPEG-1 Layer III frames, byte-for-byte identical
//! to the input. Frame size is recomputed per header, so VBR streams work.

use bytes::Bytes;

/// MPEG-1 Layer III bitrate table (kbps), indexed by the 4-bit header
/// field. Zero marks free/reserved entries.
const BITRATE_KBPS: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];

/// MPEG-1 sample rate table (Hz), indexed by the 2-bit header field.
const SAMPLE_RATE_HZ: [u32; 4] = [44_100, 48_000, 32_000, 0];

/// Internal buffer cap. When exceeded the oldest bytes are discarded so a
/// later sync word stays reachable.
const MAX_BUFFER: usize = 64 * 1024;

pub struct Mp3Packetizer {
    buffer: Vec<u8>,
}

impl Default for Mp3Packetizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Mp3Packetizer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed raw bytes, returning every complete frame now available.
    /// Never returns partial frames; malformed input is skipped by
    /// resynchronizing on the next sync word.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if data.is_empty() && self.buffer.is_empty() {
            return frames;
        }

        self.buffer.extend_from_slice(data);
        if self.buffer.len() > MAX_BUFFER {
            let excess = self.buffer.len() - MAX_BUFFER;
            self.buffer.drain(..excess);
        }

        loop {
            let Some(sync) = find_sync(&self.buffer) else {
                // Keep the last 2 bytes in case a sync word is split
                // across chunks.
                if self.buffer.len() > 2 {
                    let keep = self.buffer.len() - 2;
                    self.buffer.drain(..keep);
                }
                return frames;
            };

            if sync > 0 {
                self.buffer.drain(..sync);
            }

            if self.buffer.len() < 4 {
                return frames;
            }

            let Some(frame_size) = frame_size(&self.buffer[..4]) else {
                // Invalid header behind a sync pattern: drop one byte and
                // scan again.
                self.buffer.drain(..1);
                continue;
            };

            if self.buffer.len() < frame_size {
                return frames;
            }

            let frame: Vec<u8> = self.buffer.drain(..frame_size).collect();
            frames.push(Bytes::from(frame));
        }
    }

    /// Discard any accumulated partial state, e.g. across encoder
    /// restarts.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn is_sync(b1: u8, b2: u8) -> bool {
    b1 == 0xFF && (b2 & 0xE0) == 0xE0
}

fn find_sync(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(2)
        .position(|pair| is_sync(pair[0], pair[1]))
}

/// Parse a 4-byte header, returning the frame length. `None` when the
/// header is not a valid MPEG-1 Layer III frame start.
fn frame_size(header: &[u8]) -> Option<usize> {
    if header.len() < 4 || !is_sync(header[0], header[1]) {
        return None;
    }

    let version_bits = (header[1] >> 3) & 0x03;
    let layer_bits = (header[1] >> 1) & 0x03;
    if version_bits != 0x03 || layer_bits != 0x01 {
        return None;
    }

    let bitrate_index = ((header[2] >> 4) & 0x0F) as usize;
    let sample_rate_index = ((header[2] >> 2) & 0x03) as usize;
    let padding = ((header[2] >> 1) & 0x01) as u32;

    let bitrate = BITRATE_KBPS[bitrate_index] * 1000;
    let sample_rate = SAMPLE_RATE_HZ[sample_rate_index];
    if bitrate == 0 || sample_rate == 0 {
        return None;
    }

    let size = (144 * bitrate / sample_rate + padding) as usize;
    if size < 4 {
        return None;
    }
    Some(size)
}
