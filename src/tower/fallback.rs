//! Fallback PCM source: file -> tone -> silence.
//!
//! Selection happens once at construction; failures only ever downgrade
//! (a broken file source permanently becomes the tone, a broken tone
//! becomes silence). `next_frame()` is O(1), allocation-free for the file
//! path, and never blocks.

use std::f64::consts::PI;
use std::path::Path;

use bytes::Bytes;

use crate::audio::decode;
use crate::audio::frame::{
    silence_frame, FRAME_BYTES, FRAME_SAMPLES, PCM_SAMPLE_RATE,
};

/// ~43 ms equal-power crossfade between loop tail and head.
const CROSSFADE_SAMPLES: usize = 2048;

const TONE_FREQUENCY: f64 = 440.0;
const TONE_AMPLITUDE: f64 = 32767.0 * 0.8;
const PHASE_INCREMENT: f64 = 2.0 * PI * TONE_FREQUENCY / PCM_SAMPLE_RATE as f64;

enum Source {
    /// Pre-decoded, crossfaded loop, chopped into canonical frames.
    File { frames: Vec<Bytes>, index: usize },
    /// Phase-continuous 440 Hz sine.
    Tone { phase: f64 },
    Silence,
}

pub struct FallbackSource {
    source: Source,
}

impl FallbackSource {
    /// Build the source, trying the configured file first.
    pub fn new(file_path: Option<&Path>) -> Self {
        let source = match file_path {
            Some(path) => match Self::load_file(path) {
                Ok(frames) => {
                    tracing::info!(
                        path = %path.display(),
                        frames = frames.len(),
                        "fallback file loaded"
                    );
                    Source::File { frames, index: 0 }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "fallback file unavailable, using tone: {e}");
                    Source::Tone { phase: 0.0 }
                }
            },
            None => Source::Tone { phase: 0.0 },
        };
        Self { source }
    }

    /// A source that skips straight to the tone.
    pub fn tone() -> Self {
        Self {
            source: Source::Tone { phase: 0.0 },
        }
    }

    fn load_file(path: &Path) -> crate::error::Result<Vec<Bytes>> {
        let mut samples = decode::decode_file(path)?;
        apply_loop_crossfade(&mut samples, CROSSFADE_SAMPLES);

        let pcm = decode::samples_to_s16le(&samples);
        let frames: Vec<Bytes> = pcm
            .chunks_exact(FRAME_BYTES)
            .map(|chunk| Bytes::copy_from_slice(chunk))
            .collect();

        if frames.is_empty() {
            return Err(crate::error::AppError::Decode(format!(
                "fallback file too short for one frame: {}",
                path.display()
            )));
        }
        Ok(frames)
    }

    /// Produce the next canonical PCM frame. Always succeeds.
    pub fn next_frame(&mut self) -> Bytes {
        match &mut self.source {
            Source::File { frames, index } => {
                let frame = frames[*index].clone();
                *index = (*index + 1) % frames.len();
                frame
            }
            Source::Tone { phase } => match tone_frame(phase) {
                Ok(frame) => frame,
                Err(()) => {
                    tracing::warn!("tone generation failed, downgrading to silence");
                    self.source = Source::Silence;
                    silence_frame()
                }
            },
            Source::Silence => silence_frame(),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self.source {
            Source::File { .. } => "file",
            Source::Tone { .. } => "tone",
            Source::Silence => "silence",
        }
    }
}

/// Equal-power crossfade of the loop seam: the first `fade` stereo sample
/// pairs are blended with the last `fade`, and the tail is cut so the loop
/// point is seamless.
fn apply_loop_crossfade(samples: &mut Vec<f32>, fade: usize) {
    let channels = crate::audio::frame::PCM_CHANNELS;
    let total_frames = samples.len() / channels;
    if total_frames < fade * 3 {
        return;
    }

    let tail_start = (total_frames - fade) * channels;
    for i in 0..fade {
        let t = i as f64 / fade as f64;
        let gain_head = (t * PI / 2.0).sin() as f32;
        let gain_tail = (t * PI / 2.0).cos() as f32;
        for ch in 0..channels {
            let head = samples[i * channels + ch];
            let tail = samples[tail_start + i * channels + ch];
            samples[i * channels + ch] = head * gain_head + tail * gain_tail;
        }
    }
    samples.truncate(tail_start);
}

fn tone_frame(phase: &mut f64) -> Result<Bytes, ()> {
    if !PHASE_INCREMENT.is_finite() || PHASE_INCREMENT <= 0.0 {
        return Err(());
    }

    let mut frame = Vec::with_capacity(FRAME_BYTES);
    let mut local_phase = *phase;
    for _ in 0..FRAME_SAMPLES {
        let value = (TONE_AMPLITUDE * local_phase.sin()) as i16;
        let sample = value.to_le_bytes();
        // Same value on both channels.
        frame.extend_from_slice(&sample);
        frame.extend_from_slice(&sample);
        local_phase += PHASE_INCREMENT;
    }

    // Persist the accumulator once per frame, wrapped to [0, 2pi).
    *phase = (*phase + PHASE_INCREMENT * FRAME_SAMPLES as f64) % (2.0 * PI);
    Ok(Bytes::from(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(frame: &Bytes, index: usize) -> i16 {
        let offset = index * 4; // left channel of stereo pair
        i16::from_le_bytes([frame[offset], frame[offset + 1]])
    }

    #[test]
    fn tone_frames_are_canonical_size() {
        let mut source = FallbackSource::tone();
        assert_eq!(source.next_frame().len(), FRAME_BYTES);
    }

    #[test]
    fn tone_is_phase_continuous_across_frames() {
        let mut source = FallbackSource::tone();
        let first = source.next_frame();
        let second = source.next_frame();

        // The first sample of frame two must continue the sine from the
        // last sample of frame one: predicted from the phase increment.
        let expected = (TONE_AMPLITUDE
            * ((FRAME_SAMPLES as f64 * PHASE_INCREMENT) % (2.0 * PI)).sin())
            as i16;
        let got = sample_at(&second, 0);
        assert!(
            (expected as i32 - got as i32).abs() <= 1,
            "expected ~{expected}, got {got}"
        );
        // And it must differ from a phase reset.
        assert_ne!(sample_at(&first, 0), sample_at(&second, 0));
    }

    #[test]
    fn missing_file_downgrades_to_tone() {
        let mut source = FallbackSource::new(Some(Path::new("/nope/missing.mp3")));
        assert_eq!(source.describe(), "tone");
        assert_eq!(source.next_frame().len(), FRAME_BYTES);
    }

    #[test]
    fn crossfade_trims_tail_and_keeps_loop_length_frame_aligned_input() {
        let mut samples: Vec<f32> = (0..48_000 * 2).map(|i| (i % 7) as f32 / 7.0).collect();
        let before = samples.len();
        apply_loop_crossfade(&mut samples, 2048);
        assert_eq!(samples.len(), before - 2048 * 2);
    }

    #[test]
    fn short_buffers_are_left_alone() {
        let mut samples = vec![0.1f32; 1024];
        apply_loop_crossfade(&mut samples, 2048);
        assert_eq!(samples.len(), 1024);
    }
}
