//! File decoding to the canonical PCM format.
//!
//! Decodes a whole asset (MP3/WAV/...) to interleaved stereo s16le at
//! 48 kHz using Symphonia, resampling and folding channels as needed.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

use crate::audio::frame::{PCM_CHANNELS, PCM_SAMPLE_RATE};
use crate::error::{AppError, Result};
use crate::models::SegmentMetadata;

/// Decode an audio file to interleaved stereo f32 samples at 48 kHz.
pub fn decode_file(path: &Path) -> Result<Vec<f32>> {
    let file = File::open(path)
        .map_err(|e| AppError::Decode(format!("failed to open {}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| AppError::Decode(format!("failed to probe {}: {e}", path.display())))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AppError::Decode(format!("no audio track in {}", path.display())))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| AppError::Decode(format!("failed to create decoder: {e}")))?;

    let source_sample_rate = codec_params.sample_rate.unwrap_or(PCM_SAMPLE_RATE);
    let source_channels = codec_params.channels.map(|c| c.count()).unwrap_or(2);

    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                tracing::warn!("error reading packet from {}: {}", path.display(), e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("error decoding packet: {}", e);
                continue;
            }
        };

        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        let packet_samples = sample_buf.samples();

        if source_channels == PCM_CHANNELS {
            samples.extend_from_slice(packet_samples);
        } else if source_channels == 1 {
            // Mono to stereo: duplicate samples.
            for &s in packet_samples {
                samples.push(s);
                samples.push(s);
            }
        } else {
            // Fold down: take the first two channels.
            for chunk in packet_samples.chunks(source_channels) {
                samples.push(chunk.first().copied().unwrap_or(0.0));
                samples.push(chunk.get(1).copied().unwrap_or(0.0));
            }
        }
    }

    if samples.is_empty() {
        return Err(AppError::Decode(format!(
            "no samples decoded from {}",
            path.display()
        )));
    }

    if source_sample_rate != PCM_SAMPLE_RATE {
        samples = resample(&samples, source_sample_rate, PCM_SAMPLE_RATE, PCM_CHANNELS);
    }

    Ok(samples)
}

/// Decode a file straight to s16le canonical bytes.
pub fn decode_file_s16le(path: &Path) -> Result<Vec<u8>> {
    let samples = decode_file(path)?;
    Ok(samples_to_s16le(&samples))
}

/// Convert interleaved f32 samples to s16le bytes.
pub fn samples_to_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Linear-interpolation resampling over interleaved sample frames.
///
/// A fractional cursor walks the input at `from/to` frames per output
/// frame; each output frame blends the two input frames the cursor sits
/// between. Good enough for speech/music assets; no filtering.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32, channels: usize) -> Vec<f32> {
    let in_frames = samples.len() / channels;
    if in_frames == 0 || from_rate == to_rate {
        return samples.to_vec();
    }

    let step = from_rate as f64 / to_rate as f64;
    let out_frames = (in_frames as f64 / step) as usize;
    let mut out = Vec::with_capacity(out_frames * channels);

    let frame_at = |index: usize| {
        let base = index.min(in_frames - 1) * channels;
        &samples[base..base + channels]
    };

    let mut cursor = 0.0f64;
    for _ in 0..out_frames {
        let lo = cursor as usize;
        let blend = (cursor - lo as f64) as f32;
        let pair = frame_at(lo).iter().zip(frame_at(lo + 1));
        out.extend(pair.map(|(&a, &b)| a + (b - a) * blend));
        cursor += step;
    }

    out
}

/// Probe display metadata without decoding audio.
pub fn probe_metadata(path: &Path) -> Result<SegmentMetadata> {
    let file = File::open(path)
        .map_err(|e| AppError::Decode(format!("failed to open {}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| AppError::Decode(format!("failed to probe {}: {e}", path.display())))?;

    let mut meta = SegmentMetadata::default();

    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL);
    if let Some(track) = track {
        if let (Some(n_frames), Some(rate)) =
            (track.codec_params.n_frames, track.codec_params.sample_rate)
        {
            if rate > 0 {
                meta.duration_sec = Some(n_frames as f64 / rate as f64);
            }
        }
    }

    let mut apply_tags = |revision: &symphonia::core::meta::MetadataRevision| {
        for tag in revision.tags() {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) => meta.title = Some(tag.value.to_string()),
                Some(StandardTagKey::Artist) => meta.artist = Some(tag.value.to_string()),
                Some(StandardTagKey::Album) => meta.album = Some(tag.value.to_string()),
                Some(StandardTagKey::Date) | Some(StandardTagKey::ReleaseDate) => {
                    if meta.year.is_none() {
                        meta.year = tag
                            .value
                            .to_string()
                            .get(..4)
                            .and_then(|y| y.parse().ok());
                    }
                }
                _ => {}
            }
        }
    };

    if let Some(container_meta) = probed.metadata.get() {
        if let Some(revision) = container_meta.current() {
            apply_tags(revision);
        }
    }
    if let Some(revision) = probed.format.metadata().current() {
        apply_tags(revision);
    }

    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s16le_conversion_clamps_and_encodes() {
        let bytes = samples_to_s16le(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(&bytes[0..2], &0i16.to_le_bytes());
        assert_eq!(&bytes[2..4], &32767i16.to_le_bytes());
        assert_eq!(&bytes[4..6], &(-32767i16).to_le_bytes());
        // Out-of-range input clamps to full scale.
        assert_eq!(&bytes[6..8], &32767i16.to_le_bytes());
    }

    #[test]
    fn resample_halves_frame_count_downsampling() {
        let input: Vec<f32> = (0..200).map(|i| (i as f32) / 200.0).collect();
        let output = resample(&input, 96_000, 48_000, 2);
        assert_eq!(output.len(), 100);
    }

    #[test]
    fn resample_preserves_constant_signal() {
        let input = vec![0.5f32; 400];
        let output = resample(&input, 44_100, 48_000, 2);
        assert!(output.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }
}
