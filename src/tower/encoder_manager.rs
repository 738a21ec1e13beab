//! Routing heart of Tower.
//!
//! Owns the program-vs-fallback decision and nothing else does. Each
//! metronome tick feeds exactly one PCM frame to the encoder
//! ([`EncoderManager::pump_tick`]); each broadcast tick takes exactly one
//! MP3 frame out ([`EncoderManager::get_frame`]), which never returns
//! nothing: encoder output, then cached fallback MP3, in that order.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::audio::frame::{silence_frame, synthetic_silent_mp3_frame, FRAME_BYTES};
use crate::audio::{FrameRingBuffer, Mp3Packetizer, OverflowPolicy};
use crate::tower::fallback::FallbackSource;
use crate::tower::supervisor::{synthesize_mp3_frame, EncoderSupervisor, SupervisorState};

/// How long after a spawn the manager keeps serving cached silence without
/// calling it a PCM loss. At least one metronome period; we allow the
/// encoder a full second to boot.
const GRACE_WINDOW: Duration = Duration::from_secs(1);

pub struct EncoderManager {
    /// Frames arriving from the ingestor.
    upstream: Arc<FrameRingBuffer>,
    /// Frames queued for the encoder's stdin writer.
    downstream: Arc<FrameRingBuffer>,
    /// Complete MP3 frames drained from the encoder.
    mp3_buffer: Arc<FrameRingBuffer>,
    /// None in offline test mode.
    supervisor: Option<Arc<EncoderSupervisor>>,
    fallback: Mutex<FallbackSource>,

    /// Cached MP3 served during the grace window (silence).
    silence_mp3: Bytes,
    /// Cached MP3 served on output loss (tone or file audio).
    fallback_mp3: Bytes,
    /// Pre-packetized frames of the configured fallback file, used as the
    /// MP3 source in offline test mode.
    offline_frames: Vec<Bytes>,
    offline_index: AtomicUsize,

    /// Bounded wait applied to the MP3 pop on each broadcast tick.
    output_tick: Duration,

    /// True while the last pump tick forwarded live upstream PCM.
    live_input: AtomicBool,
    consecutive_loss: AtomicU64,
    loss_reported: AtomicBool,
    /// Latched by the event bus when Station announces shutdown; PCM-loss
    /// warnings are expected then and stay quiet.
    station_shutdown: Arc<AtomicBool>,
}

impl EncoderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream: Arc<FrameRingBuffer>,
        mp3_buffer: Arc<FrameRingBuffer>,
        encoder_bin: &str,
        encoder_enabled: bool,
        stall_threshold: Duration,
        output_tick: Duration,
        silence_mp3_path: Option<&Path>,
        station_shutdown: Arc<AtomicBool>,
    ) -> Self {
        // Small: frames are forwarded on the very next writer pop.
        let downstream = Arc::new(FrameRingBuffer::with_frame_size(
            10,
            OverflowPolicy::DropOldest,
            FRAME_BYTES,
        ));

        let supervisor = encoder_enabled.then(|| {
            Arc::new(EncoderSupervisor::new(
                encoder_bin.to_string(),
                stall_threshold,
                Arc::clone(&downstream),
                Arc::clone(&mp3_buffer),
            ))
        });

        let mut fallback = FallbackSource::new(silence_mp3_path);
        let silence_mp3 = Self::presynthesize(encoder_bin, encoder_enabled, || silence_frame());
        let fallback_mp3 = {
            let frame_source = &mut fallback;
            Self::presynthesize(encoder_bin, encoder_enabled, move || frame_source.next_frame())
        };
        let offline_frames = silence_mp3_path
            .map(Self::packetize_file)
            .unwrap_or_default();

        Self {
            upstream,
            downstream,
            mp3_buffer,
            supervisor,
            fallback: Mutex::new(fallback),
            silence_mp3,
            fallback_mp3,
            offline_frames,
            offline_index: AtomicUsize::new(0),
            output_tick,
            live_input: AtomicBool::new(false),
            consecutive_loss: AtomicU64::new(0),
            loss_reported: AtomicBool::new(false),
            station_shutdown,
        }
    }

    /// Feed ~1 s of PCM from `frames` through a throwaway encoder run
    /// and cache one MP3 frame; emission afterwards is an O(1) lookup.
    fn presynthesize(
        encoder_bin: &str,
        encoder_enabled: bool,
        mut frames: impl FnMut() -> Bytes,
    ) -> Bytes {
        if encoder_enabled {
            let mut pcm = Vec::with_capacity(FRAME_BYTES * 48);
            for _ in 0..48 {
                pcm.extend_from_slice(&frames());
            }
            if let Some(frame) = synthesize_mp3_frame(encoder_bin, &pcm) {
                tracing::info!(bytes = frame.len(), "MP3 frame pre-synthesized");
                return frame;
            }
            tracing::warn!("MP3 pre-synthesis failed, using synthetic silent frame");
        }
        synthetic_silent_mp3_frame()
    }

    fn packetize_file(path: &Path) -> Vec<Bytes> {
        match std::fs::read(path) {
            Ok(data) => {
                let mut packetizer = Mp3Packetizer::new();
                let frames = packetizer.feed(&data);
                tracing::info!(
                    path = %path.display(),
                    frames = frames.len(),
                    "packetized offline fallback file"
                );
                frames
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "could not read fallback file: {e}");
                Vec::new()
            }
        }
    }

    pub fn start(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.start();
        }
    }

    pub fn stop(&self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.stop();
        }
    }

    /// Enqueue one canonical PCM frame from upstream.
    pub fn write_pcm(&self, frame: Bytes) -> bool {
        self.upstream.push(frame)
    }

    /// One metronome tick: exactly one PCM frame to the encoder, live
    /// upstream audio when available, fallback otherwise.
    pub fn pump_tick(&self) {
        let (frame, live) = match self.upstream.pop(None) {
            Some(frame) => (frame, true),
            None => {
                let frame = self
                    .fallback
                    .lock()
                    .map(|mut f| f.next_frame())
                    .unwrap_or_else(|_| silence_frame());
                (frame, false)
            }
        };
        self.live_input.store(live, Ordering::Relaxed);
        self.downstream.push(frame);
    }

    /// One broadcast tick: always yields a complete MP3 frame within one
    /// tick. Never `None`, never partial.
    pub fn get_frame(&self) -> Bytes {
        let Some(supervisor) = &self.supervisor else {
            return self.offline_frame();
        };

        let state = supervisor.state();
        let in_grace = match supervisor.spawned_at() {
            Some(t) => t.elapsed() < GRACE_WINDOW,
            // Spawn still in flight counts as grace: no loss warnings
            // before the first tick can possibly have encoder output.
            None => true,
        };

        if state != SupervisorState::Running && in_grace {
            // Encoder still proving liveness: take output if it already
            // arrived, otherwise serve cached silence without raising a
            // loss.
            if let Some(frame) = self.mp3_buffer.pop(None) {
                self.note_output();
                return frame;
            }
            return self.silence_mp3.clone();
        }

        if let Some(frame) = self.mp3_buffer.pop(Some(self.output_tick)) {
            self.note_output();
            return frame;
        }

        self.note_loss();
        self.fallback_mp3.clone()
    }

    fn offline_frame(&self) -> Bytes {
        if self.offline_frames.is_empty() {
            return self.fallback_mp3.clone();
        }
        let index = self.offline_index.fetch_add(1, Ordering::Relaxed) % self.offline_frames.len();
        self.offline_frames[index].clone()
    }

    fn note_output(&self) {
        self.consecutive_loss.store(0, Ordering::Relaxed);
        self.loss_reported.store(false, Ordering::Relaxed);
    }

    fn note_loss(&self) {
        let losses = self.consecutive_loss.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.loss_reported.swap(true, Ordering::Relaxed)
            && !self.station_shutdown.load(Ordering::SeqCst)
        {
            tracing::warn!(losses, "no encoder output this tick, serving fallback MP3");
        }
    }

    /// True when the last pump tick forwarded live upstream PCM.
    pub fn live_input(&self) -> bool {
        self.live_input.load(Ordering::Relaxed)
    }

    /// True when the broadcast path is currently substituting fallback.
    pub fn fallback_active(&self) -> bool {
        self.consecutive_loss.load(Ordering::Relaxed) > 0 || !self.live_input()
    }

    pub fn encoder_enabled(&self) -> bool {
        self.supervisor.is_some()
    }

    pub fn supervisor_state(&self) -> Option<SupervisorState> {
        self.supervisor.as_ref().map(|s| s.state())
    }

    pub fn mp3_stats(&self) -> crate::audio::BufferStats {
        self.mp3_buffer.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::FRAME_BYTES;

    fn offline_manager() -> EncoderManager {
        let upstream = Arc::new(FrameRingBuffer::with_frame_size(
            8,
            OverflowPolicy::DropOldest,
            FRAME_BYTES,
        ));
        let mp3 = Arc::new(FrameRingBuffer::new(8, OverflowPolicy::DropOldest));
        EncoderManager::new(
            upstream,
            mp3,
            "ffmpeg-not-used",
            false,
            Duration::from_secs(2),
            Duration::from_millis(15),
            None,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn offline_mode_always_yields_a_valid_frame() {
        let manager = offline_manager();
        for _ in 0..3 {
            let frame = manager.get_frame();
            let mut p = Mp3Packetizer::new();
            assert_eq!(p.feed(&frame).len(), 1, "frame must packetize cleanly");
        }
    }

    #[test]
    fn pump_tick_prefers_live_pcm() {
        let manager = offline_manager();
        manager.write_pcm(Bytes::from(vec![7u8; FRAME_BYTES]));
        manager.pump_tick();
        assert!(manager.live_input());
        let fed = manager.downstream.pop(None).unwrap();
        assert_eq!(fed[0], 7);
    }

    #[test]
    fn pump_tick_substitutes_fallback_when_upstream_empty() {
        let manager = offline_manager();
        manager.pump_tick();
        assert!(!manager.live_input());
        let fed = manager.downstream.pop(None).unwrap();
        assert_eq!(fed.len(), FRAME_BYTES);
    }

    #[test]
    fn exactly_one_frame_per_pump_tick() {
        let manager = offline_manager();
        for _ in 0..5 {
            manager.pump_tick();
        }
        let mut count = 0;
        while manager.downstream.pop(None).is_some() {
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
