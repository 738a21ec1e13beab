//! Encoder stdout drain.
//!
//! Reads raw MP3 bytes from the encoder, feeds the packetizer, pushes
//! every complete frame into the MP3 ring buffer and keeps the
//! last-output timestamp the stall detector watches. The drain never
//! interprets or reorders frames.

use std::io::Read;
use std::process::ChildStdout;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::audio::{FrameRingBuffer, Mp3Packetizer};

const READ_CHUNK: usize = 4096;

/// Shared flags between the drain thread and the supervisor monitor.
pub struct DrainSignals {
    stall_threshold: Duration,
    saw_output: AtomicBool,
    stalled: AtomicBool,
    last_data: Mutex<Option<Instant>>,
}

impl DrainSignals {
    pub fn new(stall_threshold: Duration) -> Self {
        Self {
            stall_threshold,
            saw_output: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            last_data: Mutex::new(None),
        }
    }

    /// True once at least one complete MP3 frame has been produced.
    pub fn saw_output(&self) -> bool {
        self.saw_output.load(Ordering::SeqCst)
    }

    /// True once the drain saw EOF or the idle window elapsed.
    pub fn stalled(&self) -> bool {
        if self.stalled.load(Ordering::SeqCst) {
            return true;
        }
        let last = *self.last_data.lock().unwrap_or_else(|e| e.into_inner());
        match last {
            Some(t) => t.elapsed() >= self.stall_threshold,
            None => false,
        }
    }

    fn mark_output(&self) {
        self.saw_output.store(true, Ordering::SeqCst);
        *self.last_data.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn mark_stalled(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }
}

/// Blocking read loop over the encoder's stdout.
///
/// Runs on its own thread; a stall is broken by the supervisor killing
/// the process, which turns the blocking read into EOF.
pub fn drain_stdout(
    mut stdout: ChildStdout,
    mp3_buffer: Arc<FrameRingBuffer>,
    signals: Arc<DrainSignals>,
    stop: Arc<AtomicBool>,
) {
    let mut packetizer = Mp3Packetizer::new();
    let mut chunk = [0u8; READ_CHUNK];

    tracing::debug!("encoder output drain started");
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match stdout.read(&mut chunk) {
            Ok(0) => {
                tracing::warn!("encoder stdout EOF");
                signals.mark_stalled();
                break;
            }
            Ok(n) => {
                let frames = packetizer.feed(&chunk[..n]);
                if !frames.is_empty() {
                    for frame in frames {
                        mp3_buffer.push(frame);
                    }
                    signals.mark_output();
                }
            }
            Err(e) => {
                tracing::warn!("encoder stdout read error: {e}");
                signals.mark_stalled();
                break;
            }
        }
    }
    tracing::debug!("encoder output drain stopped");
}
