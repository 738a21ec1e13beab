//! The audio pump, Tower's sole metronome.
//!
//! A single thread ticking at the PCM cadence (1024/48000 s). Each tick
//! calls [`EncoderManager::pump_tick`] and nothing else: no routing, no
//! buffer reads, no supervisor calls. Scheduled on absolute tick times;
//! when it falls behind it resyncs to now instead of bursting catch-up
//! frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::audio::frame::frame_duration;
use crate::tower::encoder_manager::EncoderManager;

pub struct AudioPump {
    encoder_manager: Arc<EncoderManager>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPump {
    pub fn new(encoder_manager: Arc<EncoderManager>) -> Self {
        Self {
            encoder_manager,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(&self.encoder_manager);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("audio-pump".into())
            .spawn(move || run(manager, running))
            .expect("failed to spawn audio pump");
        *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::info!("audio pump started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        tracing::info!("audio pump stopped");
    }
}

fn run(manager: Arc<EncoderManager>, running: Arc<AtomicBool>) {
    let tick = frame_duration();
    let mut next_tick = Instant::now();
    let mut lag_logged = false;

    while running.load(Ordering::SeqCst) {
        manager.pump_tick();

        next_tick += tick;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
            lag_logged = false;
        } else {
            // Behind schedule: resync instead of emitting catch-up frames.
            if !lag_logged {
                tracing::warn!("audio pump behind schedule, resyncing");
                lag_logged = true;
            }
            next_tick = now;
        }
    }
}
