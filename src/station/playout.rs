//! Playout engine: one segment at a time, wall-clock timed.
//!
//! A dedicated thread dequeues audio events, decodes each file and
//! pushes PCM to the sink as fast as the decoder delivers, but ends the
//! segment strictly by wall clock against the nominal duration. The
//! engine never paces writes and never prefetches the next segment:
//! Tower's metronome is the only audio clock (the two-clock model).
//!
//! Observers (the DJ, the lifecycle machine, the now-playing cell) are
//! called synchronously from the playout thread: `segment_started`
//! before the first PCM write, `segment_progress` at 1 Hz,
//! `segment_finished` after the last write.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::audio::decode;
use crate::audio::frame::FRAME_BYTES;
use crate::models::AudioEvent;
use crate::station::sink::PcmSink;

const IDLE_POLL: Duration = Duration::from_millis(100);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Segment lifecycle observer. Implementations must not block; they run
/// on the playout thread.
pub trait SegmentObserver: Send + Sync {
    fn segment_started(&self, event: &AudioEvent);
    fn segment_finished(&self, event: &AudioEvent);
    fn segment_progress(&self, _event: &AudioEvent, _elapsed: Duration, _expected: Duration) {}
}

struct EventQueue {
    queue: Mutex<VecDeque<AudioEvent>>,
    available: Condvar,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    fn push_all(&self, events: Vec<AudioEvent>) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.extend(events);
        drop(queue);
        self.available.notify_all();
    }

    fn pop(&self, timeout: Duration) -> Option<AudioEvent> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(event) = queue.pop_front() {
            return Some(event);
        }
        let (mut queue, _) = self
            .available
            .wait_timeout(queue, timeout)
            .unwrap_or_else(|e| e.into_inner());
        queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}

struct TerminalFlag {
    complete: Mutex<bool>,
    signal: Condvar,
}

pub struct PlayoutEngine {
    queue: Arc<EventQueue>,
    sink: Arc<Mutex<Box<dyn PcmSink>>>,
    observers: Arc<Mutex<Vec<Arc<dyn SegmentObserver>>>>,
    draining: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    terminal: Arc<TerminalFlag>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PlayoutEngine {
    pub fn new(sink: Box<dyn PcmSink>) -> Self {
        Self {
            queue: Arc::new(EventQueue::new()),
            sink: Arc::new(Mutex::new(sink)),
            observers: Arc::new(Mutex::new(Vec::new())),
            draining: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            terminal: Arc::new(TerminalFlag {
                complete: Mutex::new(false),
                signal: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Register an observer. Call before `run`.
    pub fn add_observer(&self, observer: Arc<dyn SegmentObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Detach every observer; used when the lifecycle machine forbids
    /// further THINK/DO callbacks.
    pub fn clear_observers(&self) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Enqueue events in order. Immutable once queued.
    pub fn queue_audio(&self, events: Vec<AudioEvent>) {
        self.queue.push_all(events);
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub fn terminal_playout_complete(&self) -> bool {
        *self
            .terminal
            .complete
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Block until the terminal segment has finished or the timeout
    /// elapses. Returns whether it completed.
    pub fn wait_terminal_playout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut complete = self
            .terminal
            .complete
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while !*complete {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .terminal
                .signal
                .wait_timeout(complete, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            complete = guard;
        }
        true
    }

    /// Start the playout thread; returns immediately.
    pub fn run(&self) {
        let mut guard = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }

        let queue = Arc::clone(&self.queue);
        let sink = Arc::clone(&self.sink);
        let observers = Arc::clone(&self.observers);
        let draining = Arc::clone(&self.draining);
        let stop = Arc::clone(&self.stop);
        let terminal = Arc::clone(&self.terminal);

        *guard = Some(
            std::thread::Builder::new()
                .name("playout".into())
                .spawn(move || {
                    play_loop(queue, sink, observers, draining, stop, terminal);
                })
                .expect("failed to spawn playout thread"),
        );
        tracing::info!("playout engine started");
    }

    /// Hard stop: interrupts any in-flight wait and joins the thread.
    /// The lifecycle machine only calls this after terminal playout.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        tracing::info!("playout engine stopped");
    }

    /// Close the output sink. Call only after `stop`.
    pub fn close_sink(&self) {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).close();
    }

    /// Pop one queued event without playing it. Test-only: inspects what
    /// DO enqueued while the engine is not running.
    #[cfg(test)]
    pub fn test_pop_queued(&self) -> Option<AudioEvent> {
        self.queue.pop(Duration::from_millis(1))
    }
}

fn play_loop(
    queue: Arc<EventQueue>,
    sink: Arc<Mutex<Box<dyn PcmSink>>>,
    observers: Arc<Mutex<Vec<Arc<dyn SegmentObserver>>>>,
    draining: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    terminal: Arc<TerminalFlag>,
) {
    while !stop.load(Ordering::SeqCst) {
        let Some(event) = queue.pop(IDLE_POLL) else {
            // Idle. During draining an empty queue with nothing active
            // means the terminal segment has finished.
            if draining.load(Ordering::SeqCst) {
                let mut complete = terminal.complete.lock().unwrap_or_else(|e| e.into_inner());
                if !*complete {
                    *complete = true;
                    tracing::info!("terminal playout complete");
                }
                drop(complete);
                terminal.signal.notify_all();
            }
            continue;
        };

        play_segment(&event, &sink, &observers, &stop);
    }
}

fn notify<F: Fn(&dyn SegmentObserver)>(
    observers: &Arc<Mutex<Vec<Arc<dyn SegmentObserver>>>>,
    call: F,
) {
    let snapshot: Vec<Arc<dyn SegmentObserver>> = observers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    for observer in snapshot {
        call(observer.as_ref());
    }
}

fn play_segment(
    event: &AudioEvent,
    sink: &Arc<Mutex<Box<dyn PcmSink>>>,
    observers: &Arc<Mutex<Vec<Arc<dyn SegmentObserver>>>>,
    stop: &Arc<AtomicBool>,
) {
    tracing::info!(
        kind = event.kind.as_str(),
        path = %event.path.display(),
        "segment starting"
    );
    notify(observers, |o| o.segment_started(event));
    let segment_start = Instant::now();

    // Decode the whole segment; errors are per-segment and end it
    // cleanly so the next one can begin.
    let pcm = match decode_segment(event) {
        Ok(pcm) => pcm,
        Err(e) => {
            tracing::error!(path = %event.path.display(), "segment decode failed: {e}");
            notify(observers, |o| o.segment_finished(event));
            return;
        }
    };

    // 48 kHz stereo s16le: 192000 bytes per second.
    let decoded_duration = Duration::from_secs_f64(pcm.len() as f64 / 192_000.0);
    let expected = event.nominal_duration().unwrap_or(decoded_duration);

    // Push frames as fast as the decoder delivered them; Tower paces.
    let mut last_progress = segment_start;
    {
        let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
        for chunk in pcm.chunks(FRAME_BYTES) {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if chunk.len() == FRAME_BYTES {
                sink.write(chunk);
            } else {
                // Pad the trailing partial frame with silence.
                let mut padded = chunk.to_vec();
                padded.resize(FRAME_BYTES, 0);
                sink.write(&padded);
            }
            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                notify(observers, |o| {
                    o.segment_progress(event, segment_start.elapsed(), expected)
                });
            }
        }
    }

    // Wall-clock gate: the segment ends when its nominal duration has
    // elapsed, regardless of decoder speed or buffer depth.
    while segment_start.elapsed() < expected && !stop.load(Ordering::SeqCst) {
        let remaining = expected.saturating_sub(segment_start.elapsed());
        std::thread::sleep(remaining.min(PROGRESS_INTERVAL).max(Duration::from_millis(1)));
        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            last_progress = Instant::now();
            notify(observers, |o| {
                o.segment_progress(event, segment_start.elapsed(), expected)
            });
        }
    }

    tracing::info!(
        kind = event.kind.as_str(),
        elapsed_ms = segment_start.elapsed().as_millis() as u64,
        "segment finished"
    );
    notify(observers, |o| o.segment_finished(event));
}

fn decode_segment(event: &AudioEvent) -> crate::error::Result<Vec<u8>> {
    let mut samples = decode::decode_file(&event.path)?;
    if let Some(gain_db) = event.gain_db {
        let gain = 10f32.powf(gain_db / 20.0);
        for sample in &mut samples {
            *sample = (*sample * gain).clamp(-1.0, 1.0);
        }
    }
    Ok(decode::samples_to_s16le(&samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SegmentKind;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    /// Captures frames in memory.
    struct CaptureSink {
        frames: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl PcmSink for CaptureSink {
        fn write(&mut self, pcm: &[u8]) {
            self.frames.lock().unwrap().push(pcm.to_vec());
        }

        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct EventLog {
        entries: StdMutex<Vec<String>>,
    }

    impl SegmentObserver for EventLog {
        fn segment_started(&self, event: &AudioEvent) {
            self.entries
                .lock()
                .unwrap()
                .push(format!("started:{}", event.kind.as_str()));
        }

        fn segment_finished(&self, event: &AudioEvent) {
            self.entries
                .lock()
                .unwrap()
                .push(format!("finished:{}", event.kind.as_str()));
        }
    }

    /// Write a canonical 48 kHz stereo s16le WAV of the given length.
    fn write_wav(path: &Path, seconds: f64) {
        let sample_count = (seconds * 48_000.0) as usize;
        let data_len = sample_count * 4;
        let mut wav = Vec::with_capacity(44 + data_len);
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&2u16.to_le_bytes()); // stereo
        wav.extend_from_slice(&48_000u32.to_le_bytes());
        wav.extend_from_slice(&(48_000u32 * 4).to_le_bytes());
        wav.extend_from_slice(&4u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(data_len as u32).to_le_bytes());
        for i in 0..sample_count {
            let v = ((i % 100) as i16) << 6;
            wav.extend_from_slice(&v.to_le_bytes());
            wav.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(path, wav).unwrap();
    }

    fn engine_with_capture() -> (PlayoutEngine, Arc<StdMutex<Vec<Vec<u8>>>>) {
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let sink = CaptureSink {
            frames: Arc::clone(&frames),
        };
        (PlayoutEngine::new(Box::new(sink)), frames)
    }

    #[test]
    fn plays_a_segment_for_its_wall_clock_duration() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("clip.wav");
        write_wav(&wav, 0.3);

        let (engine, frames) = engine_with_capture();
        let log = Arc::new(EventLog::default());
        engine.add_observer(log.clone());
        engine.run();

        let started = Instant::now();
        engine.queue_audio(vec![AudioEvent::new(&wav, SegmentKind::Song)]);

        // Wait for the finish notification.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if log.entries.lock().unwrap().iter().any(|e| e.starts_with("finished")) {
                break;
            }
            assert!(Instant::now() < deadline, "segment never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        let elapsed = started.elapsed();
        engine.stop();

        // Wall-clock gate: at least the clip duration passed.
        assert!(elapsed >= Duration::from_millis(280), "elapsed {elapsed:?}");

        // Every frame written is canonical size; total covers the clip.
        let frames = frames.lock().unwrap();
        assert!(frames.iter().all(|f| f.len() == FRAME_BYTES));
        let expected_frames = (0.3_f64 * 48_000.0 / 1024.0).ceil() as usize;
        assert_eq!(frames.len(), expected_frames);

        let entries = log.entries.lock().unwrap();
        assert_eq!(entries[0], "started:song");
        assert_eq!(entries[entries.len() - 1], "finished:song");
    }

    #[test]
    fn decode_failure_ends_segment_cleanly_and_next_plays() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("broken.wav");
        std::fs::write(&bad, b"not audio at all").unwrap();
        let good = dir.path().join("good.wav");
        write_wav(&good, 0.1);

        let (engine, frames) = engine_with_capture();
        let log = Arc::new(EventLog::default());
        engine.add_observer(log.clone());
        engine.run();

        engine.queue_audio(vec![
            AudioEvent::new(&bad, SegmentKind::Song),
            AudioEvent::new(&good, SegmentKind::Announcement),
        ]);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let done = log
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.starts_with("finished"))
                .count();
            if done == 2 {
                break;
            }
            assert!(Instant::now() < deadline, "segments never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        engine.stop();

        let entries = log.entries.lock().unwrap();
        assert_eq!(
            *entries,
            vec![
                "started:song",
                "finished:song",
                "started:announcement",
                "finished:announcement"
            ]
        );
        // The broken segment wrote nothing; the good one did.
        assert!(!frames.lock().unwrap().is_empty());
    }

    #[test]
    fn draining_flips_terminal_flag_once_queue_empties() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("clip.wav");
        write_wav(&wav, 0.1);

        let (engine, _frames) = engine_with_capture();
        engine.run();
        engine.queue_audio(vec![AudioEvent::new(&wav, SegmentKind::Song)]);
        engine.set_draining(true);

        assert!(engine.wait_terminal_playout(Duration::from_secs(5)));
        assert!(engine.terminal_playout_complete());
        engine.stop();
    }

    #[test]
    fn wait_terminal_times_out_when_not_draining() {
        let (engine, _frames) = engine_with_capture();
        engine.run();
        assert!(!engine.wait_terminal_playout(Duration::from_millis(150)));
        engine.stop();
    }
}
