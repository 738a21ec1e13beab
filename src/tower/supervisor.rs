//! External MP3 encoder process lifecycle.
//!
//! Owns the ffmpeg-compatible child (PCM on stdin, MP3 on stdout), a
//! dedicated stdin writer thread, a stdout drain thread and a stderr
//! reader. A control thread walks the state machine
//! STOPPED -> STARTING -> BOOTING -> RUNNING and applies the bounded
//! restart backoff on stalls and exits. When the schedule is exhausted the
//! supervisor parks in FAILED until reset.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::audio::frame::frame_duration;
use crate::audio::{FrameRingBuffer, Mp3Packetizer};
use crate::tower::drain::{drain_stdout, DrainSignals};

/// Consecutive-restart backoff schedule.
const RESTART_BACKOFF: [Duration; 5] = [
    Duration::from_millis(100),
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

const MONITOR_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Booting,
    Running,
    Restarting,
    Failed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Stopped => "STOPPED",
            SupervisorState::Starting => "STARTING",
            SupervisorState::Booting => "BOOTING",
            SupervisorState::Running => "RUNNING",
            SupervisorState::Restarting => "RESTARTING",
            SupervisorState::Failed => "FAILED",
        }
    }
}

pub struct EncoderSupervisor {
    encoder_bin: String,
    stall_threshold: Duration,
    /// PCM frames queued for the encoder's stdin.
    downstream: Arc<FrameRingBuffer>,
    /// Complete MP3 frames drained from the encoder's stdout.
    mp3_buffer: Arc<FrameRingBuffer>,

    state: Arc<Mutex<SupervisorState>>,
    spawned_at: Arc<Mutex<Option<Instant>>>,
    shutdown: Arc<AtomicBool>,
    reset_requested: Arc<AtomicBool>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl EncoderSupervisor {
    pub fn new(
        encoder_bin: String,
        stall_threshold: Duration,
        downstream: Arc<FrameRingBuffer>,
        mp3_buffer: Arc<FrameRingBuffer>,
    ) -> Self {
        Self {
            encoder_bin,
            stall_threshold,
            downstream,
            mp3_buffer,
            state: Arc::new(Mutex::new(SupervisorState::Stopped)),
            spawned_at: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
            reset_requested: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// When the current encoder instance was spawned. Used by the grace
    /// window.
    pub fn spawned_at(&self) -> Option<Instant> {
        *self.spawned_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Leave FAILED and try the spawn loop again from a fresh backoff.
    pub fn reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Start the control thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.control.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return;
        }
        let supervisor = Arc::clone(self);
        *guard = Some(
            std::thread::Builder::new()
                .name("encoder-supervisor".into())
                .spawn(move || supervisor.control_loop())
                .expect("failed to spawn supervisor thread"),
        );
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self
            .control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.set_state(SupervisorState::Stopped);
    }

    fn set_state(&self, next: SupervisorState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            tracing::info!(from = state.as_str(), to = next.as_str(), "encoder supervisor");
            *state = next;
        }
    }

    fn control_loop(self: Arc<Self>) {
        let mut consecutive_failures: usize = 0;

        while !self.shutdown.load(Ordering::SeqCst) {
            self.set_state(SupervisorState::Starting);
            let mut instance = match EncoderInstance::spawn(
                &self.encoder_bin,
                self.stall_threshold,
                Arc::clone(&self.downstream),
                Arc::clone(&self.mp3_buffer),
            ) {
                Ok(instance) => instance,
                Err(e) => {
                    tracing::error!("failed to spawn encoder: {e}");
                    if self.backoff_or_fail(&mut consecutive_failures) {
                        continue;
                    }
                    return;
                }
            };

            *self.spawned_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            self.set_state(SupervisorState::Booting);

            // Monitor the instance until stall, exit, or shutdown.
            let outcome = self.monitor(&mut instance, &mut consecutive_failures);
            instance.teardown();

            match outcome {
                MonitorOutcome::Shutdown => return,
                MonitorOutcome::StallOrExit => {
                    self.set_state(SupervisorState::Restarting);
                    if !self.backoff_or_fail(&mut consecutive_failures) {
                        return;
                    }
                }
            }
        }
    }

    fn monitor(
        &self,
        instance: &mut EncoderInstance,
        consecutive_failures: &mut usize,
    ) -> MonitorOutcome {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return MonitorOutcome::Shutdown;
            }

            // First MP3 frame observed: liveness proven.
            if self.state() == SupervisorState::Booting {
                if instance.signals.saw_output() {
                    self.set_state(SupervisorState::Running);
                    *consecutive_failures = 0;
                } else if self
                    .spawned_at()
                    .map(|t| t.elapsed() > self.stall_threshold)
                    .unwrap_or(false)
                {
                    // Alive but never produced a first frame.
                    tracing::warn!("encoder produced no output while booting");
                    return MonitorOutcome::StallOrExit;
                }
            }

            if let Some(status) = instance.try_wait() {
                tracing::warn!(%status, "encoder process exited");
                return MonitorOutcome::StallOrExit;
            }

            if instance.signals.stalled() {
                tracing::warn!("encoder stall reported by drain");
                return MonitorOutcome::StallOrExit;
            }

            // A stdin write blocked past the stall threshold counts too.
            if let Some(started) = instance.write_in_flight() {
                if started.elapsed() > self.stall_threshold {
                    tracing::warn!("encoder stdin write timed out");
                    return MonitorOutcome::StallOrExit;
                }
            }

            std::thread::sleep(MONITOR_TICK);
        }
    }

    /// Sleep out the next backoff slot. Returns false when the supervisor
    /// should stop retrying (shutdown). Exhausted schedules park in
    /// FAILED until reset or shutdown.
    fn backoff_or_fail(&self, consecutive_failures: &mut usize) -> bool {
        *consecutive_failures += 1;

        if *consecutive_failures > RESTART_BACKOFF.len() {
            self.set_state(SupervisorState::Failed);
            tracing::error!(
                attempts = *consecutive_failures,
                "encoder restart schedule exhausted, entering FAILED"
            );
            while !self.shutdown.load(Ordering::SeqCst) {
                if self.reset_requested.swap(false, Ordering::SeqCst) {
                    *consecutive_failures = 0;
                    return true;
                }
                std::thread::sleep(MONITOR_TICK);
            }
            return false;
        }

        let delay = RESTART_BACKOFF[*consecutive_failures - 1];
        tracing::info!(attempt = *consecutive_failures, ?delay, "encoder restart backoff");
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            std::thread::sleep(MONITOR_TICK.min(delay));
        }
        true
    }
}

enum MonitorOutcome {
    Shutdown,
    StallOrExit,
}

/// One spawned encoder process plus its reader/writer threads.
struct EncoderInstance {
    child: Child,
    signals: Arc<DrainSignals>,
    stop: Arc<AtomicBool>,
    write_started: Arc<Mutex<Option<Instant>>>,
    threads: Vec<JoinHandle<()>>,
}

impl EncoderInstance {
    fn spawn(
        encoder_bin: &str,
        stall_threshold: Duration,
        downstream: Arc<FrameRingBuffer>,
        mp3_buffer: Arc<FrameRingBuffer>,
    ) -> std::io::Result<Self> {
        let mut child = Command::new(encoder_bin)
            .args(encoder_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("child stdin piped");
        let stdout = child.stdout.take().expect("child stdout piped");
        let stderr = child.stderr.take().expect("child stderr piped");

        let signals = Arc::new(DrainSignals::new(stall_threshold));
        let stop = Arc::new(AtomicBool::new(false));
        let write_started: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let mut threads = Vec::new();

        // Stdin writer: one PCM frame at a time, bounded pop so shutdown
        // is observed promptly.
        {
            let stop = Arc::clone(&stop);
            let write_started = Arc::clone(&write_started);
            let mut stdin = stdin;
            threads.push(
                std::thread::Builder::new()
                    .name("encoder-stdin".into())
                    .spawn(move || {
                        while !stop.load(Ordering::SeqCst) {
                            let Some(frame) = downstream.pop(Some(frame_duration())) else {
                                continue;
                            };
                            *write_started.lock().unwrap_or_else(|e| e.into_inner()) =
                                Some(Instant::now());
                            let result = stdin.write_all(&frame);
                            *write_started.lock().unwrap_or_else(|e| e.into_inner()) = None;
                            if let Err(e) = result {
                                tracing::debug!("encoder stdin closed: {e}");
                                break;
                            }
                        }
                    })
                    .expect("failed to spawn stdin writer"),
            );
        }

        // Stdout drain: packetize and buffer MP3 frames.
        {
            let signals = Arc::clone(&signals);
            let stop = Arc::clone(&stop);
            threads.push(
                std::thread::Builder::new()
                    .name("encoder-drain".into())
                    .spawn(move || drain_stdout(stdout, mp3_buffer, signals, stop))
                    .expect("failed to spawn drain thread"),
            );
        }

        // Stderr reader: log lines, never block anything else.
        {
            threads.push(
                std::thread::Builder::new()
                    .name("encoder-stderr".into())
                    .spawn(move || {
                        for line in BufReader::new(stderr).lines() {
                            match line {
                                Ok(line) if !line.trim().is_empty() => {
                                    tracing::debug!(target: "encoder", "{line}");
                                }
                                Ok(_) => {}
                                Err(_) => break,
                            }
                        }
                    })
                    .expect("failed to spawn stderr reader"),
            );
        }

        Ok(Self {
            child,
            signals,
            stop,
            write_started,
            threads,
        })
    }

    fn try_wait(&mut self) -> Option<std::process::ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    fn write_in_flight(&self) -> Option<Instant> {
        *self.write_started.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Kill the child and join all instance threads.
    fn teardown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.child.kill();
        let _ = self.child.wait();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn encoder_args() -> Vec<&'static str> {
    vec![
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "s16le",
        "-ar",
        "48000",
        "-ac",
        "2",
        "-i",
        "pipe:0",
        "-f",
        "mp3",
        "-b:a",
        "128k",
        "-ar",
        "48000",
        "pipe:1",
    ]
}

/// One-shot encoder invocation used to pre-synthesize cached fallback MP3
/// frames at startup: feed `pcm`, collect stdout, packetize, return a
/// frame from the middle of the run (clear of any leading Xing header).
pub fn synthesize_mp3_frame(encoder_bin: &str, pcm: &[u8]) -> Option<Bytes> {
    let mut child = Command::new(encoder_bin)
        .args(encoder_args())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let mut stdin = child.stdin.take()?;
    let pcm_owned = pcm.to_vec();
    let writer = std::thread::spawn(move || {
        let _ = stdin.write_all(&pcm_owned);
        // Dropping stdin closes the pipe so the encoder flushes and exits.
    });

    let stdout = child.stdout.take()?;
    let mut packetizer = Mp3Packetizer::new();
    let mut frames = Vec::new();
    let mut reader = BufReader::new(stdout);
    loop {
        let chunk = match reader.fill_buf() {
            Ok([]) => break,
            Ok(chunk) => chunk.to_vec(),
            Err(_) => break,
        };
        reader.consume(chunk.len());
        frames.extend(packetizer.feed(&chunk));
    }

    let _ = writer.join();
    let _ = child.wait();

    if frames.is_empty() {
        return None;
    }
    frames.get(frames.len() / 2).cloned()
}
