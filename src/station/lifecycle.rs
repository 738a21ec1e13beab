//! Station lifecycle orchestration.
//!
//! Owns the ordered startup sequence, the startup state machine
//! (BOOTSTRAP through NORMAL_OPERATION), and the two-phase shutdown:
//! DRAINING lets the current segment and one terminal segment play to
//! completion, SHUTTING_DOWN stops playout, persists DJ state and closes
//! the sink. `station_startup` and `station_shutdown` are each sent at
//! most once per process run. Signal handlers only set flags; every
//! ordering decision lives here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::json;

use crate::config::StationConfig;
use crate::error::{AppError, Result};
use crate::models::{AudioEvent, EventType, SegmentKind, TowerEvent};
use crate::station::assets::AssetDiscovery;
use crate::station::control::TowerControlClient;
use crate::station::dj::{DjEngine, DjState, StartupPlan};
use crate::station::library::MediaLibrary;
use crate::station::now_playing::NowPlayingCell;
use crate::station::playout::{PlayoutEngine, SegmentObserver};
use crate::station::rotation::RotationSelector;
use crate::station::sink::TowerPcmSink;
use crate::station::state_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    Bootstrap,
    StartupAnnouncementPlaying,
    StartupThinkComplete,
    StartupDoEnqueue,
    NormalOperation,
}

impl StartupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartupState::Bootstrap => "BOOTSTRAP",
            StartupState::StartupAnnouncementPlaying => "STARTUP_ANNOUNCEMENT_PLAYING",
            StartupState::StartupThinkComplete => "STARTUP_THINK_COMPLETE",
            StartupState::StartupDoEnqueue => "STARTUP_DO_ENQUEUE",
            StartupState::NormalOperation => "NORMAL_OPERATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    ShuttingDown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Running => "RUNNING",
            LifecycleState::Draining => "DRAINING",
            LifecycleState::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

pub struct Station {
    config: StationConfig,
    dj: Arc<DjEngine>,
    engine: Arc<PlayoutEngine>,
    control: TowerControlClient,
    now_playing: Arc<NowPlayingCell>,
    state_store: StateStore,

    startup_state: Mutex<StartupState>,
    lifecycle_state: Mutex<LifecycleState>,
    startup_event_sent: AtomicBool,
    shutdown_event_sent: AtomicBool,
    shutdown_initiated: AtomicBool,
}

impl Station {
    /// Build every component in dependency order (startup steps 1-7).
    /// Playout does not start until [`Station::start`]. Must run inside
    /// a tokio runtime (the Tower event worker is spawned here).
    pub fn new(config: StationConfig) -> Result<Arc<Self>> {
        tracing::info!("=== Station starting ===");

        let library = MediaLibrary::load(&config.music_path)?;
        let assets = AssetDiscovery::new(&config.dj_path);
        let state_store = StateStore::new(&config.dj_state_path);

        let rotation =
            RotationSelector::new(library.regular_tracks.clone(), library.holiday_tracks.clone());
        let dj = Arc::new(DjEngine::new(rotation, assets, config.legal_id_interval));

        // Warm start when a persisted state exists.
        let dj_state: Option<DjState> = state_store
            .load()
            .and_then(|value| serde_json::from_value(value).ok());
        match dj_state {
            Some(state) => {
                dj.restore(state);
                tracing::info!("warm start: DJ state restored");
            }
            None => tracing::info!("cold start: no previous state"),
        }

        let sink = TowerPcmSink::new(&config.pcm_socket_path);
        let engine = Arc::new(PlayoutEngine::new(Box::new(sink)));
        let control = TowerControlClient::spawn(config.tower_events_url());
        let now_playing = Arc::new(NowPlayingCell::new());

        let station = Arc::new(Self {
            config,
            dj,
            engine,
            control,
            now_playing,
            state_store,
            startup_state: Mutex::new(StartupState::Bootstrap),
            lifecycle_state: Mutex::new(LifecycleState::Running),
            startup_event_sent: AtomicBool::new(false),
            shutdown_event_sent: AtomicBool::new(false),
            shutdown_initiated: AtomicBool::new(false),
        });

        station.engine.add_observer(Arc::new(StationObserver {
            station: Arc::downgrade(&station),
        }));

        Ok(station)
    }

    /// Startup steps 8-10: the startup THINK, the `station_startup`
    /// event, and the (non-blocking) playout loop start.
    pub fn start(&self) -> Result<()> {
        debug_assert_eq!(*self.startup_state(), StartupState::Bootstrap);

        match self.dj.startup_think() {
            StartupPlan::Announcement(announcement) => {
                tracing::info!(
                    path = %announcement.path.display(),
                    "startup announcement selected"
                );
                self.set_startup_state(StartupState::StartupAnnouncementPlaying);
                self.engine.queue_audio(vec![announcement]);
            }
            StartupPlan::FirstSong(_) => {
                // No announcement on file: bootstrap DO enqueues the
                // first song directly.
                self.set_startup_state(StartupState::StartupDoEnqueue);
                self.dj.do_phase(&self.engine);
                self.set_startup_state(StartupState::NormalOperation);
            }
            StartupPlan::Nothing => {
                return Err(AppError::Config(
                    "startup THINK produced nothing to play".into(),
                ));
            }
        }

        // Lifecycle event goes out before playout begins so no THINK can
        // be observed ahead of it.
        self.send_lifecycle_event(EventType::StationStartup, &self.startup_event_sent);

        self.engine.run();
        tracing::info!("=== Station started ===");
        Ok(())
    }

    /// Two-phase shutdown. Idempotent: only the first call does
    /// anything.
    pub fn stop(&self) {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::warn!("shutdown already initiated, ignoring");
            return;
        }
        tracing::info!("=== Station shutting down ===");

        // Phase 1, DRAINING: current segment plays out, the terminal DO
        // may enqueue a shutdown announcement, and that plays out too.
        // Nothing is closed or cleared here.
        self.set_lifecycle_state(LifecycleState::Draining);
        self.dj.set_draining(true);
        self.engine.set_draining(true);
        self.dj.plan_shutdown_announcement();

        let timeout = self.config.shutdown_timeout;
        tracing::info!(timeout_secs = timeout.as_secs(), "waiting for terminal playout");
        if self.engine.wait_terminal_playout(timeout) {
            tracing::info!("terminal playout complete");
        } else {
            tracing::warn!("terminal playout timed out, forcing hard shutdown");
        }

        // The shutdown event follows the terminal segment, not the
        // shutdown request.
        self.send_lifecycle_event(EventType::StationShutdown, &self.shutdown_event_sent);

        // Phase 2, SHUTTING_DOWN: no THINK/DO past this point; stop
        // playout, persist, close the sink last.
        self.set_lifecycle_state(LifecycleState::ShuttingDown);
        self.now_playing.segment_finished();
        self.dj.disable();
        self.engine.clear_observers();
        self.engine.stop();
        self.persist_dj_state();
        self.engine.close_sink();
        tracing::info!("=== Station stopped ===");
    }

    fn persist_dj_state(&self) {
        let state = self.dj.to_state();
        // Merge over the previously stored envelope so fields written by
        // other versions survive.
        let mut envelope = self
            .state_store
            .load()
            .unwrap_or_else(|| json!({}));
        match serde_json::to_value(&state) {
            Ok(serde_json::Value::Object(fields)) => {
                if let Some(target) = envelope.as_object_mut() {
                    for (key, value) in fields {
                        target.insert(key, value);
                    }
                }
            }
            _ => return,
        }
        if let Err(e) = self.state_store.save(envelope) {
            tracing::error!("failed to persist DJ state: {e}");
        } else {
            tracing::info!("DJ state persisted");
        }
    }

    fn send_lifecycle_event(&self, event_type: EventType, latch: &AtomicBool) {
        if latch.swap(true, Ordering::SeqCst) {
            tracing::debug!(event = event_type.as_str(), "lifecycle event already sent");
            return;
        }
        self.control.send(TowerEvent::new(event_type, json!({})));
        tracing::info!(event = event_type.as_str(), "lifecycle event sent");
    }

    fn startup_state(&self) -> std::sync::MutexGuard<'_, StartupState> {
        self.startup_state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_startup_state(&self, next: StartupState) {
        let mut state = self.startup_state();
        if *state != next {
            tracing::info!(from = state.as_str(), to = next.as_str(), "startup state");
            *state = next;
        }
    }

    pub fn current_startup_state(&self) -> StartupState {
        *self.startup_state()
    }

    pub fn current_lifecycle_state(&self) -> LifecycleState {
        *self
            .lifecycle_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn set_lifecycle_state(&self, next: LifecycleState) {
        let mut state = self
            .lifecycle_state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if *state != next {
            tracing::info!(from = state.as_str(), to = next.as_str(), "lifecycle state");
            *state = next;
        }
    }

    pub fn now_playing(&self) -> Arc<NowPlayingCell> {
        Arc::clone(&self.now_playing)
    }

    /// Forward display metadata for the segment now on air.
    fn send_playing_event(&self, event: &AudioEvent) {
        let event_type = match event.kind {
            SegmentKind::Song => EventType::SongPlaying,
            _ => EventType::SegmentPlaying,
        };
        let meta = event.metadata.clone().unwrap_or_default();
        self.control.send(TowerEvent::new(
            event_type,
            json!({
                "segment_type": event.kind.as_str(),
                "file_path": event.path.display().to_string(),
                "title": meta.title,
                "artist": meta.artist,
                "album": meta.album,
                "year": meta.year,
                "duration_sec": meta.duration_sec,
            }),
        ));
    }

    fn is_system_announcement(event: &AudioEvent) -> bool {
        event.kind == SegmentKind::Announcement && event.intent_id.is_none()
    }

    fn observe_started(&self, event: &AudioEvent) {
        // THINK already ran for this segment (the DJ observer precedes
        // these transitions on the playout thread).
        if *self.startup_state() == StartupState::StartupAnnouncementPlaying
            && Self::is_system_announcement(event)
            && self.dj.has_intent()
        {
            self.set_startup_state(StartupState::StartupThinkComplete);
        }

        self.now_playing.segment_started(event);
        self.send_playing_event(event);
    }

    fn observe_finished(&self, event: &AudioEvent) {
        if *self.startup_state() == StartupState::StartupThinkComplete
            && Self::is_system_announcement(event)
        {
            self.set_startup_state(StartupState::StartupDoEnqueue);
        }
        self.now_playing.segment_finished();
    }

    fn observe_after_do(&self) {
        if *self.startup_state() == StartupState::StartupDoEnqueue {
            self.set_startup_state(StartupState::NormalOperation);
        }
    }
}

/// Bridges playout callbacks into the DJ engine and the lifecycle
/// bookkeeping. Holds a weak reference so shutdown can tear the graph
/// down.
struct StationObserver {
    station: Weak<Station>,
}

impl SegmentObserver for StationObserver {
    fn segment_started(&self, event: &AudioEvent) {
        let Some(station) = self.station.upgrade() else {
            return;
        };
        station.dj.think(event);
        station.observe_started(event);
    }

    fn segment_finished(&self, event: &AudioEvent) {
        let Some(station) = self.station.upgrade() else {
            return;
        };
        station.observe_finished(event);
        station.dj.do_phase(&station.engine);
        station.observe_after_do();
    }

    fn segment_progress(&self, event: &AudioEvent, elapsed: Duration, expected: Duration) {
        tracing::trace!(
            path = %event.path.display(),
            elapsed_ms = elapsed.as_millis() as u64,
            expected_ms = expected.as_millis() as u64,
            "segment progress"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    /// Canonical 48 kHz stereo s16le WAV.
    fn write_wav(path: &Path, seconds: f64) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let sample_count = (seconds * 48_000.0) as usize;
        let data_len = sample_count * 4;
        let mut wav = Vec::with_capacity(44 + data_len);
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&48_000u32.to_le_bytes());
        wav.extend_from_slice(&(48_000u32 * 4).to_le_bytes());
        wav.extend_from_slice(&4u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(data_len as u32).to_le_bytes());
        wav.resize(44 + data_len, 0);
        std::fs::write(path, wav).unwrap();
    }

    struct TestDirs {
        _root: tempfile::TempDir,
        config: StationConfig,
    }

    fn setup(with_startup_announcement: bool) -> TestDirs {
        let root = tempfile::tempdir().unwrap();
        let music = root.path().join("music");
        let dj = root.path().join("dj");

        write_wav(&music.join("first.wav"), 0.05);
        write_wav(&music.join("second.wav"), 0.05);
        if with_startup_announcement {
            write_wav(&dj.join("announcements/startup_hello.mp3"), 0.05);
        }
        write_wav(&dj.join("announcements/shutdown_bye.mp3"), 0.05);
        std::fs::create_dir_all(&dj).unwrap();

        let config = StationConfig {
            music_path: music,
            dj_path: dj,
            dj_state_path: root.path().join("state/dj_state.json"),
            tower_host: "127.0.0.1".into(),
            tower_port: 1,
            pcm_socket_path: root.path().join("absent.sock"),
            shutdown_timeout: Duration::from_secs(10),
            legal_id_interval: Duration::from_secs(3600),
        };
        TestDirs { _root: root, config }
    }

    fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
        let deadline = Instant::now() + timeout;
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_without_announcement_jumps_to_normal_operation() {
        let dirs = setup(false);
        let station = Station::new(dirs.config.clone()).unwrap();
        station.start().unwrap();

        assert_eq!(
            station.current_startup_state(),
            StartupState::NormalOperation
        );
        assert!(station.startup_event_sent.load(Ordering::SeqCst));

        tokio::task::spawn_blocking(move || station.stop())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_announcement_walks_the_state_machine() {
        let dirs = setup(true);
        let station = Station::new(dirs.config.clone()).unwrap();
        station.start().unwrap();

        // The announcement segment may already be under way, but the
        // machine left BOOTSTRAP via the announcement path.
        assert_ne!(station.current_startup_state(), StartupState::Bootstrap);

        let observed = Arc::clone(&station);
        wait_for("normal operation", Duration::from_secs(10), move || {
            observed.current_startup_state() == StartupState::NormalOperation
        });

        tokio::task::spawn_blocking(move || station.stop())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_is_two_phase_and_persists_state() {
        let dirs = setup(false);
        let state_path = dirs.config.dj_state_path.clone();
        let station = Station::new(dirs.config.clone()).unwrap();
        station.start().unwrap();

        let observed = Arc::clone(&station);
        wait_for("first segment", Duration::from_secs(10), move || {
            observed.now_playing().get().is_some()
        });

        let stopped = Arc::clone(&station);
        tokio::task::spawn_blocking(move || stopped.stop())
            .await
            .unwrap();

        assert_eq!(
            station.current_lifecycle_state(),
            LifecycleState::ShuttingDown
        );
        assert!(station.shutdown_event_sent.load(Ordering::SeqCst));
        assert!(station.now_playing().get().is_none());

        // Rotation history made it to disk.
        let persisted: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&state_path).unwrap()).unwrap();
        assert!(persisted.get("rotation").is_some());

        // Second stop is a no-op.
        let again = Arc::clone(&station);
        tokio::task::spawn_blocking(move || again.stop())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn warm_start_restores_rotation_history() {
        let dirs = setup(false);

        let station = Station::new(dirs.config.clone()).unwrap();
        station.start().unwrap();
        let observed = Arc::clone(&station);
        wait_for("a played segment", Duration::from_secs(10), move || {
            !observed.dj.to_state().rotation.history.is_empty()
        });
        let played = station.dj.to_state().rotation.history.len();
        let stopped = Arc::clone(&station);
        tokio::task::spawn_blocking(move || stopped.stop())
            .await
            .unwrap();

        let rebooted = Station::new(dirs.config.clone()).unwrap();
        assert!(rebooted.dj.to_state().rotation.history.len() >= played);
    }
}
