//! DJ engine: the THINK/DO planner.
//!
//! THINK runs while a segment starts playing: pick the next song from
//! rotation, attach any intro/outro on file for it, decide whether a
//! legal ID is due, drain due tickler announcements, and bundle it all
//! into an immutable [`DjIntent`]. No decoding, no network, no queue
//! mutation: metadata comes from the in-memory caches.
//!
//! DO runs when that segment finishes: the intent's events are enqueued
//! to the playout engine in order (legal ID, intro, song, outro) and the
//! rotation play is recorded. A missing intent degrades to a straight
//! rotation pick instead of failing.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::audio::decode;
use crate::models::{AudioEvent, DjIntent, SegmentKind};
use crate::station::assets::AssetDiscovery;
use crate::station::playout::PlayoutEngine;
use crate::station::rotation::{RotationSelector, RotationState};

/// A scheduled announcement waiting for its air time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TicklerEntry {
    pub path: PathBuf,
    /// Seconds since the Unix epoch.
    pub due_at: f64,
}

/// Serialized DJ state (persisted alongside rotation state).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DjState {
    pub rotation: RotationState,
    pub last_legal_id: Option<f64>,
    pub tickler: Vec<TicklerEntry>,
}

/// What the startup THINK decided.
pub enum StartupPlan {
    /// Play this system-injected announcement first (no intent id).
    Announcement(AudioEvent),
    /// No announcement on file: jump straight to the first song.
    FirstSong(DjIntent),
    /// Library empty; nothing to play.
    Nothing,
}

struct DjInner {
    rotation: RotationSelector,
    assets: AssetDiscovery,
    current_intent: Option<DjIntent>,
    last_legal_id: Option<f64>,
    tickler: VecDeque<TicklerEntry>,
    is_draining: bool,
    terminal_do_done: bool,
    rng: StdRng,
    thinks_started: u64,
    thinks_completed: u64,
}

pub struct DjEngine {
    inner: Mutex<DjInner>,
    /// Cleared in SHUTTING_DOWN: no THINK or DO fires afterwards.
    enabled: AtomicBool,
    legal_id_interval: Duration,
}

impl DjEngine {
    pub fn new(
        rotation: RotationSelector,
        assets: AssetDiscovery,
        legal_id_interval: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(DjInner {
                rotation,
                assets,
                current_intent: None,
                last_legal_id: None,
                tickler: VecDeque::new(),
                is_draining: false,
                terminal_do_done: false,
                rng: StdRng::from_entropy(),
                thinks_started: 0,
                thinks_completed: 0,
            }),
            enabled: AtomicBool::new(true),
            legal_id_interval,
        }
    }

    /// Forbid any further THINK/DO. One-way; used by the hard-shutdown
    /// phase.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn set_draining(&self, draining: bool) {
        let mut inner = self.lock();
        inner.is_draining = draining;
    }

    pub fn has_intent(&self) -> bool {
        self.lock().current_intent.is_some()
    }

    /// (started, completed) THINK event counts; they match unless a THINK
    /// panicked mid-flight.
    pub fn think_events(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.thinks_started, inner.thinks_completed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DjInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Schedule an announcement for later airing.
    pub fn schedule_announcement(&self, path: PathBuf, due_at: f64) {
        let mut inner = self.lock();
        inner.tickler.push_back(TicklerEntry { path, due_at });
    }

    /// The one THINK run under the startup flag (lifecycle step 8).
    pub fn startup_think(&self) -> StartupPlan {
        let mut inner = self.lock();
        inner.thinks_started += 1;
        tracing::debug!("dj_think_started (startup)");

        let pool = inner.assets.cache().startup_announcements.clone();
        let announcement = pool.choose(&mut inner.rng).cloned();

        let plan = if let Some(path) = announcement {
            // System-injected: carries no intent id.
            StartupPlan::Announcement(segment_event(&path, SegmentKind::Announcement))
        } else {
            match Self::build_intent(&mut inner, self.legal_id_interval) {
                Some(intent) => {
                    inner.current_intent = Some(intent.clone());
                    StartupPlan::FirstSong(intent)
                }
                None => StartupPlan::Nothing,
            }
        };

        inner.thinks_completed += 1;
        tracing::debug!("dj_think_completed (startup)");
        plan
    }

    /// THINK: plan the segment after `current`. Runs on segment start.
    pub fn think(&self, current: &AudioEvent) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.lock();
        if inner.is_draining {
            if inner.terminal_do_done {
                return;
            }
            // A terminal plan (system-injected shutdown announcement) is
            // already staged; the last THINK must not replace it.
            let terminal_planned = inner
                .current_intent
                .as_ref()
                .map(|i| {
                    i.next_song.kind == SegmentKind::Announcement
                        && i.next_song.intent_id.is_none()
                })
                .unwrap_or(false);
            if terminal_planned {
                return;
            }
        }

        inner.thinks_started += 1;
        tracing::debug!(during = current.kind.as_str(), "dj_think_started");

        inner.assets.maybe_rescan();

        match Self::build_intent(&mut inner, self.legal_id_interval) {
            Some(intent) => {
                tracing::info!(
                    next = %intent.next_song.path.display(),
                    intro = intent.intro.is_some(),
                    outro = intent.outro.is_some(),
                    legal_id = intent.legal_id,
                    "DJ intent ready"
                );
                inner.current_intent = Some(intent);
            }
            None => {
                tracing::warn!("THINK produced no intent: library empty");
                inner.current_intent = None;
            }
        }

        inner.thinks_completed += 1;
        tracing::debug!("dj_think_completed");
    }

    fn build_intent(inner: &mut DjInner, legal_id_interval: Duration) -> Option<DjIntent> {
        use rand::Rng;

        let song_path = inner.rotation.select_next()?;
        let song = segment_event(&song_path, SegmentKind::Song);

        let mut intent = DjIntent::new(song);

        let per_song_intros = inner.assets.intros_for(&song_path).to_vec();
        let per_song_outros = inner.assets.outros_for(&song_path).to_vec();
        let generic_intros = inner.assets.cache().generic_intros.clone();
        let generic_outros = inner.assets.cache().generic_outros.clone();
        let legal_ids = inner.assets.cache().legal_ids.clone();

        // Per-song assets win; otherwise occasionally drop in a generic.
        let intro = if !per_song_intros.is_empty() {
            per_song_intros.choose(&mut inner.rng).cloned()
        } else if inner.rng.gen_ratio(1, 4) {
            generic_intros.choose(&mut inner.rng).cloned()
        } else {
            None
        };
        if let Some(path) = intro {
            intent.intro = Some(segment_event(&path, SegmentKind::Intro).with_intent(intent.id));
        }

        let outro = if !per_song_outros.is_empty() {
            per_song_outros.choose(&mut inner.rng).cloned()
        } else if inner.rng.gen_ratio(1, 4) {
            generic_outros.choose(&mut inner.rng).cloned()
        } else {
            None
        };
        if let Some(path) = outro {
            intent.outro = Some(segment_event(&path, SegmentKind::Outro).with_intent(intent.id));
        }

        // Legal ID when the cooldown has lapsed and a spot exists.
        let legal_due = inner
            .last_legal_id
            .map(|t| unix_now() - t >= legal_id_interval.as_secs_f64())
            .unwrap_or(true);
        if legal_due {
            if let Some(path) = legal_ids.choose(&mut inner.rng).cloned() {
                intent.announcement =
                    Some(segment_event(&path, SegmentKind::Announcement).with_intent(intent.id));
                intent.legal_id = true;
            }
        }

        // Otherwise air the next due tickler entry.
        if intent.announcement.is_none() {
            let now = unix_now();
            if let Some(position) = inner.tickler.iter().position(|e| e.due_at <= now) {
                if let Some(entry) = inner.tickler.remove(position) {
                    intent.announcement = Some(
                        segment_event(&entry.path, SegmentKind::Announcement)
                            .with_intent(intent.id),
                    );
                }
            }
        }

        Some(intent)
    }

    /// DO: enqueue the planned segments. Runs on segment finish.
    pub fn do_phase(&self, engine: &PlayoutEngine) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.lock();
        if inner.is_draining && inner.terminal_do_done {
            return;
        }

        let intent = inner.current_intent.take();
        let mut events = Vec::new();

        match intent {
            Some(intent) => {
                if let Some(announcement) = intent.announcement {
                    events.push(announcement);
                }
                if let Some(intro) = intent.intro {
                    events.push(intro);
                }
                events.push(intent.next_song.clone());
                if let Some(outro) = intent.outro {
                    events.push(outro);
                }

                if intent.next_song.kind == SegmentKind::Song {
                    inner.rotation.record_played(&intent.next_song.path);
                }
                if intent.legal_id {
                    inner.last_legal_id = Some(unix_now());
                }
            }
            None => {
                // Degrade: a plain rotation pick beats dead air.
                tracing::warn!("DO without intent, enqueueing fallback song");
                if let Some(path) = inner.rotation.select_next() {
                    let event = segment_event(&path, SegmentKind::Song);
                    inner.rotation.record_played(&path);
                    events.push(event);
                }
            }
        }

        if inner.is_draining {
            inner.terminal_do_done = true;
            tracing::info!("terminal DO executed");
        }
        drop(inner);

        if !events.is_empty() {
            engine.queue_audio(events);
        }
    }

    /// A terminal THINK for draining: swap the planned song for a
    /// shutdown announcement when one exists, so the last thing on air
    /// says goodbye.
    pub fn plan_shutdown_announcement(&self) {
        let mut inner = self.lock();
        let pool = inner.assets.cache().shutdown_announcements.clone();
        let Some(path) = pool.choose(&mut inner.rng).cloned() else {
            return;
        };
        // System-injected: no intent id.
        let announcement = segment_event(&path, SegmentKind::Announcement);
        let mut intent = DjIntent::new(announcement.clone());
        intent.next_song = announcement;
        intent.next_song.intent_id = None;
        inner.current_intent = Some(intent);
        tracing::info!("shutdown announcement planned as terminal segment");
    }

    pub fn to_state(&self) -> DjState {
        let inner = self.lock();
        DjState {
            rotation: inner.rotation.state().clone(),
            last_legal_id: inner.last_legal_id,
            tickler: inner.tickler.iter().cloned().collect(),
        }
    }

    pub fn restore(&self, state: DjState) {
        let mut inner = self.lock();
        inner.rotation.restore(state.rotation);
        inner.last_legal_id = state.last_legal_id;
        inner.tickler = state.tickler.into();
    }
}

/// Build an [`AudioEvent`] with metadata probed from the in-memory
/// cache-friendly path (a single header read, no decode).
fn segment_event(path: &std::path::Path, kind: SegmentKind) -> AudioEvent {
    let mut event = AudioEvent::new(path, kind);
    match decode::probe_metadata(path) {
        Ok(metadata) => event.metadata = Some(metadata),
        Err(e) => tracing::debug!(path = %path.display(), "metadata probe failed: {e}"),
    }
    event
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::playout::PlayoutEngine;
    use crate::station::sink::PcmSink;
    use std::path::Path;

    struct NullSink;

    impl PcmSink for NullSink {
        fn write(&mut self, _pcm: &[u8]) {}
        fn close(&mut self) {}
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    fn dj_with_library(dj_dir: &Path, tracks: &[&str]) -> DjEngine {
        let rotation = RotationSelector::with_rng(
            tracks.iter().map(PathBuf::from).collect(),
            Vec::new(),
            StdRng::seed_from_u64(11),
        );
        let assets = AssetDiscovery::new(dj_dir);
        DjEngine::new(rotation, assets, Duration::from_secs(3600))
    }

    fn current_segment() -> AudioEvent {
        AudioEvent::new("/music/current.mp3", SegmentKind::Song)
    }

    #[test]
    fn think_produces_an_intent_and_event_pair() {
        let dir = tempfile::tempdir().unwrap();
        let dj = dj_with_library(dir.path(), &["/music/a.mp3", "/music/b.mp3"]);

        dj.think(&current_segment());
        assert!(dj.has_intent());
        assert_eq!(dj.think_events(), (1, 1));
    }

    #[test]
    fn do_enqueues_in_order_and_consumes_the_intent() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a_intro.mp3"));
        touch(&dir.path().join("a_outro.mp3"));
        touch(&dir.path().join("announcements/legal_id.mp3"));
        let dj = dj_with_library(dir.path(), &["/music/a.mp3"]);
        let engine = PlayoutEngine::new(Box::new(NullSink));

        dj.think(&current_segment());
        dj.do_phase(&engine);
        assert!(!dj.has_intent(), "DO consumes the intent");

        // First THINK has no legal-ID history, so the legal ID leads,
        // then intro, song, outro.
        let queued = drain_queue(&engine);
        assert_eq!(
            queued
                .iter()
                .map(|e| e.kind.as_str())
                .collect::<Vec<_>>(),
            vec!["announcement", "intro", "song", "outro"]
        );
        // Everything traces back to one intent except nothing here is
        // system-injected.
        let intent_ids: std::collections::HashSet<_> =
            queued.iter().map(|e| e.intent_id).collect();
        assert_eq!(intent_ids.len(), 1);
        assert!(queued[0].intent_id.is_some());
    }

    #[test]
    fn legal_id_respects_the_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("announcements/legal_id.mp3"));
        let dj = dj_with_library(dir.path(), &["/music/a.mp3", "/music/b.mp3"]);
        let engine = PlayoutEngine::new(Box::new(NullSink));

        dj.think(&current_segment());
        dj.do_phase(&engine);
        let first = drain_queue(&engine);
        assert!(first.iter().any(|e| e.kind == SegmentKind::Announcement));

        // Cooldown just set: the next THINK must not schedule another.
        dj.think(&current_segment());
        dj.do_phase(&engine);
        let second = drain_queue(&engine);
        assert!(!second.iter().any(|e| e.kind == SegmentKind::Announcement));
    }

    #[test]
    fn due_tickler_entries_air_once() {
        let dir = tempfile::tempdir().unwrap();
        let dj = dj_with_library(dir.path(), &["/music/a.mp3", "/music/b.mp3"]);
        let engine = PlayoutEngine::new(Box::new(NullSink));

        dj.schedule_announcement(PathBuf::from("/dj/psa.mp3"), 0.0);
        dj.schedule_announcement(PathBuf::from("/dj/later.mp3"), unix_now() + 3600.0);

        dj.think(&current_segment());
        dj.do_phase(&engine);
        let queued = drain_queue(&engine);
        assert!(queued
            .iter()
            .any(|e| e.path == PathBuf::from("/dj/psa.mp3")));

        dj.think(&current_segment());
        dj.do_phase(&engine);
        let queued = drain_queue(&engine);
        assert!(!queued.iter().any(|e| e.path == PathBuf::from("/dj/psa.mp3")));
        assert!(!queued.iter().any(|e| e.path == PathBuf::from("/dj/later.mp3")));
    }

    #[test]
    fn do_without_intent_degrades_to_a_rotation_pick() {
        let dir = tempfile::tempdir().unwrap();
        let dj = dj_with_library(dir.path(), &["/music/a.mp3"]);
        let engine = PlayoutEngine::new(Box::new(NullSink));

        dj.do_phase(&engine);
        let queued = drain_queue(&engine);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, SegmentKind::Song);
    }

    #[test]
    fn disabled_dj_neither_thinks_nor_does() {
        let dir = tempfile::tempdir().unwrap();
        let dj = dj_with_library(dir.path(), &["/music/a.mp3"]);
        let engine = PlayoutEngine::new(Box::new(NullSink));

        dj.disable();
        dj.think(&current_segment());
        dj.do_phase(&engine);
        assert!(!dj.has_intent());
        assert!(engine.queue_is_empty());
        assert_eq!(dj.think_events(), (0, 0));
    }

    #[test]
    fn draining_allows_exactly_one_terminal_do() {
        let dir = tempfile::tempdir().unwrap();
        let dj = dj_with_library(dir.path(), &["/music/a.mp3", "/music/b.mp3"]);
        let engine = PlayoutEngine::new(Box::new(NullSink));

        dj.set_draining(true);
        dj.think(&current_segment());
        dj.do_phase(&engine);
        assert!(!drain_queue(&engine).is_empty());

        // Terminal DO done: everything after is suppressed.
        dj.think(&current_segment());
        dj.do_phase(&engine);
        assert!(engine.queue_is_empty());
    }

    #[test]
    fn state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dj = dj_with_library(dir.path(), &["/music/a.mp3", "/music/b.mp3"]);
        let engine = PlayoutEngine::new(Box::new(NullSink));
        dj.schedule_announcement(PathBuf::from("/dj/psa.mp3"), 42.0);
        dj.think(&current_segment());
        dj.do_phase(&engine);

        let state = dj.to_state();
        let json = serde_json::to_value(&state).unwrap();
        let restored: DjState = serde_json::from_value(json).unwrap();

        let dj2 = dj_with_library(dir.path(), &["/music/a.mp3", "/music/b.mp3"]);
        dj2.restore(restored);
        let state2 = dj2.to_state();
        assert_eq!(state2.rotation, state.rotation);
        assert_eq!(state2.tickler, state.tickler);
    }

    /// Pop everything the engine has queued (the engine is not running,
    /// so the queue is inert).
    fn drain_queue(engine: &PlayoutEngine) -> Vec<AudioEvent> {
        let mut events = Vec::new();
        while let Some(event) = engine.test_pop_queued() {
            events.push(event);
        }
        events
    }
}
