//! Weighted music rotation.
//!
//! Picks the next track from the regular or holiday pool with a
//! date-driven holiday probability, then draws inside the pool with
//! weights built from recent-play penalties, an age bonus, a
//! never-played bonus and play-count balancing. History and play counts
//! round-trip through serde for warm restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::station::library::is_holiday_path;

pub const HISTORY_SIZE: usize = 48;
const IMMEDIATE_REPEAT_PENALTY: f64 = 0.01;
const RECENT_PLAY_WINDOW: usize = 20;
const RECENT_PLAY_BASE_PENALTY: f64 = 0.1;
const NEVER_PLAYED_BONUS: f64 = 3.0;
const MAX_TIME_BONUS: f64 = 2.0;
const MAX_HOLIDAY_PROBABILITY: f64 = 0.33;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub path: PathBuf,
    /// Seconds since the Unix epoch, wall clock.
    pub played_at: f64,
    pub is_holiday: bool,
}

/// Serializable selector state: the warm-restart payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RotationState {
    pub history: Vec<HistoryEntry>,
    pub play_counts: HashMap<PathBuf, u64>,
    pub holiday_play_counts: HashMap<PathBuf, u64>,
}

pub struct RotationSelector {
    regular_tracks: Vec<PathBuf>,
    holiday_tracks: Vec<PathBuf>,
    state: RotationState,
    rng: StdRng,
}

impl RotationSelector {
    pub fn new(regular_tracks: Vec<PathBuf>, holiday_tracks: Vec<PathBuf>) -> Self {
        Self::with_rng(regular_tracks, holiday_tracks, StdRng::from_entropy())
    }

    /// Deterministic variant for tests and replay.
    pub fn with_rng(
        regular_tracks: Vec<PathBuf>,
        holiday_tracks: Vec<PathBuf>,
        rng: StdRng,
    ) -> Self {
        Self {
            regular_tracks,
            holiday_tracks,
            state: RotationState::default(),
            rng,
        }
    }

    /// Restore history and play counts from a persisted state.
    pub fn restore(&mut self, state: RotationState) {
        tracing::info!(
            history = state.history.len(),
            regular_counts = state.play_counts.len(),
            holiday_counts = state.holiday_play_counts.len(),
            "rotation state restored"
        );
        self.state = state;
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    /// Pick the next track. Returns `None` only when both pools are
    /// empty.
    pub fn select_next(&mut self) -> Option<PathBuf> {
        self.select_next_on(chrono::Local::now().date_naive())
    }

    fn select_next_on(&mut self, today: NaiveDate) -> Option<PathBuf> {
        if self.regular_tracks.is_empty() && self.holiday_tracks.is_empty() {
            return None;
        }

        let p_holiday = holiday_probability(today);
        let use_holiday =
            !self.holiday_tracks.is_empty() && self.rng.gen::<f64>() < p_holiday;

        let pool: Vec<PathBuf> = if use_holiday {
            self.holiday_tracks.clone()
        } else if self.regular_tracks.is_empty() {
            // Empty pool falls through to the other one.
            self.holiday_tracks.clone()
        } else {
            self.regular_tracks.clone()
        };

        let now = unix_now();
        let weights: Vec<f64> = pool.iter().map(|t| self.weight_for(t, now)).collect();
        let index = weighted_index(&weights, &mut self.rng)?;
        let selected = pool[index].clone();

        tracing::debug!(
            track = %selected.display(),
            holiday = use_holiday,
            weight = weights[index],
            "rotation selected"
        );
        Some(selected)
    }

    fn weight_for(&self, track: &Path, now: f64) -> f64 {
        let is_holiday = is_holiday_path(track);
        let play_counts = if is_holiday {
            &self.state.holiday_play_counts
        } else {
            &self.state.play_counts
        };

        let mut weight = 1.0;

        // Most recent occurrence of this track in history, position 0 =
        // the very last play.
        let recent = self
            .state
            .history
            .iter()
            .rev()
            .enumerate()
            .find(|(_, entry)| entry.path == track && entry.is_holiday == is_holiday);

        if let Some((position, entry)) = recent {
            if position == 0 {
                weight *= IMMEDIATE_REPEAT_PENALTY;
            } else if position < RECENT_PLAY_WINDOW {
                let recovery = position as f64 / RECENT_PLAY_WINDOW as f64;
                let penalty =
                    RECENT_PLAY_BASE_PENALTY + (1.0 - RECENT_PLAY_BASE_PENALTY) * recovery;
                weight *= penalty.clamp(0.05, 1.0);
            }

            let hours_since = (now - entry.played_at) / 3600.0;
            if hours_since > 1.0 {
                weight *= MAX_TIME_BONUS.min((hours_since / 24.0).sqrt());
            }
        } else {
            weight *= NEVER_PLAYED_BONUS;
        }

        // Play-count balance: under-played tracks climb toward the mean.
        let total_plays: u64 = play_counts.values().sum();
        if total_plays > 0 && !play_counts.is_empty() {
            let mean = total_plays as f64 / play_counts.len() as f64;
            let plays = play_counts.get(track).copied().unwrap_or(0) as f64;
            weight *= (mean + 1.0) / (plays + 1.0);
        }

        weight
    }

    /// Record a play: append to history (capped) and bump the counter.
    pub fn record_played(&mut self, track: &Path) {
        let is_holiday = is_holiday_path(track);
        self.state.history.push(HistoryEntry {
            path: track.to_path_buf(),
            played_at: unix_now(),
            is_holiday,
        });
        if self.state.history.len() > HISTORY_SIZE {
            let excess = self.state.history.len() - HISTORY_SIZE;
            self.state.history.drain(..excess);
        }

        let counts = if is_holiday {
            &mut self.state.holiday_play_counts
        } else {
            &mut self.state.play_counts
        };
        *counts.entry(track.to_path_buf()).or_insert(0) += 1;
    }

    /// Most recent plays, newest first.
    pub fn recent_plays(&self, count: usize) -> Vec<&Path> {
        self.state
            .history
            .iter()
            .rev()
            .take(count)
            .map(|e| e.path.as_path())
            .collect()
    }
}

/// Date-driven holiday pool probability: 0 outside Nov/Dec, rising
/// linearly from 1% on Nov 1 to 33% on Dec 25, held there through Dec 31.
pub fn holiday_probability(date: NaiveDate) -> f64 {
    let days_from_nov1 = match date.month() {
        11 => (date.day() - 1) as f64,
        12 => 30.0 + (date.day() - 1) as f64,
        _ => return 0.0,
    };

    let days_to_dec25 = 54.0;
    if days_from_nov1 >= days_to_dec25 {
        return MAX_HOLIDAY_PROBABILITY;
    }
    0.01 + (days_from_nov1 / days_to_dec25) * (MAX_HOLIDAY_PROBABILITY - 0.01)
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn weighted_index(weights: &[f64], rng: &mut StdRng) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Some(rng.gen_range(0..weights.len()));
    }
    let mut draw = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        draw -= w;
        if draw <= 0.0 {
            return Some(i);
        }
    }
    Some(weights.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    fn seeded(regular: &[&str], holiday: &[&str]) -> RotationSelector {
        RotationSelector::with_rng(tracks(regular), tracks(holiday), StdRng::seed_from_u64(7))
    }

    #[test]
    fn selects_from_regular_pool_off_season() {
        let mut selector = seeded(&["/m/a.mp3", "/m/b.mp3"], &["/m/holiday/x.mp3"]);
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        for _ in 0..20 {
            let pick = selector.select_next_on(date).unwrap();
            assert!(!is_holiday_path(&pick));
        }
    }

    #[test]
    fn holiday_probability_curve() {
        assert_eq!(holiday_probability(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()), 0.0);
        let nov1 = holiday_probability(NaiveDate::from_ymd_opt(2026, 11, 1).unwrap());
        assert!((nov1 - 0.01).abs() < 1e-9);
        let dec25 = holiday_probability(NaiveDate::from_ymd_opt(2026, 12, 25).unwrap());
        assert!((dec25 - 0.33).abs() < 1e-9);
        let dec30 = holiday_probability(NaiveDate::from_ymd_opt(2026, 12, 30).unwrap());
        assert!((dec30 - 0.33).abs() < 1e-9);
        let dec1 = holiday_probability(NaiveDate::from_ymd_opt(2026, 12, 1).unwrap());
        assert!(dec1 > nov1 && dec1 < dec25);
    }

    #[test]
    fn just_played_track_is_heavily_penalized() {
        let mut selector = seeded(&["/m/a.mp3", "/m/b.mp3"], &[]);
        selector.record_played(Path::new("/m/a.mp3"));

        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let mut picked_a = 0;
        for _ in 0..100 {
            if selector.select_next_on(date).unwrap() == PathBuf::from("/m/a.mp3") {
                picked_a += 1;
            }
        }
        // a carries weight 0.01 vs b's never-played 3.0.
        assert!(picked_a <= 3, "immediate repeat picked {picked_a} times");
    }

    #[test]
    fn never_played_tracks_get_a_bonus() {
        let selector = seeded(&["/m/a.mp3"], &[]);
        let weight = selector.weight_for(Path::new("/m/a.mp3"), unix_now());
        assert!((weight - NEVER_PLAYED_BONUS).abs() < 1e-9);
    }

    #[test]
    fn old_plays_earn_a_time_bonus() {
        let mut selector = seeded(&["/m/a.mp3", "/m/b.mp3"], &[]);
        selector.record_played(Path::new("/m/a.mp3"));
        selector.record_played(Path::new("/m/b.mp3"));
        // Backdate a's play by 24 hours; position 1 in history.
        selector.state.history[0].played_at -= 24.0 * 3600.0;

        let now = unix_now();
        let weight_a = selector.weight_for(Path::new("/m/a.mp3"), now);
        // Position 1 penalty: 0.1 + 0.9 * (1/20) = 0.145; time bonus sqrt(1) = 1.0.
        // Play-count balance: mean 1 over 2 tracks each played once -> 1.0.
        assert!((weight_a - 0.145).abs() < 1e-6, "got {weight_a}");
    }

    #[test]
    fn history_is_capped() {
        let mut selector = seeded(&["/m/a.mp3"], &[]);
        for _ in 0..(HISTORY_SIZE + 10) {
            selector.record_played(Path::new("/m/a.mp3"));
        }
        assert_eq!(selector.state().history.len(), HISTORY_SIZE);
    }

    #[test]
    fn state_round_trips_through_serde() {
        let mut selector = seeded(&["/m/a.mp3", "/m/b.mp3"], &["/m/holiday/x.mp3"]);
        selector.record_played(Path::new("/m/a.mp3"));
        selector.record_played(Path::new("/m/holiday/x.mp3"));

        let json = serde_json::to_string(selector.state()).unwrap();
        let restored: RotationState = serde_json::from_str(&json).unwrap();
        assert_eq!(&restored, selector.state());
    }

    #[test]
    fn deterministic_with_a_seed() {
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let picks_a: Vec<_> = {
            let mut s = seeded(&["/m/a.mp3", "/m/b.mp3", "/m/c.mp3"], &[]);
            (0..10).map(|_| s.select_next_on(date).unwrap()).collect()
        };
        let picks_b: Vec<_> = {
            let mut s = seeded(&["/m/a.mp3", "/m/b.mp3", "/m/c.mp3"], &[]);
            (0..10).map(|_| s.select_next_on(date).unwrap()).collect()
        };
        assert_eq!(picks_a, picks_b);
    }

    #[test]
    fn empty_pools_yield_none() {
        let mut selector = seeded(&[], &[]);
        assert!(selector.select_next().is_none());
    }
}
