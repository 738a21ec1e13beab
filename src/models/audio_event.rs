//! Playback planning types shared between the DJ engine and the playout
//! engine.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of segment an [`AudioEvent`] schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Song,
    Announcement,
    Intro,
    Outro,
    Talk,
}

impl SegmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentKind::Song => "song",
            SegmentKind::Announcement => "announcement",
            SegmentKind::Intro => "intro",
            SegmentKind::Outro => "outro",
            SegmentKind::Talk => "talk",
        }
    }
}

/// Display metadata attached to a segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<u32>,
    /// Nominal duration in seconds, as probed from the file.
    pub duration_sec: Option<f64>,
}

/// A plan for one playout segment. Immutable once queued.
#[derive(Debug, Clone)]
pub struct AudioEvent {
    pub path: PathBuf,
    pub kind: SegmentKind,
    /// Optional level adjustment in dB.
    pub gain_db: Option<f32>,
    pub metadata: Option<SegmentMetadata>,
    /// Correlates the event to the DJ intent that produced it. Absent for
    /// system-injected segments (startup/shutdown announcements).
    pub intent_id: Option<Uuid>,
}

impl AudioEvent {
    pub fn new(path: impl Into<PathBuf>, kind: SegmentKind) -> Self {
        Self {
            path: path.into(),
            kind,
            gain_db: None,
            metadata: None,
            intent_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: SegmentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_intent(mut self, intent_id: Uuid) -> Self {
        self.intent_id = Some(intent_id);
        self
    }

    /// Nominal duration if the metadata carries one.
    pub fn nominal_duration(&self) -> Option<std::time::Duration> {
        self.metadata
            .as_ref()
            .and_then(|m| m.duration_sec)
            .filter(|d| *d > 0.0)
            .map(std::time::Duration::from_secs_f64)
    }
}

/// The bundled plan produced in THINK and consumed in DO. Never mutated
/// after production.
#[derive(Debug, Clone)]
pub struct DjIntent {
    pub id: Uuid,
    pub next_song: AudioEvent,
    pub intro: Option<AudioEvent>,
    pub outro: Option<AudioEvent>,
    pub announcement: Option<AudioEvent>,
    pub legal_id: bool,
    pub decided_at: Instant,
}

impl DjIntent {
    pub fn new(next_song: AudioEvent) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            next_song: next_song.with_intent(id),
            intro: None,
            outro: None,
            announcement: None,
            legal_id: false,
            decided_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_tags_next_song_with_its_id() {
        let intent = DjIntent::new(AudioEvent::new("/music/a.mp3", SegmentKind::Song));
        assert_eq!(intent.next_song.intent_id, Some(intent.id));
    }

    #[test]
    fn nominal_duration_ignores_nonpositive_values() {
        let mut event = AudioEvent::new("/music/a.mp3", SegmentKind::Song).with_metadata(
            SegmentMetadata {
                duration_sec: Some(0.0),
                ..Default::default()
            },
        );
        assert!(event.nominal_duration().is_none());

        event.metadata.as_mut().unwrap().duration_sec = Some(2.5);
        assert_eq!(
            event.nominal_duration(),
            Some(std::time::Duration::from_millis(2500))
        );
    }
}
