//! Wire-level event types crossing the Station -> Tower -> WebSocket path.

use serde::{Deserialize, Serialize};

/// The event types Tower accepts on `/tower/events/ingest`.
///
/// Anything else, including the retired `now_playing`,
/// `station_starting_up`, `station_shutting_down` and `dj_talking` names,
/// is refused with a 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StationStartup,
    StationShutdown,
    SongPlaying,
    SegmentPlaying,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StationStartup => "station_startup",
            EventType::StationShutdown => "station_shutdown",
            EventType::SongPlaying => "song_playing",
            EventType::SegmentPlaying => "segment_playing",
        }
    }

    /// Parse an ingest `event_type` string against the allow-list.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "station_startup" => Some(EventType::StationStartup),
            "station_shutdown" => Some(EventType::StationShutdown),
            "song_playing" => Some(EventType::SongPlaying),
            "segment_playing" => Some(EventType::SegmentPlaying),
            _ => None,
        }
    }
}

/// One event as carried on the wire. Metadata is opaque to Tower and is
/// forwarded verbatim to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TowerEvent {
    pub event_type: EventType,
    /// Seconds since the Unix epoch at the sender.
    pub timestamp: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TowerEvent {
    pub fn new(event_type: EventType, metadata: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_accepts_the_four_live_types() {
        for name in ["station_startup", "station_shutdown", "song_playing", "segment_playing"] {
            assert!(EventType::parse(name).is_some(), "{name} should be accepted");
        }
    }

    #[test]
    fn deprecated_types_are_refused() {
        for name in ["now_playing", "station_starting_up", "station_shutting_down", "dj_talking", "bogus"] {
            assert!(EventType::parse(name).is_none(), "{name} should be refused");
        }
    }

    #[test]
    fn serializes_with_snake_case_type() {
        let event = TowerEvent::new(EventType::SongPlaying, serde_json::json!({"title": "x"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "song_playing");
        assert_eq!(json["metadata"]["title"], "x");
    }
}
