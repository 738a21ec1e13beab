//! Authoritative now-playing snapshot.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{AudioEvent, SegmentKind};

/// Immutable description of what is audibly playing right now.
///
/// Only authoritative fields: no elapsed, no remaining, no progress.
/// Consumers derive those from `started_at` and the wall clock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NowPlaying {
    pub segment_type: SegmentKind,
    pub started_at: DateTime<Utc>,
    pub file_path: PathBuf,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<u32>,
    pub duration_sec: Option<f64>,
}

impl NowPlaying {
    /// Snapshot taken at segment start.
    pub fn for_segment(event: &AudioEvent) -> Self {
        let meta = event.metadata.clone().unwrap_or_default();
        Self {
            segment_type: event.kind,
            started_at: Utc::now(),
            file_path: event.path.clone(),
            title: meta.title,
            artist: meta.artist,
            album: meta.album,
            year: meta.year,
            duration_sec: meta.duration_sec,
        }
    }
}
