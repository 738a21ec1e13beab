//! Now-playing cell.
//!
//! Write-once on segment start, clear-once on segment finish, owned by
//! Station. Readers get a snapshot clone and cannot mutate; there is no
//! in-place update path at all.

use std::sync::Mutex;

use crate::models::{AudioEvent, NowPlaying};

#[derive(Default)]
pub struct NowPlayingCell {
    state: Mutex<Option<NowPlaying>>,
}

impl NowPlayingCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cell with a fresh snapshot for the segment that just
    /// started.
    pub fn segment_started(&self, event: &AudioEvent) {
        let snapshot = NowPlaying::for_segment(event);
        tracing::debug!(
            segment = snapshot.segment_type.as_str(),
            path = %snapshot.file_path.display(),
            "now playing set"
        );
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    /// Clear on segment finish, before any next segment starts.
    pub fn segment_finished(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn get(&self) -> Option<NowPlaying> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SegmentKind;

    #[test]
    fn created_on_start_cleared_on_finish() {
        let cell = NowPlayingCell::new();
        assert!(cell.get().is_none());

        let event = AudioEvent::new("/music/a.mp3", SegmentKind::Song);
        cell.segment_started(&event);
        let snapshot = cell.get().unwrap();
        assert_eq!(snapshot.segment_type, SegmentKind::Song);

        cell.segment_finished();
        assert!(cell.get().is_none());
    }

    #[test]
    fn snapshot_is_independent_of_the_cell() {
        let cell = NowPlayingCell::new();
        cell.segment_started(&AudioEvent::new("/music/a.mp3", SegmentKind::Song));
        let snapshot = cell.get().unwrap();
        cell.segment_finished();
        // The reader's copy is unaffected by the clear.
        assert_eq!(snapshot.file_path, std::path::PathBuf::from("/music/a.mp3"));
    }
}
