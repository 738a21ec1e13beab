pub mod audio_event;
pub mod event;
pub mod now_playing;

pub use audio_event::{AudioEvent, DjIntent, SegmentKind, SegmentMetadata};
pub use event::{EventType, TowerEvent};
pub use now_playing::NowPlaying;
