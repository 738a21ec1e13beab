//! Typed lifecycle/metadata event bus.
//!
//! Station posts events to the ingest endpoint; the bus validates them
//! against the allow-list, latches the station-shutdown flag the encoder
//! manager consults, and re-broadcasts the event verbatim to every
//! WebSocket subscriber.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::broadcast;

use crate::error::{AppError, Result};
use crate::models::{EventType, TowerEvent};

/// Raw ingest payload; `event_type` is validated before it becomes a
/// [`TowerEvent`].
#[derive(Debug, Deserialize)]
pub struct IngestEnvelope {
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub struct EventBus {
    sender: broadcast::Sender<TowerEvent>,
    station_shutdown: Arc<AtomicBool>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            sender,
            station_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Validate one ingest envelope and fan it out. Deprecated or unknown
    /// types are refused.
    pub fn ingest(&self, envelope: IngestEnvelope) -> Result<()> {
        let Some(event_type) = EventType::parse(&envelope.event_type) else {
            return Err(AppError::RejectedEvent(format!(
                "event_type not accepted: {}",
                envelope.event_type
            )));
        };

        if event_type == EventType::StationShutdown {
            self.station_shutdown.store(true, Ordering::SeqCst);
        }
        if event_type == EventType::StationStartup {
            // A fresh Station run clears the previous shutdown latch.
            self.station_shutdown.store(false, Ordering::SeqCst);
        }

        let event = TowerEvent {
            event_type,
            timestamp: envelope
                .timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as f64 / 1000.0),
            metadata: envelope.metadata,
        };

        tracing::debug!(event_type = event_type.as_str(), "event accepted");
        // No subscribers is fine; the send result only reports that.
        let _ = self.sender.send(event);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TowerEvent> {
        self.sender.subscribe()
    }

    /// Flag handed to the encoder manager to silence PCM-loss warnings
    /// during an announced Station shutdown.
    pub fn station_shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.station_shutdown)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(event_type: &str) -> IngestEnvelope {
        IngestEnvelope {
            event_type: event_type.to_string(),
            timestamp: Some(123.0),
            metadata: json!({"k": "v"}),
        }
    }

    #[test]
    fn accepted_event_reaches_subscribers_verbatim() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.ingest(envelope("song_playing")).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::SongPlaying);
        assert_eq!(event.timestamp, 123.0);
        assert_eq!(event.metadata, json!({"k": "v"}));
    }

    #[test]
    fn deprecated_types_rejected() {
        let bus = EventBus::new();
        for name in ["now_playing", "station_starting_up", "dj_talking"] {
            assert!(matches!(
                bus.ingest(envelope(name)),
                Err(AppError::RejectedEvent(_))
            ));
        }
    }

    #[test]
    fn shutdown_event_latches_flag_and_startup_clears_it() {
        let bus = EventBus::new();
        let flag = bus.station_shutdown_flag();
        assert!(!flag.load(Ordering::SeqCst));

        bus.ingest(envelope("station_shutdown")).unwrap();
        assert!(flag.load(Ordering::SeqCst));

        bus.ingest(envelope("station_startup")).unwrap();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn rejected_events_do_not_broadcast() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let _ = bus.ingest(envelope("now_playing"));
        assert!(rx.try_recv().is_err());
    }
}
