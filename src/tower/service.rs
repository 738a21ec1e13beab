//! Tower service wiring.
//!
//! Builds the buffers, encoder manager, pump, broadcast loop, ingest
//! transport and event bus, owns start/stop ordering, and is the root
//! owner of the externally reported operational mode.

use std::sync::Arc;

use serde::Serialize;

use crate::audio::frame::FRAME_BYTES;
use crate::audio::{BufferStats, FrameRingBuffer, OverflowPolicy};
use crate::config::TowerConfig;
use crate::error::Result;
use crate::tower::broadcast::{BroadcastLoop, ConnectionManager};
use crate::tower::encoder_manager::EncoderManager;
use crate::tower::events::EventBus;
use crate::tower::ingest::IngestTransport;
use crate::tower::pump::AudioPump;
use crate::tower::supervisor::SupervisorState;

/// Externally reported operational mode. Derived from supervisor state
/// plus the encoder-enabled flag; never consulted by the audio path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalMode {
    ColdStart,
    Booting,
    LiveInput,
    Fallback,
    RestartRecovery,
    OfflineTestMode,
    Degraded,
}

impl OperationalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalMode::ColdStart => "COLD_START",
            OperationalMode::Booting => "BOOTING",
            OperationalMode::LiveInput => "LIVE_INPUT",
            OperationalMode::Fallback => "FALLBACK",
            OperationalMode::RestartRecovery => "RESTART_RECOVERY",
            OperationalMode::OfflineTestMode => "OFFLINE_TEST_MODE",
            OperationalMode::Degraded => "DEGRADED",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TowerStatus {
    pub mode: String,
    pub fps: f64,
    pub fallback: bool,
    pub encoder_state: String,
    pub mp3_buffer_count: usize,
    pub mp3_buffer_capacity: usize,
    pub mp3_buffer_overflow_count: u64,
}

pub struct TowerService {
    config: TowerConfig,
    upstream: Arc<FrameRingBuffer>,
    encoder_manager: Arc<EncoderManager>,
    pump: AudioPump,
    broadcast_loop: BroadcastLoop,
    connections: Arc<ConnectionManager>,
    events: Arc<EventBus>,
    ingest: IngestTransport,
}

impl TowerService {
    pub fn new(config: TowerConfig) -> Self {
        let upstream = Arc::new(FrameRingBuffer::with_frame_size(
            config.pcm_buffer_capacity,
            OverflowPolicy::DropOldest,
            FRAME_BYTES,
        ));
        let mp3_buffer = Arc::new(FrameRingBuffer::new(
            config.mp3_buffer_capacity,
            OverflowPolicy::DropOldest,
        ));

        let events = Arc::new(EventBus::new());

        let encoder_manager = Arc::new(EncoderManager::new(
            Arc::clone(&upstream),
            mp3_buffer,
            &config.encoder_bin,
            config.encoder_enabled,
            config.encoder_stall_threshold,
            config.output_tick,
            config.silence_mp3_path.as_deref(),
            events.station_shutdown_flag(),
        ));

        let pump = AudioPump::new(Arc::clone(&encoder_manager));
        let connections = Arc::new(ConnectionManager::new(config.client_timeout));
        let broadcast_loop = BroadcastLoop::new(
            Arc::clone(&encoder_manager),
            Arc::clone(&connections),
            config.output_tick,
        );
        let ingest = IngestTransport::new(&config.pcm_socket_path, Arc::clone(&upstream));

        Self {
            config,
            upstream,
            encoder_manager,
            pump,
            broadcast_loop,
            connections,
            events,
            ingest,
        }
    }

    /// Start every subsystem. Ingest must be accepting before the pump
    /// begins ticking; the pump must begin within one grace window of the
    /// encoder spawn.
    pub fn start(&self) -> Result<()> {
        tracing::info!("=== Tower starting ===");

        let _accept_loop = self.ingest.start()?;
        self.encoder_manager.start();
        self.pump.start();
        self.broadcast_loop.start();

        tracing::info!(mode = self.mode().as_str(), "Tower started");
        Ok(())
    }

    /// Stop in reverse dependency order; the broadcast loop goes last so
    /// listeners keep receiving frames until the rest is quiescent.
    pub fn stop(&self) {
        tracing::info!("=== Tower shutting down ===");
        self.pump.stop();
        self.encoder_manager.stop();
        self.ingest.stop();
        self.broadcast_loop.stop();
        tracing::info!("Tower stopped");
    }

    pub fn mode(&self) -> OperationalMode {
        if !self.encoder_manager.encoder_enabled() {
            return OperationalMode::OfflineTestMode;
        }
        match self.encoder_manager.supervisor_state() {
            None | Some(SupervisorState::Stopped) | Some(SupervisorState::Starting) => {
                OperationalMode::ColdStart
            }
            Some(SupervisorState::Booting) => OperationalMode::Booting,
            Some(SupervisorState::Running) => {
                if self.encoder_manager.live_input() {
                    OperationalMode::LiveInput
                } else {
                    OperationalMode::Fallback
                }
            }
            Some(SupervisorState::Restarting) => OperationalMode::RestartRecovery,
            Some(SupervisorState::Failed) => OperationalMode::Degraded,
        }
    }

    pub fn status(&self) -> TowerStatus {
        let mode = self.mode();
        let mp3_stats = self.encoder_manager.mp3_stats();
        TowerStatus {
            mode: mode.as_str().to_string(),
            fps: 1000.0 / self.config.output_tick.as_millis().max(1) as f64,
            fallback: !matches!(mode, OperationalMode::LiveInput),
            encoder_state: self
                .encoder_manager
                .supervisor_state()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "DISABLED".to_string()),
            mp3_buffer_count: mp3_stats.count,
            mp3_buffer_capacity: mp3_stats.capacity,
            mp3_buffer_overflow_count: mp3_stats.overflow_count,
        }
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.upstream.stats()
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.connections)
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> &TowerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> TowerConfig {
        let dir = std::env::temp_dir().join(format!("retrowaves-test-{}", uuid::Uuid::new_v4()));
        TowerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            pcm_socket_path: dir.join("pcm.sock"),
            pcm_buffer_capacity: 16,
            mp3_buffer_capacity: 16,
            output_tick: std::time::Duration::from_millis(15),
            encoder_stall_threshold: std::time::Duration::from_secs(2),
            encoder_bin: "ffmpeg".into(),
            encoder_enabled: false,
            silence_mp3_path: None,
            client_timeout: std::time::Duration::from_millis(250),
        }
    }

    #[test]
    fn offline_mode_reported_when_encoder_disabled() {
        let service = TowerService::new(offline_config());
        assert_eq!(service.mode(), OperationalMode::OfflineTestMode);
        let status = service.status();
        assert_eq!(status.mode, "OFFLINE_TEST_MODE");
        assert!(status.fallback);
        assert_eq!(status.encoder_state, "DISABLED");
    }

    #[test]
    fn status_reports_broadcast_fps_from_tick() {
        let service = TowerService::new(offline_config());
        let status = service.status();
        assert!((status.fps - 1000.0 / 15.0).abs() < 0.01);
    }
}
