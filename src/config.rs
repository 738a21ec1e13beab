use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => !matches!(v.trim(), "0" | "false" | "no" | "off" | ""),
        Err(_) => default,
    }
}

/// Tower process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct TowerConfig {
    pub host: String,
    pub port: u16,
    /// Unix socket path Station writes PCM to.
    pub pcm_socket_path: PathBuf,
    /// Upstream PCM buffer capacity in frames.
    pub pcm_buffer_capacity: usize,
    /// MP3 output buffer capacity in frames.
    pub mp3_buffer_capacity: usize,
    /// Broadcast loop tick.
    pub output_tick: Duration,
    /// Encoder stall detection threshold.
    pub encoder_stall_threshold: Duration,
    /// External encoder binary (ffmpeg-compatible s16le -> mp3 pipe).
    pub encoder_bin: String,
    /// When false the encoder is never spawned (OFFLINE_TEST_MODE).
    pub encoder_enabled: bool,
    /// Optional pre-decoded fallback audio file.
    pub silence_mp3_path: Option<PathBuf>,
    /// Slow-consumer drop threshold for /stream and WebSocket clients.
    pub client_timeout: Duration,
}

impl TowerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            host: env_or("TOWER_HOST", "0.0.0.0"),
            port: env_parse("TOWER_PORT", 8005),
            pcm_socket_path: PathBuf::from(env_or(
                "TOWER_PCM_SOCKET_PATH",
                "/run/retrowaves/pcm.sock",
            )),
            pcm_buffer_capacity: env_parse("TOWER_PCM_BUFFER_SIZE", 60),
            mp3_buffer_capacity: env_parse("TOWER_MP3_BUFFER_CAPACITY_FRAMES", 400),
            output_tick: Duration::from_millis(env_parse("TOWER_OUTPUT_TICK_INTERVAL_MS", 15)),
            encoder_stall_threshold: Duration::from_millis(env_parse(
                "TOWER_ENCODER_STALL_THRESHOLD_MS",
                2000,
            )),
            encoder_bin: env_or("TOWER_ENCODER_BIN", "ffmpeg"),
            encoder_enabled: env_bool("TOWER_ENCODER_ENABLED", true),
            silence_mp3_path: env::var("TOWER_SILENCE_MP3_PATH").ok().map(PathBuf::from),
            client_timeout: Duration::from_millis(env_parse("TOWER_CLIENT_TIMEOUT_MS", 250)),
        }
    }
}

/// Station process configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Root directory of the music library.
    pub music_path: PathBuf,
    /// DJ asset directory (intros, outros, announcements).
    pub dj_path: PathBuf,
    /// Persisted DJ state location.
    pub dj_state_path: PathBuf,
    /// Tower HTTP endpoint for event ingest.
    pub tower_host: String,
    pub tower_port: u16,
    /// Tower PCM ingest socket.
    pub pcm_socket_path: PathBuf,
    /// How long the lifecycle waits for the terminal segment during draining.
    pub shutdown_timeout: Duration,
    /// Minimum spacing between legal-ID announcements.
    pub legal_id_interval: Duration,
}

impl StationConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            music_path: PathBuf::from(env_or("STATION_MUSIC_PATH", "/srv/retrowaves/music")),
            dj_path: PathBuf::from(env_or("DJ_PATH", "/srv/retrowaves/dj")),
            dj_state_path: PathBuf::from(env_or(
                "DJ_STATE_PATH",
                "/var/lib/retrowaves/dj_state.json",
            )),
            tower_host: env_or("TOWER_HOST", "127.0.0.1"),
            tower_port: env_parse("TOWER_PORT", 8005),
            pcm_socket_path: PathBuf::from(env_or(
                "TOWER_PCM_SOCKET_PATH",
                "/run/retrowaves/pcm.sock",
            )),
            shutdown_timeout: Duration::from_secs(env_parse("STATION_SHUTDOWN_TIMEOUT_SECS", 300)),
            legal_id_interval: Duration::from_secs(env_parse("STATION_LEGAL_ID_INTERVAL_SECS", 3600)),
        }
    }

    pub fn tower_events_url(&self) -> String {
        format!("http://{}:{}/tower/events/ingest", self.tower_host, self.tower_port)
    }
}
