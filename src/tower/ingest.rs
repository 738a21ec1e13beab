//! PCM ingestion: Unix-socket transport plus the re-framing ingestor.
//!
//! The transport accepts raw byte chunks from Station; the ingestor
//! groups them into canonical 4096-byte frames and pushes each one to the
//! upstream PCM buffer. No validation beyond size, no transformation, no
//! timing. A trailing remainder shorter than one frame waits for the next
//! chunk and is discarded when the connection closes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;

use crate::audio::frame::FRAME_BYTES;
use crate::audio::FrameRingBuffer;
use crate::error::{AppError, Result};

/// Re-frames an arbitrary byte stream into canonical PCM frames.
pub struct PcmIngestor {
    upstream: Arc<FrameRingBuffer>,
    accumulator: Vec<u8>,
    frames_received: u64,
}

impl PcmIngestor {
    pub fn new(upstream: Arc<FrameRingBuffer>) -> Self {
        Self {
            upstream,
            accumulator: Vec::with_capacity(FRAME_BYTES * 2),
            frames_received: 0,
        }
    }

    /// Handle one chunk of bytes from the transport. Every complete
    /// 4096-byte group is delivered immediately; the remainder stays in
    /// the accumulator.
    pub fn on_bytes(&mut self, data: &[u8]) {
        self.accumulator.extend_from_slice(data);
        while self.accumulator.len() >= FRAME_BYTES {
            let frame: Vec<u8> = self.accumulator.drain(..FRAME_BYTES).collect();
            self.upstream.push(Bytes::from(frame));
            self.frames_received += 1;
        }
    }

    /// Discard any partial frame, e.g. when the connection closes.
    pub fn reset(&mut self) {
        if !self.accumulator.is_empty() {
            tracing::debug!(
                bytes = self.accumulator.len(),
                "discarding partial frame on connection close"
            );
            self.accumulator.clear();
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.accumulator.len()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }
}

/// Unix-socket accept loop feeding a [`PcmIngestor`].
///
/// One connection is served at a time per task; Station reconnects are
/// accepted indefinitely.
pub struct IngestTransport {
    socket_path: PathBuf,
    upstream: Arc<FrameRingBuffer>,
    cancel: Arc<AtomicBool>,
}

impl IngestTransport {
    pub fn new(socket_path: &Path, upstream: Arc<FrameRingBuffer>) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            upstream,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind the socket and spawn the accept loop. Must be running before
    /// the audio pump starts ticking.
    pub fn start(&self) -> Result<tokio::task::JoinHandle<()>> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A stale socket file from a previous run would fail the bind.
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| AppError::Config(format!("failed to bind ingest socket: {e}")))?;

        // Group-accessible so Station can connect without running as the
        // same user.
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o660);
            if let Err(e) = std::fs::set_permissions(&self.socket_path, permissions) {
                tracing::warn!("could not set ingest socket permissions: {e}");
            }
        }
        tracing::info!(path = %self.socket_path.display(), "PCM ingest listening");

        let upstream = Arc::clone(&self.upstream);
        let cancel = Arc::clone(&self.cancel);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                if cancel.load(Ordering::SeqCst) {
                                    break;
                                }
                                let upstream = Arc::clone(&upstream);
                                let cancel = Arc::clone(&cancel);
                                tokio::spawn(async move {
                                    serve_connection(stream, upstream, cancel).await;
                                });
                            }
                            Err(e) => {
                                tracing::warn!("ingest accept error: {e}");
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                        if cancel.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
            tracing::info!("PCM ingest stopped");
        }))
    }

    pub fn stop(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn serve_connection(
    mut stream: tokio::net::UnixStream,
    upstream: Arc<FrameRingBuffer>,
    cancel: Arc<AtomicBool>,
) {
    tracing::info!("PCM ingest connection accepted");
    let mut ingestor = PcmIngestor::new(upstream);
    let mut chunk = vec![0u8; FRAME_BYTES * 4];

    loop {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => ingestor.on_bytes(&chunk[..n]),
            Err(e) => {
                tracing::debug!("ingest read error: {e}");
                break;
            }
        }
    }

    ingestor.reset();
    tracing::info!(
        frames = ingestor.frames_received(),
        "PCM ingest connection closed"
    );
}
