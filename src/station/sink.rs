//! PCM output sink: Station's side of the bridge.
//!
//! Writes canonical frames to Tower's Unix ingest socket without ever
//! blocking playout. A full socket buffer or a missing Tower drops frames
//! silently; reconnects are rate-limited to one attempt per second.
//! Station pushes as fast as the decoder produces; Tower owns all
//! timing.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::audio::frame::FRAME_BYTES;

/// Where playout sends decoded PCM. Object-safe so tests can capture
/// frames in memory.
pub trait PcmSink: Send {
    /// Queue bytes for delivery. Never blocks; excess is dropped, not
    /// deferred.
    fn write(&mut self, pcm: &[u8]);

    /// Close the transport. Further writes are discarded.
    fn close(&mut self);
}

pub struct TowerPcmSink {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
    /// Bytes waiting to complete the next canonical frame.
    accumulator: Vec<u8>,
    last_connect_attempt: Option<Instant>,
    reconnect_delay: Duration,
    frames_sent: u64,
    closed: bool,
}

impl TowerPcmSink {
    pub fn new(socket_path: &Path) -> Self {
        let mut sink = Self {
            socket_path: socket_path.to_path_buf(),
            stream: None,
            accumulator: Vec::with_capacity(FRAME_BYTES * 2),
            last_connect_attempt: None,
            reconnect_delay: Duration::from_secs(1),
            frames_sent: 0,
            closed: false,
        };
        sink.try_connect();
        sink
    }

    fn try_connect(&mut self) -> bool {
        if self.stream.is_some() {
            return true;
        }
        if let Some(last) = self.last_connect_attempt {
            if last.elapsed() < self.reconnect_delay {
                return false;
            }
        }
        self.last_connect_attempt = Some(Instant::now());

        match UnixStream::connect(&self.socket_path) {
            Ok(stream) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    tracing::warn!("failed to set sink non-blocking: {e}");
                    return false;
                }
                tracing::info!(path = %self.socket_path.display(), "connected to Tower PCM socket");
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                tracing::debug!(path = %self.socket_path.display(), "Tower PCM socket unavailable: {e}");
                false
            }
        }
    }

    fn send_frame(&mut self, frame: &[u8]) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        match stream.write(frame) {
            Ok(n) if n == frame.len() => {
                self.frames_sent += 1;
            }
            Ok(_) => {
                // Short write on a SOCK_STREAM socket leaves Tower
                // mid-frame; the ingestor re-aligns by size, we just
                // count it as dropped.
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // Tower is not reading fast enough; drop and move on.
            }
            Err(e) => {
                tracing::warn!(frames_sent = self.frames_sent, "Tower PCM socket error: {e}");
                self.stream = None;
            }
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }
}

impl PcmSink for TowerPcmSink {
    fn write(&mut self, pcm: &[u8]) {
        if self.closed {
            return;
        }
        if !self.try_connect() {
            // Disconnected: drop, keeping at most one frame of remainder.
            self.accumulator.clear();
            return;
        }

        self.accumulator.extend_from_slice(pcm);
        while self.accumulator.len() >= FRAME_BYTES {
            let frame: Vec<u8> = self.accumulator.drain(..FRAME_BYTES).collect();
            self.send_frame(&frame);
            if self.stream.is_none() {
                self.accumulator.clear();
                return;
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.accumulator.clear();
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        tracing::info!(frames_sent = self.frames_sent, "Tower PCM sink closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    #[test]
    fn frames_arrive_whole_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcm.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut sink = TowerPcmSink::new(&path);
        let (mut server, _) = listener.accept().unwrap();

        sink.write(&vec![1u8; FRAME_BYTES]);
        sink.write(&vec![2u8; FRAME_BYTES / 2]);
        sink.write(&vec![2u8; FRAME_BYTES / 2]);
        sink.close();

        let mut received = Vec::new();
        server.read_to_end(&mut received).unwrap();
        assert_eq!(received.len(), FRAME_BYTES * 2);
        assert_eq!(received[0], 1);
        assert_eq!(received[FRAME_BYTES], 2);
    }

    #[test]
    fn missing_tower_drops_silently() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TowerPcmSink::new(&dir.path().join("absent.sock"));
        // Must not block or panic.
        sink.write(&vec![0u8; FRAME_BYTES * 4]);
        assert_eq!(sink.frames_sent(), 0);
    }

    #[test]
    fn writes_after_close_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcm.sock");
        let _listener = UnixListener::bind(&path).unwrap();
        let mut sink = TowerPcmSink::new(&path);
        sink.close();
        sink.write(&vec![0u8; FRAME_BYTES]);
        assert_eq!(sink.frames_sent(), 0);
    }
}
