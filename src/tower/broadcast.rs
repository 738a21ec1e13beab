//! MP3 fanout to HTTP listeners.
//!
//! The broadcast loop pulls one frame per tick from the encoder manager
//! and hands it to every registered client without blocking: each client
//! owns a bounded queue feeding its streaming response body. A client
//! whose queue is full is dropped immediately (`queue_full`); one that
//! has not accepted a frame within the client timeout is dropped as
//! `slow_consumer`. Drops never disturb the remaining clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::tower::encoder_manager::EncoderManager;

/// Frames a client may have in flight before it counts as stalled.
pub const MAX_CLIENT_QUEUE: usize = 10;

struct ClientState {
    tx: mpsc::Sender<Bytes>,
    /// Last time a frame was accepted into the client's queue.
    last_accepted: Instant,
}

pub struct ConnectionManager {
    clients: Mutex<HashMap<u64, ClientState>>,
    next_id: AtomicU64,
    client_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(client_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            client_timeout,
        }
    }

    /// Register a new stream client; the receiver feeds its response
    /// body.
    pub fn add_client(&self) -> (u64, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(MAX_CLIENT_QUEUE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.insert(
            id,
            ClientState {
                tx,
                last_accepted: Instant::now(),
            },
        );
        tracing::info!(client = id, total = clients.len(), "stream client connected");
        (id, rx)
    }

    pub fn remove_client(&self, id: u64, reason: &str) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if clients.remove(&id).is_some() {
            tracing::info!(client = id, reason, total = clients.len(), "stream client dropped");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver one frame to every client. Lock held only to snapshot and
    /// prune the table; the sends are lock-free `try_send`s.
    pub fn broadcast(&self, frame: &Bytes) {
        let now = Instant::now();
        let snapshot: Vec<(u64, mpsc::Sender<Bytes>, Instant)> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients
                .iter()
                .map(|(id, state)| (*id, state.tx.clone(), state.last_accepted))
                .collect()
        };

        let mut accepted: Vec<u64> = Vec::new();
        let mut dropped: Vec<(u64, &'static str)> = Vec::new();

        for (id, tx, last_accepted) in snapshot {
            match tx.try_send(frame.clone()) {
                Ok(()) => accepted.push(id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if now.duration_since(last_accepted) > self.client_timeout {
                        dropped.push((id, "slow_consumer"));
                    } else {
                        dropped.push((id, "queue_full"));
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped.push((id, "disconnected"));
                }
            }
        }

        if !accepted.is_empty() || !dropped.is_empty() {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            for id in accepted {
                if let Some(state) = clients.get_mut(&id) {
                    state.last_accepted = now;
                }
            }
            for (id, reason) in dropped {
                if clients.remove(&id).is_some() {
                    tracing::info!(client = id, reason, "stream client dropped");
                }
            }
        }
    }

    /// Disconnect every client, e.g. at shutdown.
    pub fn close_all(&self) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let count = clients.len();
        clients.clear();
        if count > 0 {
            tracing::info!(count, "all stream clients dropped: shutdown");
        }
    }
}

/// The broadcast loop: absolute-time scheduled like the metronome, one
/// MP3 frame per tick to every client.
pub struct BroadcastLoop {
    encoder_manager: Arc<EncoderManager>,
    connections: Arc<ConnectionManager>,
    tick: Duration,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastLoop {
    pub fn new(
        encoder_manager: Arc<EncoderManager>,
        connections: Arc<ConnectionManager>,
        tick: Duration,
    ) -> Self {
        Self {
            encoder_manager,
            connections,
            tick,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(&self.encoder_manager);
        let connections = Arc::clone(&self.connections);
        let tick = self.tick;
        let running = Arc::clone(&self.running);

        let handle = std::thread::Builder::new()
            .name("broadcast-loop".into())
            .spawn(move || {
                let mut next_tick = Instant::now();
                let mut lag_logged = false;
                while running.load(Ordering::SeqCst) {
                    let frame = manager.get_frame();
                    connections.broadcast(&frame);

                    next_tick += tick;
                    let now = Instant::now();
                    if next_tick > now {
                        std::thread::sleep(next_tick - now);
                        lag_logged = false;
                    } else {
                        if !lag_logged {
                            tracing::warn!("broadcast loop behind schedule, resyncing");
                            lag_logged = true;
                        }
                        next_tick = now;
                    }
                }
            })
            .expect("failed to spawn broadcast loop");
        *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "broadcast loop started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.connections.close_all();
        tracing::info!("broadcast loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 32])
    }

    #[test]
    fn every_client_receives_every_frame_in_order() {
        let manager = ConnectionManager::new(Duration::from_millis(250));
        let (_a, mut rx_a) = manager.add_client();
        let (_b, mut rx_b) = manager.add_client();

        for tag in 0..3 {
            manager.broadcast(&frame(tag));
        }
        for rx in [&mut rx_a, &mut rx_b] {
            for tag in 0..3 {
                assert_eq!(rx.try_recv().unwrap()[0], tag);
            }
        }
    }

    #[test]
    fn full_queue_drops_only_the_stalled_client() {
        let manager = ConnectionManager::new(Duration::from_millis(250));
        let (stalled_id, rx_stalled) = manager.add_client();
        let (_ok_id, mut rx_ok) = manager.add_client();

        // The stalled client never drains its queue.
        for tag in 0..(MAX_CLIENT_QUEUE as u8 + 1) {
            manager.broadcast(&frame(tag));
        }

        assert_eq!(manager.client_count(), 1, "stalled client must be gone");
        // The healthy client still has every frame, in order.
        for tag in 0..(MAX_CLIENT_QUEUE as u8 + 1) {
            assert_eq!(rx_ok.try_recv().unwrap()[0], tag);
        }
        drop(rx_stalled);
        manager.remove_client(stalled_id, "test cleanup");
    }

    #[test]
    fn slow_consumer_reason_after_timeout() {
        let manager = ConnectionManager::new(Duration::from_millis(10));
        let (_id, _rx) = manager.add_client();

        for tag in 0..(MAX_CLIENT_QUEUE as u8) {
            manager.broadcast(&frame(tag));
        }
        assert_eq!(manager.client_count(), 1);

        std::thread::sleep(Duration::from_millis(20));
        manager.broadcast(&frame(99));
        assert_eq!(manager.client_count(), 0);
    }

    #[test]
    fn closed_receiver_is_pruned() {
        let manager = ConnectionManager::new(Duration::from_millis(250));
        let (_id, rx) = manager.add_client();
        drop(rx);
        manager.broadcast(&frame(1));
        assert_eq!(manager.client_count(), 0);
    }

    #[test]
    fn close_all_empties_the_table() {
        let manager = ConnectionManager::new(Duration::from_millis(250));
        let _clients: Vec<_> = (0..5).map(|_| manager.add_client()).collect();
        assert_eq!(manager.client_count(), 5);
        manager.close_all();
        assert_eq!(manager.client_count(), 0);
    }
}
