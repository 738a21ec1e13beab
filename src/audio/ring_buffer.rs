//! Bounded FIFO of opaque byte frames.
//!
//! The single suspension primitive of the audio path: producers never
//! block, consumers block at most for a finite timeout.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

/// What happens to a push when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest frame, append the new one.
    DropOldest,
    /// Discard the incoming frame.
    DropNewest,
}

/// Counters exposed on the status endpoints.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BufferStats {
    pub count: usize,
    pub capacity: usize,
    pub overflow_count: u64,
}

struct Inner {
    frames: VecDeque<Bytes>,
    overflow_count: u64,
}

pub struct FrameRingBuffer {
    inner: Mutex<Inner>,
    available: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    /// When set, pushes of any other size are rejected.
    expected_frame_size: Option<usize>,
}

impl FrameRingBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                overflow_count: 0,
            }),
            available: Condvar::new(),
            capacity,
            policy,
            expected_frame_size: None,
        }
    }

    pub fn with_frame_size(capacity: usize, policy: OverflowPolicy, frame_size: usize) -> Self {
        let mut buffer = Self::new(capacity, policy);
        buffer.expected_frame_size = Some(frame_size);
        buffer
    }

    /// Append a frame without ever blocking. Returns false when the frame
    /// was rejected (wrong size) or discarded (drop-newest overflow).
    pub fn push(&self, frame: Bytes) -> bool {
        if let Some(expected) = self.expected_frame_size {
            if frame.len() != expected {
                tracing::debug!(
                    got = frame.len(),
                    expected,
                    "rejecting frame with unexpected size"
                );
                return false;
            }
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.frames.len() >= self.capacity {
            inner.overflow_count += 1;
            match self.policy {
                OverflowPolicy::DropOldest => {
                    inner.frames.pop_front();
                }
                OverflowPolicy::DropNewest => {
                    return false;
                }
            }
        }
        inner.frames.push_back(frame);
        drop(inner);
        self.available.notify_all();
        true
    }

    /// Remove and return the oldest frame. `timeout` of `None` means
    /// non-blocking; a finite timeout bounds the wait. There is no
    /// wait-forever variant.
    pub fn pop(&self, timeout: Option<Duration>) -> Option<Bytes> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(frame) = inner.frames.pop_front() {
            return Some(frame);
        }

        let mut remaining = timeout?;
        loop {
            let start = std::time::Instant::now();
            let (guard, result) = self
                .available
                .wait_timeout(inner, remaining)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
            if let Some(frame) = inner.frames.pop_front() {
                return Some(frame);
            }
            if result.timed_out() {
                return None;
            }
            // Spurious wakeup: keep waiting out the remainder.
            remaining = remaining.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_count(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .overflow_count
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        BufferStats {
            count: inner.frames.len(),
            capacity: self.capacity,
            overflow_count: inner.overflow_count,
        }
    }

    /// Drop all buffered frames.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .frames
            .clear();
    }
}
