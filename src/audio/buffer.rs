//! Playback queue for encoded downlink frames
//!
//! Written by the transport's receive thread, read by the dispatcher when
//! it plays a batch. The queue is unbounded; it only shrinks through
//! playback or an explicit clear.

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ordered, thread-safe queue of encoded frames
pub struct PlaybackQueue {
    queue: SegQueue<Bytes>,
    enqueued: AtomicU64,
    discarded: AtomicU64,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            enqueued: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Append a frame at the tail
    pub fn push(&self, frame: Bytes) {
        self.queue.push(frame);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Pop up to `max` frames in arrival order
    pub fn pop_batch(&self, max: usize) -> Vec<Bytes> {
        let mut batch = Vec::with_capacity(max.min(self.queue.len()));
        while batch.len() < max {
            match self.queue.pop() {
                Some(frame) => batch.push(frame),
                None => break,
            }
        }
        batch
    }

    /// Drop every queued frame without decoding; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        self.discarded.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            depth: self.len(),
        }
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub discarded: u64,
    pub depth: usize,
}
