//! Frame codec adapter
//!
//! Sits between the raw PCM streams and the session engine. Uplink audio is
//! read and encoded one 60 ms frame at a time; downlink frames are queued by
//! the transport and decoded in batches on the dispatcher thread.
//!
//! All methods take `&self` so one adapter can be shared between the
//! dispatcher, the transport's receive thread and the drain timers.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use super::buffer::{PlaybackQueue, QueueStats};
use super::stream::{InputStream, OutputStream};
use crate::codec::{FrameDecoder, FrameEncoder};
use crate::constants::{DRAIN_POLL_INTERVAL, PLAYBACK_BATCH_SIZE};
use crate::error::AudioError;

pub struct FrameCodec {
    input: Mutex<Box<dyn InputStream>>,
    output: Mutex<Box<dyn OutputStream>>,
    encoder: Mutex<Box<dyn FrameEncoder>>,
    decoder: Mutex<Box<dyn FrameDecoder>>,
    queue: PlaybackQueue,
    decode_errors: AtomicU64,
    batch_size: usize,
    drain_interval: Duration,
}

impl FrameCodec {
    pub fn new(
        input: Box<dyn InputStream>,
        output: Box<dyn OutputStream>,
        encoder: Box<dyn FrameEncoder>,
        decoder: Box<dyn FrameDecoder>,
    ) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            queue: PlaybackQueue::new(),
            decode_errors: AtomicU64::new(0),
            batch_size: PLAYBACK_BATCH_SIZE,
            drain_interval: DRAIN_POLL_INTERVAL,
        }
    }

    /// Override the sleep between drain polls
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Read and encode one frame of microphone audio
    ///
    /// Returns `None` when the input is inactive, not enough audio is
    /// buffered yet, or the read or encode failed.
    pub fn read_frame(&self) -> Option<Bytes> {
        let samples = self.encoder.lock().samples_per_frame();

        let pcm = {
            let mut input = self.input.lock();
            if !input.is_active() {
                return None;
            }
            match input.read(samples) {
                Ok(Some(pcm)) => pcm,
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!("Microphone read failed: {}", e);
                    return None;
                }
            }
        };

        match self.encoder.lock().encode(&pcm) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::error!("Failed to encode microphone frame: {}", e);
                None
            }
        }
    }

    /// Queue one downlink frame for playback
    pub fn write_frame(&self, frame: Bytes) {
        self.queue.push(frame);
    }

    /// Decode up to one batch of queued frames and hand the PCM to the speaker
    ///
    /// Frames that fail to decode are counted and skipped. Returns `true`
    /// when audio was written to the output stream.
    pub fn play_pending(&self) -> bool {
        let frames = self.queue.pop_batch(self.batch_size);
        if frames.is_empty() {
            return false;
        }

        let mut pcm = Vec::new();
        {
            let mut decoder = self.decoder.lock();
            for frame in &frames {
                match decoder.decode(frame) {
                    Ok(samples) => pcm.extend_from_slice(&samples),
                    Err(e) => {
                        self.decode_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!("Dropping undecodable frame ({} bytes): {}", frame.len(), e);
                    }
                }
            }
        }
        if pcm.is_empty() {
            return false;
        }

        let mut output = self.output.lock();
        if !output.is_active() {
            tracing::debug!("Output stream inactive, restarting it");
            if let Err(e) = output.start() {
                tracing::error!("Failed to restart output stream: {}", e);
                return false;
            }
        }
        match output.write(&pcm) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Speaker write failed: {}", e);
                false
            }
        }
    }

    /// Discard queued frames and anything the speaker has not played yet
    pub fn clear(&self) -> usize {
        let dropped = self.queue.clear();
        self.output.lock().discard();
        if dropped > 0 {
            tracing::debug!("Discarded {} queued frames", dropped);
        }
        dropped
    }

    /// Wait for the playback queue to empty, then force-clear whatever is left
    ///
    /// Polls every drain interval, up to `max_attempts` times. Someone else
    /// must be consuming the queue; this only watches it. Returns whether the
    /// queue drained on its own.
    pub fn drain_and_wait(&self, max_attempts: u32) -> bool {
        let mut attempts = 0;
        while !self.queue.is_empty() && attempts < max_attempts {
            thread::sleep(self.drain_interval);
            attempts += 1;
        }

        let drained = self.queue.is_empty();
        let dropped = self.queue.clear();
        if !drained {
            tracing::warn!("Playback did not drain after {} polls, dropped {} frames", attempts, dropped);
        }
        drained
    }

    /// Play out every queued frame on the calling thread, bounded by `max_batches`
    ///
    /// Used when the caller is itself the queue's consumer. Anything left
    /// after the bound is dropped.
    pub fn flush_playback(&self, max_batches: u32) {
        let mut batches = 0;
        while !self.queue.is_empty() && batches < max_batches {
            self.play_pending();
            batches += 1;
        }
        let dropped = self.queue.clear();
        if dropped > 0 {
            tracing::warn!("Dropped {} frames left after flushing playback", dropped);
        }
    }

    pub fn start_input(&self) -> Result<(), AudioError> {
        self.input.lock().start()
    }

    pub fn stop_input(&self) -> Result<(), AudioError> {
        self.input.lock().stop()
    }

    pub fn start_output(&self) -> Result<(), AudioError> {
        self.output.lock().start()
    }

    pub fn stop_output(&self) -> Result<(), AudioError> {
        self.output.lock().stop()
    }

    /// Stop the speaker unless `still_wanted` says otherwise once the stream is held
    ///
    /// Returns whether the stream was stopped.
    pub fn stop_output_unless(&self, still_wanted: impl FnOnce() -> bool) -> Result<bool, AudioError> {
        let mut output = self.output.lock();
        if !output.is_active() || still_wanted() {
            return Ok(false);
        }
        output.stop()?;
        Ok(true)
    }

    pub fn is_input_active(&self) -> bool {
        self.input.lock().is_active()
    }

    pub fn is_output_active(&self) -> bool {
        self.output.lock().is_active()
    }

    /// Frames waiting for playback
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}
