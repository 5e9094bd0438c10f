//! Microphone capture through cpal
//!
//! cpal streams are not `Send`, so each capture runs its stream on a
//! dedicated thread that lives until the capture is stopped. The data
//! callback converts to i16 and appends to a shared sample buffer that
//! [`InputStream::read`] drains one frame at a time.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::device::find_input_device;
use super::stream::InputStream;
use crate::constants::JOIN_TIMEOUT;
use crate::error::AudioError;
use crate::worker::Worker;

/// Longest backlog kept before the oldest samples are dropped
const MAX_BACKLOG_SECONDS: usize = 2;

/// How long `start` waits for the stream thread to report back
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Microphone stream on a named or default input device
pub struct CpalInputStream {
    device_name: Option<String>,
    config: StreamConfig,
    samples: Arc<Mutex<VecDeque<i16>>>,
    overflowed: Arc<AtomicU64>,
    worker: Option<Worker<()>>,
}

impl CpalInputStream {
    pub fn new(device_name: Option<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            device_name,
            config: StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            samples: Arc::new(Mutex::new(VecDeque::new())),
            overflowed: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Samples dropped because nobody read them in time
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    fn backlog_limit(&self) -> usize {
        self.config.sample_rate.0 as usize * self.config.channels as usize * MAX_BACKLOG_SECONDS
    }
}

impl InputStream for CpalInputStream {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.is_active() {
            return Ok(());
        }

        self.samples.lock().clear();
        let device_name = self.device_name.clone();
        let config = self.config.clone();
        let samples = self.samples.clone();
        let overflowed = self.overflowed.clone();
        let limit = self.backlog_limit();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let worker = Worker::spawn("mic-capture", move |stop| {
            let device = match find_input_device(device_name.as_deref()) {
                Ok(device) => device,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let stream = device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mut buffer = samples.lock();
                    buffer.extend(data.iter().map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16));
                    if buffer.len() > limit {
                        let excess = buffer.len() - limit;
                        buffer.drain(..excess);
                        overflowed.fetch_add(excess as u64, Ordering::Relaxed);
                    }
                },
                move |err| {
                    tracing::error!("Microphone stream error: {}", err);
                },
                None,
            );

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Keep thread alive while running
            while !stop.is_stopped() {
                thread::sleep(Duration::from_millis(10));
            }
            // Stream is dropped here, stopping capture
        })
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                tracing::info!(
                    "Microphone started: {} Hz, {} ch",
                    self.config.sample_rate.0,
                    self.config.channels
                );
                self.worker = Some(worker);
                Ok(())
            }
            Ok(Err(e)) => {
                worker.stop(JOIN_TIMEOUT);
                Err(e)
            }
            Err(_) => {
                worker.stop(JOIN_TIMEOUT);
                Err(AudioError::StreamError("microphone did not start in time".to_string()))
            }
        }
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if let Some(worker) = self.worker.take() {
            worker.stop(JOIN_TIMEOUT);
            tracing::info!("Microphone stopped");
        }
        self.samples.lock().clear();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    fn read(&mut self, samples: usize) -> Result<Option<Vec<i16>>, AudioError> {
        if !self.is_active() {
            return Err(AudioError::StreamInactive);
        }
        let mut buffer = self.samples.lock();
        if buffer.len() < samples {
            return Ok(None);
        }
        Ok(Some(buffer.drain(..samples).collect()))
    }
}

impl Drop for CpalInputStream {
    fn drop(&mut self) {
        let _ = InputStream::stop(self);
    }
}
