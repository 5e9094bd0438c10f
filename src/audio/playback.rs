//! Speaker playback through cpal
//!
//! Mirrors the capture side: a stream thread owns the cpal stream and its
//! data callback pulls from a shared sample buffer, padding with silence
//! when the buffer runs dry.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::device::find_output_device;
use super::stream::OutputStream;
use crate::constants::JOIN_TIMEOUT;
use crate::error::AudioError;
use crate::worker::Worker;

const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on how long `stop` waits for written audio to play out
const MAX_PLAY_OUT: Duration = Duration::from_secs(3);

/// Speaker stream on a named or default output device
pub struct CpalOutputStream {
    device_name: Option<String>,
    config: StreamConfig,
    samples: Arc<Mutex<VecDeque<i16>>>,
    underruns: Arc<AtomicU64>,
    worker: Option<Worker<()>>,
}

impl CpalOutputStream {
    pub fn new(device_name: Option<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            device_name,
            config: StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            samples: Arc::new(Mutex::new(VecDeque::new())),
            underruns: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Callbacks that found the buffer empty while audio was expected
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Samples written but not yet consumed by the device
    pub fn buffered(&self) -> usize {
        self.samples.lock().len()
    }
}

impl OutputStream for CpalOutputStream {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.is_active() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let config = self.config.clone();
        let samples = self.samples.clone();
        let underruns = self.underruns.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let worker = Worker::spawn("speaker-playback", move |stop| {
            let device = match find_output_device(device_name.as_deref()) {
                Ok(device) => device,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let stream = device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = samples.lock();
                    let available = buffer.len();
                    for (i, out) in data.iter_mut().enumerate() {
                        *out = match buffer.pop_front() {
                            Some(s) => s as f32 / 32768.0,
                            None => 0.0,
                        };
                        if i == available && available > 0 {
                            underruns.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                },
                move |err| {
                    tracing::error!("Speaker stream error: {}", err);
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

            while !stop.is_stopped() {
                thread::sleep(Duration::from_millis(10));
            }
        })
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                tracing::info!(
                    "Speaker started: {} Hz, {} ch",
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
                Err(AudioError::StreamError("speaker did not start in time".to_string()))
            }
        }
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + MAX_PLAY_OUT;
        while !self.samples.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        self.samples.lock().clear();

        worker.stop(JOIN_TIMEOUT);
        tracing::info!("Speaker stopped");
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    fn write(&mut self, pcm: &[i16]) -> Result<(), AudioError> {
        if !self.is_active() {
            return Err(AudioError::StreamInactive);
        }
        self.samples.lock().extend(pcm.iter().copied());
        Ok(())
    }

    fn discard(&mut self) {
        self.samples.lock().clear();
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        self.discard();
        let _ = OutputStream::stop(self);
    }
}
