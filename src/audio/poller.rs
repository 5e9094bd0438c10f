//! Audio readiness pollers
//!
//! Two producer threads watch the frame codec and raise dispatcher signals;
//! neither touches audio data itself.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::frame_codec::FrameCodec;
use crate::constants::JOIN_TIMEOUT;
use crate::worker::Worker;

/// The running input and output pollers
pub struct AudioPollers {
    input: Option<Worker<()>>,
    output: Option<Worker<()>>,
}

impl AudioPollers {
    /// Start both pollers
    ///
    /// `on_input` fires once per `frame_interval` while the microphone is
    /// active; `on_output` fires every `output_interval` while frames wait
    /// for playback.
    pub fn start<I, O>(
        codec: Arc<FrameCodec>,
        frame_interval: Duration,
        output_interval: Duration,
        on_input: I,
        on_output: O,
    ) -> std::io::Result<Self>
    where
        I: Fn() + Send + 'static,
        O: Fn() + Send + 'static,
    {
        let input_codec = codec.clone();
        let input = Worker::spawn("input-poller", move |stop| {
            while !stop.is_stopped() {
                if input_codec.is_input_active() {
                    on_input();
                }
                thread::sleep(frame_interval);
            }
        })?;

        let output = match Worker::spawn("output-poller", move |stop| {
            while !stop.is_stopped() {
                if codec.has_pending() {
                    on_output();
                }
                thread::sleep(output_interval);
            }
        }) {
            Ok(worker) => worker,
            Err(e) => {
                input.stop(JOIN_TIMEOUT);
                return Err(e);
            }
        };

        tracing::debug!("Audio pollers started");
        Ok(Self {
            input: Some(input),
            output: Some(output),
        })
    }

    /// Stop both pollers with a bounded wait each
    pub fn stop(mut self) {
        for worker in [self.input.take(), self.output.take()].into_iter().flatten() {
            worker.request_stop();
            worker.join(JOIN_TIMEOUT);
        }
        tracing::debug!("Audio pollers stopped");
    }
}

impl Drop for AudioPollers {
    fn drop(&mut self) {
        for worker in [self.input.take(), self.output.take()].into_iter().flatten() {
            worker.request_stop();
        }
    }
}
