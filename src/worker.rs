//! Named OS threads with cooperative stop and bounded joins
//!
//! Producer loops (pollers, the datagram receiver, the dispatcher itself)
//! watch a shared stop flag. Stopping waits a bounded time for the thread to
//! exit and abandons it afterwards, so a wedged driver call never hangs
//! shutdown.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Shared stop request observed by a worker loop
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running worker thread
pub struct Worker<T = ()> {
    name: String,
    stop: StopFlag,
    done_rx: Receiver<T>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn a named thread running `body` until it returns
    pub fn spawn<F>(name: impl Into<String>, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(StopFlag) -> T + Send + 'static,
    {
        let name = name.into();
        let stop = StopFlag::new();
        let flag = stop.clone();
        let (done_tx, done_rx) = bounded::<T>(1);

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let output = body(flag);
            let _ = done_tx.send(output);
        })?;

        Ok(Self {
            name,
            stop,
            done_rx,
            handle: Some(handle),
        })
    }

    /// Flag shared with the running loop
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to stop without waiting for it
    pub fn request_stop(&self) {
        self.stop.stop();
    }

    /// Request a stop and wait up to `timeout` for the thread to exit
    pub fn stop(self, timeout: Duration) -> Option<T> {
        self.stop.stop();
        self.join(timeout)
    }

    /// Wait up to `timeout` for the thread's result; abandon it after that
    pub fn join(mut self, timeout: Duration) -> Option<T> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(output) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                Some(output)
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Body panicked before producing a result
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                tracing::error!("Worker {} exited abnormally", self.name);
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Worker {} did not stop within {:?}, abandoning it", self.name, timeout);
                None
            }
        }
    }
}

/// Run `task` once on a short-lived detached thread after `delay`
pub fn run_after<F>(name: &str, delay: Duration, task: F) -> std::io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(move || {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        task();
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_worker_stops_on_flag() {
        let worker = Worker::spawn("test-loop", |stop| {
            let mut iterations = 0u32;
            while !stop.is_stopped() {
                iterations += 1;
                thread::sleep(Duration::from_millis(1));
            }
            iterations
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        let iterations = worker.stop(Duration::from_secs(1));
        assert!(iterations.unwrap() > 0);
    }

    #[test]
    fn test_worker_join_abandons_straggler() {
        let worker = Worker::spawn("test-straggler", |_stop| {
            thread::sleep(Duration::from_millis(500));
        })
        .unwrap();

        let started = Instant::now();
        assert!(worker.stop(Duration::from_millis(20)).is_none());
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_worker_panic_is_contained() {
        let worker = Worker::<()>::spawn("test-panic", |_stop| panic!("boom")).unwrap();
        assert!(worker.join(Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_run_after_delays() {
        let (tx, rx) = bounded(1);
        let started = Instant::now();
        run_after("test-timer", Duration::from_millis(30), move || {
            let _ = tx.send(());
        })
        .unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
