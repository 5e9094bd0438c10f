//! Async bridge between the dispatcher thread and transport coroutines
//!
//! Transports are written as async code. They run on a current-thread tokio
//! runtime driven by its own OS thread; the dispatcher reaches it through a
//! [`BridgeHandle`], either fire-and-forget or by blocking for the result
//! with a timeout.

use crossbeam_channel::{bounded, RecvTimeoutError};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::worker::Worker;

/// Owner of the bridge thread
pub struct AsyncBridge {
    handle: BridgeHandle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<Worker<()>>,
}

impl AsyncBridge {
    /// Build the runtime and start driving it on a dedicated thread
    pub fn start() -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let worker = Worker::spawn("async-bridge", move |_stop| {
            tracing::debug!("Async bridge loop started");
            runtime.block_on(async {
                let _ = shutdown_rx.await;
            });
            runtime.shutdown_timeout(Duration::from_millis(500));
            tracing::debug!("Async bridge loop stopped");
        })?;

        Ok(Self {
            handle: BridgeHandle { handle },
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Stop the loop and wait a bounded time for its thread
    pub fn shutdown(mut self, timeout: Duration) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            worker.join(timeout);
        }
    }
}

/// Cloneable submit handle usable from any thread except the bridge's own
#[derive(Clone)]
pub struct BridgeHandle {
    handle: Handle,
}

impl BridgeHandle {
    /// Run a future on the bridge without waiting for it
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }

    /// Run a future on the bridge and block the caller for its output
    ///
    /// Must not be called from a task already running on the bridge.
    pub fn call<F, T>(&self, fut: F, timeout: Duration) -> Result<T, TransportError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = bounded::<T>(1);
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });

        match rx.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout("async bridge call")),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::BridgeClosed),
        }
    }
}
