//! Device state and its observers

use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::dispatcher::panic_message;

/// Coarse mode of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    Idle = 0,
    Connecting = 1,
    Listening = 2,
    Speaking = 3,
}

impl DeviceState {
    /// Status line pushed to the display on entry
    pub fn status_text(self) -> &'static str {
        match self {
            DeviceState::Idle => "Standby",
            DeviceState::Connecting => "Connecting...",
            DeviceState::Listening => "Listening...",
            DeviceState::Speaking => "Speaking...",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Connecting,
            2 => DeviceState::Listening,
            3 => DeviceState::Speaking,
            _ => DeviceState::Idle,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Idle => "idle",
            DeviceState::Connecting => "connecting",
            DeviceState::Listening => "listening",
            DeviceState::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// Read-only mirror of the engine's state for other threads
///
/// Written only by the dispatcher as part of each transition.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(AtomicU8::new(DeviceState::Idle as u8)))
    }
}

impl StateCell {
    pub fn get(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: DeviceState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

pub type StateObserver = Arc<dyn Fn(DeviceState, DeviceState) + Send + Sync>;

/// Ordered list of transition subscribers
#[derive(Clone, Default)]
pub struct StateObservers(Arc<Mutex<Vec<StateObserver>>>);

impl StateObservers {
    /// Subscribe to `(previous, next)` transitions
    pub fn subscribe(&self, observer: impl Fn(DeviceState, DeviceState) + Send + Sync + 'static) {
        self.0.lock().push(Arc::new(observer));
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Run every observer in subscription order; a panicking one is logged and skipped
    pub(crate) fn notify(&self, previous: DeviceState, next: DeviceState) {
        // Snapshot so observers may subscribe further observers
        let observers = self.0.lock().clone();
        for observer in observers {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(previous, next))) {
                tracing::error!("State observer panicked: {}", panic_message(&payload));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_round_trips_every_state() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), DeviceState::Idle);
        for state in [
            DeviceState::Connecting,
            DeviceState::Listening,
            DeviceState::Speaking,
            DeviceState::Idle,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let observers = StateObservers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        observers.subscribe(|_, _| panic!("observer failure"));
        let s = seen.clone();
        observers.subscribe(move |prev, next| s.lock().push((prev, next)));

        observers.notify(DeviceState::Idle, DeviceState::Connecting);
        assert_eq!(*seen.lock(), vec![(DeviceState::Idle, DeviceState::Connecting)]);
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn test_status_text() {
        assert_eq!(DeviceState::Idle.status_text(), "Standby");
        assert_eq!(DeviceState::Speaking.to_string(), "speaking");
    }
}
