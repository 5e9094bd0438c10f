//! Client session: device state machine, engine and façade

pub mod client;
pub mod engine;
pub mod state;

pub use client::{Client, ClientParts};
pub use engine::SessionEngine;
pub use state::{DeviceState, StateCell, StateObservers};
