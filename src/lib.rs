//! # Voice Assistant Client
//!
//! Client-side session engine for a streaming voice assistant device.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               DEVICE                                      │
//! │  ┌────────────┐  input-ready   ┌──────────────────────────────────────┐   │
//! │  │ Microphone │───poller──────▶│          Dispatcher thread           │   │
//! │  └─────┬──────┘                │  ┌────────────────────────────────┐  │   │
//! │        │ PCM                   │  │ Session Engine (DeviceState)   │  │   │
//! │        ▼                       │  │  Idle ⇄ Connecting ⇄ Listening │  │   │
//! │  ┌────────────┐  read_frame    │  │            ⇅ Speaking          │  │   │
//! │  │ FrameCodec │◀───────────────│  └────────────────────────────────┘  │   │
//! │  │  (Opus)    │───play_pending─│  signals: Schedule | Input | Output  │   │
//! │  └─────┬──────┘                └───────────────┬──────────────────────┘   │
//! │        │ ▲ PlaybackQueue                       │ submit / spawn            │
//! │        ▼ │                                     ▼                          │
//! │  ┌────────────┐                ┌──────────────────────────────────────┐   │
//! │  │  Speaker   │                │  Async Bridge (tokio current-thread) │   │
//! │  └────────────┘                │  ┌───────────────┐ ┌───────────────┐ │   │
//! │                                │  │StreamTransport│ │SplitTransport │ │   │
//! │                                │  │  (WebSocket)  │ │ MQTT + UDP/AES│ │   │
//! │                                │  └───────┬───────┘ └───────┬───────┘ │   │
//! │                                └──────────┼─────────────────┼─────────┘   │
//! └───────────────────────────────────────────┼─────────────────┼─────────────┘
//!                                             ▼                 ▼
//!                                      Assistant service (control + audio)
//! ```

pub mod audio;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod display;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod wake_word;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Sample rate of the captured microphone stream
    pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16000;

    /// Sample rate the speaker plays back at
    pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24000;

    /// Mono audio in both directions
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Duration of one encoded frame in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: u32 = 60;

    /// Maximum frames decoded per playback cycle
    pub const PLAYBACK_BATCH_SIZE: usize = 10;

    /// Poll interval used while waiting for playback to drain
    pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Default number of drain polls before force-clearing
    pub const DRAIN_MAX_ATTEMPTS: u32 = 15;

    /// Dispatcher idle sleep between signal sweeps
    pub const DISPATCHER_TICK: Duration = Duration::from_millis(10);

    /// Output poller check period
    pub const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// Size of the nonce prefix on every encrypted datagram
    pub const NONCE_LEN: usize = 16;

    /// Largest audio payload accepted from the audio server, nonce excluded
    pub const MAX_DATAGRAM_SIZE: usize = 4096;

    /// Read timeout of the datagram receive loop
    pub const DATAGRAM_READ_TIMEOUT: Duration = Duration::from_millis(500);

    /// MQTT over TLS
    pub const MQTT_TLS_PORT: u16 = 8883;

    /// MQTT keep-alive
    pub const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(90);

    /// Bounded wait when joining worker threads
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
}
