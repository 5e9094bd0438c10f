//! Error types for the voice assistant client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Microphone and speaker stream errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Stream is not active")]
    StreamInactive,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Connection-level errors raised by the transports
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Incomplete connection settings: {0}")]
    IncompleteSettings(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Transport is not initialized")]
    NotInitialized,

    #[error("Async bridge is shut down")]
    BridgeClosed,
}

/// Malformed or unexpected peer input
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("Unsupported transport in server hello: {0:?}")]
    UnsupportedTransport(Option<String>),

    #[error("Server hello is missing the udp block")]
    MissingUdpBlock,

    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("Payload too large for one datagram: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid hex field {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    #[error("Stale packet sequence {received} (last {last})")]
    StaleSequence { received: u32, last: u32 },
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No configuration directory available")]
    NoConfigDir,

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;
