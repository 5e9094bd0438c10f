//! Control message schema shared by both transports
//!
//! Every control message is a JSON object tagged by `type`. Messages the
//! client sends while a session is active carry the server-issued
//! `session_id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{DEFAULT_CHANNELS, DEFAULT_FRAME_DURATION_MS, DEFAULT_INPUT_SAMPLE_RATE};
use crate::error::ProtocolError;

/// How an utterance ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListeningMode {
    /// The user ends the utterance explicitly
    #[serde(rename = "manual")]
    Manual,
    /// The server detects end-of-utterance
    #[serde(rename = "auto")]
    AutoStop,
    /// Full duplex, the microphone never closes
    #[serde(rename = "realtime")]
    AlwaysOn,
}

/// Reason carried on an abort request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    None,
    WakeWordDetected,
}

/// `listen` message states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

/// Audio parameters advertised in the client hello
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            format: "opus".to_string(),
            sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_duration: DEFAULT_FRAME_DURATION_MS,
        }
    }
}

/// Messages sent from the device to the service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        version: u8,
        transport: String,
        audio_params: AudioParams,
    },
    Listen {
        session_id: String,
        state: ListenState,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<ListeningMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Abort {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<AbortReason>,
    },
    Goodbye {
        session_id: String,
    },
}

impl ClientMessage {
    pub fn hello(version: u8, transport: &str, audio_params: AudioParams) -> Self {
        ClientMessage::Hello {
            version,
            transport: transport.to_string(),
            audio_params,
        }
    }

    pub fn start_listening(session_id: &str, mode: ListeningMode) -> Self {
        ClientMessage::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Start,
            mode: Some(mode),
            text: None,
        }
    }

    pub fn stop_listening(session_id: &str) -> Self {
        ClientMessage::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Stop,
            mode: None,
            text: None,
        }
    }

    pub fn wake_word_detected(session_id: &str, wake_word: &str) -> Self {
        ClientMessage::Listen {
            session_id: session_id.to_string(),
            state: ListenState::Detect,
            mode: None,
            text: Some(wake_word.to_string()),
        }
    }

    /// Abort requests only name a reason when there is one
    pub fn abort(session_id: &str, reason: AbortReason) -> Self {
        ClientMessage::Abort {
            session_id: session_id.to_string(),
            reason: match reason {
                AbortReason::None => None,
                other => Some(other),
            },
        }
    }

    pub fn goodbye(session_id: &str) -> Self {
        ClientMessage::Goodbye {
            session_id: session_id.to_string(),
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> String {
        // Serializing plain strings and integers cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// `audio_params` block of the server hello
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerAudioParams {
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub frame_duration: Option<u32>,
}

/// `udp` block of the split-transport server hello
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UdpInfo {
    pub server: String,
    pub port: u16,
    pub key: String,
    pub nonce: String,
}

/// Handshake reply from the service
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerHello {
    pub transport: Option<String>,
    pub session_id: Option<String>,
    pub audio_params: Option<ServerAudioParams>,
    pub udp: Option<UdpInfo>,
}

impl ServerHello {
    /// Check that the reply is meant for the given transport kind
    pub fn expect_transport(&self, kind: &str) -> Result<(), ProtocolError> {
        match self.transport.as_deref() {
            Some(t) if t == kind => Ok(()),
            other => Err(ProtocolError::UnsupportedTransport(other.map(str::to_string))),
        }
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.audio_params.as_ref().and_then(|p| p.sample_rate)
    }
}

/// Speech synthesis progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    #[serde(other)]
    Other,
}

/// Messages received from the service
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello(ServerHello),
    Tts {
        state: TtsState,
        #[serde(default)]
        text: Option<String>,
    },
    Stt {
        #[serde(default)]
        text: Option<String>,
    },
    Llm {
        #[serde(default)]
        emotion: Option<String>,
    },
    Goodbye {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a raw text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Interpret an already-decoded JSON object
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        Ok(Self::deserialize(value)?)
    }
}

/// The `type` field of a raw message, for logging
pub fn message_type(value: &Value) -> &str {
    value.get("type").and_then(Value::as_str).unwrap_or("")
}
