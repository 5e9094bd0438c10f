//! Transport contract shared by both wire protocols
//!
//! A transport owns the connection to the assistant service. The session
//! engine drives it through [`Transport`] and hears back through the
//! [`TransportCallbacks`] installed before connecting. Async methods return
//! boxed futures so the engine can hold an `Arc<dyn Transport>` and run them
//! on the async bridge.

pub mod crypto;
pub mod mqtt;
pub mod split;
pub mod stream;

pub use crypto::CryptoStream;
pub use split::SplitTransport;
pub use stream::StreamTransport;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

use crate::protocol::{AbortReason, ClientMessage, ListeningMode};

pub type AudioCallback = Arc<dyn Fn(Bytes) + Send + Sync>;
pub type JsonCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Notifications a transport delivers, from whichever thread receives them
#[derive(Clone, Default)]
pub struct TransportCallbacks {
    pub on_incoming_audio: Option<AudioCallback>,
    pub on_incoming_json: Option<JsonCallback>,
    pub on_audio_channel_opened: Option<EventCallback>,
    pub on_audio_channel_closed: Option<EventCallback>,
    pub on_network_error: Option<ErrorCallback>,
}

impl TransportCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_incoming_audio(mut self, f: impl Fn(Bytes) + Send + Sync + 'static) -> Self {
        self.on_incoming_audio = Some(Arc::new(f));
        self
    }

    pub fn on_incoming_json(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_incoming_json = Some(Arc::new(f));
        self
    }

    pub fn on_audio_channel_opened(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_audio_channel_opened = Some(Arc::new(f));
        self
    }

    pub fn on_audio_channel_closed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_audio_channel_closed = Some(Arc::new(f));
        self
    }

    pub fn on_network_error(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_network_error = Some(Arc::new(f));
        self
    }

    pub(crate) fn incoming_audio(&self, frame: Bytes) {
        if let Some(cb) = &self.on_incoming_audio {
            cb(frame);
        }
    }

    pub(crate) fn incoming_json(&self, value: Value) {
        if let Some(cb) = &self.on_incoming_json {
            cb(value);
        }
    }

    pub(crate) fn channel_opened(&self) {
        if let Some(cb) = &self.on_audio_channel_opened {
            cb();
        }
    }

    pub(crate) fn channel_closed(&self) {
        if let Some(cb) = &self.on_audio_channel_closed {
            cb();
        }
    }

    pub(crate) fn network_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("Network error: {}", message);
        if let Some(cb) = &self.on_network_error {
            cb(message);
        }
    }
}

/// Callback slot shared between a transport and its background tasks
///
/// Re-installing callbacks swaps the whole set; tasks read a snapshot at
/// the moment they deliver.
#[derive(Clone, Default)]
pub(crate) struct CallbackSlot(Arc<RwLock<TransportCallbacks>>);

impl CallbackSlot {
    pub(crate) fn set(&self, callbacks: TransportCallbacks) {
        *self.0.write() = callbacks;
    }

    pub(crate) fn get(&self) -> TransportCallbacks {
        self.0.read().clone()
    }
}

/// Connection to the assistant service
pub trait Transport: Send + Sync {
    /// Install the callbacks; replaces any previous set
    fn set_callbacks(&self, callbacks: TransportCallbacks);

    /// Establish the connection and complete the handshake
    fn connect(&self) -> BoxFuture<'_, bool>;

    /// Make sure the audio channel is usable, connecting if needed
    fn open_audio_channel(&self) -> BoxFuture<'_, bool>;

    fn close_audio_channel(&self) -> BoxFuture<'_, ()>;

    fn is_audio_channel_opened(&self) -> bool;

    fn send_audio(&self, frame: Bytes) -> BoxFuture<'_, ()>;

    /// Send one JSON control message
    fn send_text(&self, text: String) -> BoxFuture<'_, ()>;

    /// Session issued by the server, empty when none is active
    fn session_id(&self) -> String;

    /// Sample rate confirmed in the server hello
    fn server_sample_rate(&self) -> Option<u32>;

    fn send_start_listening(&self, mode: ListeningMode) -> BoxFuture<'_, ()> {
        let message = ClientMessage::start_listening(&self.session_id(), mode);
        self.send_text(message.to_json())
    }

    fn send_stop_listening(&self) -> BoxFuture<'_, ()> {
        let message = ClientMessage::stop_listening(&self.session_id());
        self.send_text(message.to_json())
    }

    fn send_abort_speaking(&self, reason: AbortReason) -> BoxFuture<'_, ()> {
        let message = ClientMessage::abort(&self.session_id(), reason);
        self.send_text(message.to_json())
    }

    fn send_wake_word_detected(&self, wake_word: &str) -> BoxFuture<'_, ()> {
        let message = ClientMessage::wake_word_detected(&self.session_id(), wake_word);
        self.send_text(message.to_json())
    }
}
