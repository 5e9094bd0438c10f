//! Thread-safe client façade
//!
//! Builds the dispatcher, the async bridge and the session engine, wires the
//! transport and wake-word callbacks into scheduled engine tasks, and exposes
//! the user intents a front end calls from any thread.

use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::engine::{EngineParts, SessionEngine};
use super::state::{DeviceState, StateCell, StateObservers};
use crate::audio::FrameCodec;
use crate::bridge::AsyncBridge;
use crate::config::SessionConfig;
use crate::constants::JOIN_TIMEOUT;
use crate::dispatcher::{Dispatcher, Scheduler, Signal};
use crate::display::Display;
use crate::protocol::{message_type, AbortReason, ServerMessage, TtsState};
use crate::transport::{Transport, TransportCallbacks};
use crate::wake_word::WakeWordSpotter;

/// Bound on closing the audio channel during shutdown
const SHUTDOWN_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything a client is assembled from
pub struct ClientParts {
    pub transport: Arc<dyn Transport>,
    pub codec: Arc<FrameCodec>,
    pub display: Box<dyn Display>,
    pub wake_word: Option<Arc<dyn WakeWordSpotter>>,
    pub session: SessionConfig,
    /// Duration of one uplink frame, the input poller period
    pub frame_interval: Duration,
}

/// Handle to a running session engine
pub struct Client {
    scheduler: Scheduler<SessionEngine>,
    dispatcher: Option<Dispatcher<SessionEngine>>,
    bridge: Option<AsyncBridge>,
    transport: Arc<dyn Transport>,
    codec: Arc<FrameCodec>,
    wake_word: Option<Arc<dyn WakeWordSpotter>>,
    cell: StateCell,
    observers: StateObservers,
}

impl Client {
    /// Start the bridge and dispatcher threads and install all callbacks
    ///
    /// Nothing connects until the first listen request.
    pub fn start(parts: ClientParts) -> crate::Result<Self> {
        let bridge = AsyncBridge::start()?;
        let scheduler: Scheduler<SessionEngine> = Scheduler::new();
        let cell = StateCell::default();
        let observers = StateObservers::default();
        let speech_pending = Arc::new(AtomicBool::new(false));

        let callbacks = transport_callbacks(
            scheduler.clone(),
            cell.clone(),
            parts.codec.clone(),
            speech_pending.clone(),
        );
        parts.transport.set_callbacks(callbacks.clone());

        if let Some(spotter) = &parts.wake_word {
            install_wake_word(spotter.as_ref(), scheduler.clone(), cell.clone());
            if let Err(e) = spotter.start() {
                tracing::warn!("Wake-word spotter did not start: {}", e);
            }
        }

        let engine = SessionEngine::new(EngineParts {
            transport: parts.transport.clone(),
            callbacks,
            codec: parts.codec.clone(),
            display: parts.display,
            wake_word: parts.wake_word.clone(),
            bridge: bridge.handle(),
            scheduler: scheduler.clone(),
            cell: cell.clone(),
            observers: observers.clone(),
            speech_pending,
            config: parts.session,
            frame_interval: parts.frame_interval,
        });
        let dispatcher = Dispatcher::spawn(scheduler.clone(), engine)?;
        tracing::info!("Client started");

        Ok(Self {
            scheduler,
            dispatcher: Some(dispatcher),
            bridge: Some(bridge),
            transport: parts.transport,
            codec: parts.codec,
            wake_word: parts.wake_word,
            cell,
            observers,
        })
    }

    /// Start a conversation, interrupt speech, or end listening, depending on state
    pub fn toggle_chat_state(&self) {
        self.scheduler.schedule(|engine| engine.toggle_chat_state());
    }

    /// Push-to-talk press
    pub fn start_listening(&self) {
        self.scheduler.schedule(|engine| engine.start_listening());
    }

    /// Push-to-talk release
    pub fn stop_listening(&self) {
        self.scheduler.schedule(|engine| engine.stop_listening());
    }

    /// Interrupt speech; repeated requests before the first runs are collapsed
    pub fn abort_speaking(&self, reason: AbortReason) {
        self.scheduler.schedule_abort(move |engine| engine.abort_speaking(reason));
    }

    pub fn set_auto_mode(&self, enabled: bool) {
        self.scheduler.schedule(move |engine| engine.set_auto_mode(enabled));
    }

    /// Subscribe to `(previous, next)` state transitions
    ///
    /// Observers run on the dispatcher thread inside the transition.
    pub fn on_state_changed(&self, observer: impl Fn(DeviceState, DeviceState) + Send + Sync + 'static) {
        self.observers.subscribe(observer);
    }

    pub fn device_state(&self) -> DeviceState {
        self.cell.get()
    }

    pub fn codec(&self) -> &Arc<FrameCodec> {
        &self.codec
    }

    /// Close the channel and stop every thread, each with a bounded wait
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(dispatcher) = self.dispatcher.take() else {
            return;
        };
        tracing::info!("Shutting down client");

        if let Some(spotter) = &self.wake_word {
            spotter.stop();
        }

        if let Some(bridge) = &self.bridge {
            let transport = self.transport.clone();
            let closed = bridge
                .handle()
                .call(async move { transport.close_audio_channel().await }, SHUTDOWN_CLOSE_TIMEOUT);
            if let Err(e) = closed {
                tracing::warn!("Audio channel did not close cleanly: {}", e);
            }
        }

        match dispatcher.shutdown(JOIN_TIMEOUT) {
            Some(mut engine) => engine.shutdown(),
            None => tracing::warn!("Dispatcher did not stop in time"),
        }

        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown(JOIN_TIMEOUT);
        }
        tracing::info!("Client stopped");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Route transport callbacks onto the dispatcher
///
/// Incoming audio is queued only while speech is playing or about to start;
/// everything else becomes an engine task.
fn transport_callbacks(
    scheduler: Scheduler<SessionEngine>,
    cell: StateCell,
    codec: Arc<FrameCodec>,
    speech_pending: Arc<AtomicBool>,
) -> TransportCallbacks {
    let audio = {
        let scheduler = scheduler.clone();
        let codec = codec.clone();
        let speech_pending = speech_pending.clone();
        move |frame: Bytes| {
            if cell.get() == DeviceState::Speaking || speech_pending.load(Ordering::Acquire) {
                codec.write_frame(frame);
                scheduler.raise(Signal::OutputReady);
            }
        }
    };
    let json = {
        let scheduler = scheduler.clone();
        move |value: Value| route_server_message(&scheduler, &codec, &speech_pending, value)
    };
    let opened = {
        let scheduler = scheduler.clone();
        move || scheduler.schedule(|engine| engine.handle_channel_opened())
    };
    let closed = {
        let scheduler = scheduler.clone();
        move || scheduler.schedule(|engine| engine.handle_channel_closed())
    };
    let network_error = move |message: String| {
        scheduler.schedule(move |engine| engine.handle_network_error(message));
    };

    TransportCallbacks::new()
        .on_incoming_audio(audio)
        .on_incoming_json(json)
        .on_audio_channel_opened(opened)
        .on_audio_channel_closed(closed)
        .on_network_error(network_error)
}

fn route_server_message(
    scheduler: &Scheduler<SessionEngine>,
    codec: &FrameCodec,
    speech_pending: &AtomicBool,
    value: Value,
) {
    let message = match ServerMessage::from_value(&value) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!("Dropping unreadable {:?} message: {}", message_type(&value), e);
            return;
        }
    };

    match message {
        ServerMessage::Tts { state: TtsState::Start, .. } => {
            // Open the audio gate and drop stale frames before the transition runs
            speech_pending.store(true, Ordering::Release);
            codec.clear();
            scheduler.schedule(|engine| engine.handle_tts_start());
        }
        ServerMessage::Tts { state: TtsState::Stop, .. } => {
            scheduler.schedule(|engine| engine.handle_tts_stop());
        }
        ServerMessage::Tts {
            state: TtsState::SentenceStart,
            text: Some(text),
        } if !text.is_empty() => {
            tracing::info!("<< {}", text);
            scheduler.schedule(move |engine| engine.show_chat_text(text));
        }
        ServerMessage::Stt { text: Some(text) } if !text.is_empty() => {
            tracing::info!(">> {}", text);
            scheduler.schedule(move |engine| engine.show_chat_text(text));
        }
        ServerMessage::Llm { emotion: Some(emotion) } if !emotion.is_empty() => {
            scheduler.schedule(move |engine| engine.set_emotion(emotion));
        }
        ServerMessage::Tts { .. } | ServerMessage::Stt { .. } | ServerMessage::Llm { .. } => {}
        ServerMessage::Hello(_) | ServerMessage::Goodbye { .. } => {
            tracing::debug!("Ignoring session-level {} message", message_type(&value));
        }
        ServerMessage::Unknown => {
            tracing::warn!("Unknown message type: {:?}", message_type(&value));
        }
    }
}

fn install_wake_word(spotter: &dyn WakeWordSpotter, scheduler: Scheduler<SessionEngine>, cell: StateCell) {
    let on_detected = {
        let scheduler = scheduler.clone();
        Arc::new(move |word: String, full_text: String| {
            tracing::info!("Wake word detected: {} ({})", word, full_text);
            scheduler.schedule(move |engine| engine.handle_wake_word(word));
        })
    };
    let on_error = Arc::new(move |message: String| {
        tracing::error!("Wake-word spotter failed: {}", message);
        if cell.get() == DeviceState::Idle {
            scheduler.schedule(|engine| engine.restart_wake_word());
        }
    });
    spotter.set_callbacks(on_detected, on_error);
}
