//! Session engine
//!
//! Owns the device state machine. Every method here runs on the dispatcher
//! thread: user intents, transport callbacks and timers reach the engine as
//! scheduled tasks, audio readiness arrives as dispatcher signals. Transport
//! commands are handed to the async bridge and their outcomes come back as
//! new tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::state::{DeviceState, StateCell, StateObservers};
use crate::audio::{AudioPollers, FrameCodec};
use crate::bridge::BridgeHandle;
use crate::config::SessionConfig;
use crate::constants::OUTPUT_POLL_INTERVAL;
use crate::dispatcher::{Scheduler, Signal, SignalHandler};
use crate::display::{emotion_emoji, Display};
use crate::protocol::{AbortReason, ListeningMode};
use crate::transport::{Transport, TransportCallbacks};
use crate::wake_word::WakeWordSpotter;
use crate::worker::run_after;

/// Frames encoded and sent per input-ready signal at most
const MAX_FRAMES_PER_INPUT: usize = 4;

/// Pause between stopping and restarting a failed wake-word spotter
const WAKE_WORD_RESTART_DELAY: Duration = Duration::from_millis(500);

/// What asked for a listening session
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ListenTrigger {
    /// Chat toggle: server-side end of utterance, keep the conversation going
    Toggle,
    /// Push-to-talk press: the user ends the utterance
    PushToTalk,
    /// Spotted wake word, reported to the server before listening starts
    WakeWord(String),
}

impl ListenTrigger {
    fn mode(&self) -> ListeningMode {
        match self {
            ListenTrigger::PushToTalk => ListeningMode::Manual,
            ListenTrigger::Toggle | ListenTrigger::WakeWord(_) => ListeningMode::AutoStop,
        }
    }

    fn keep_listening(&self) -> bool {
        !matches!(self, ListenTrigger::PushToTalk)
    }
}

/// Collaborators and settings the engine is built from
pub(crate) struct EngineParts {
    pub transport: Arc<dyn Transport>,
    pub callbacks: TransportCallbacks,
    pub codec: Arc<FrameCodec>,
    pub display: Box<dyn Display>,
    pub wake_word: Option<Arc<dyn WakeWordSpotter>>,
    pub bridge: BridgeHandle,
    pub scheduler: Scheduler<SessionEngine>,
    pub cell: StateCell,
    pub observers: StateObservers,
    pub speech_pending: Arc<AtomicBool>,
    pub config: SessionConfig,
    pub frame_interval: Duration,
}

pub struct SessionEngine {
    state: DeviceState,
    cell: StateCell,
    observers: StateObservers,
    keep_listening: bool,
    aborted: bool,
    reconnecting: bool,
    /// Bumped on every `tts/start` so a late `tts/stop` drain can tell it is stale
    speech_epoch: u64,
    /// Set by the inbound router between `tts/start` and the Speaking transition
    speech_pending: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    callbacks: TransportCallbacks,
    codec: Arc<FrameCodec>,
    display: Box<dyn Display>,
    wake_word: Option<Arc<dyn WakeWordSpotter>>,
    bridge: BridgeHandle,
    scheduler: Scheduler<SessionEngine>,
    config: SessionConfig,
    frame_interval: Duration,
    pollers: Option<AudioPollers>,
}

impl SessionEngine {
    pub(crate) fn new(parts: EngineParts) -> Self {
        parts.cell.set(DeviceState::Idle);
        Self {
            state: DeviceState::Idle,
            cell: parts.cell,
            observers: parts.observers,
            keep_listening: false,
            aborted: false,
            reconnecting: false,
            speech_epoch: 0,
            speech_pending: parts.speech_pending,
            transport: parts.transport,
            callbacks: parts.callbacks,
            codec: parts.codec,
            display: parts.display,
            wake_word: parts.wake_word,
            bridge: parts.bridge,
            scheduler: parts.scheduler,
            config: parts.config,
            frame_interval: parts.frame_interval,
            pollers: None,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn keep_listening(&self) -> bool {
        self.keep_listening
    }

    /// Run a transport operation on the async bridge without waiting
    fn send<F, Fut>(&self, op: F)
    where
        F: FnOnce(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.bridge.spawn(op(self.transport.clone()));
    }

    fn set_state(&mut self, next: DeviceState) {
        let previous = self.state;
        if previous == next {
            return;
        }

        if previous == DeviceState::Speaking {
            self.codec.flush_playback(self.config.drain_max_attempts);
        }

        self.state = next;
        self.cell.set(next);
        tracing::info!("State changed: {} -> {}", previous, next);
        self.display.update_status(next.status_text());

        match next {
            DeviceState::Idle => {
                self.display.update_emotion(emotion_emoji("neutral"));
                self.stop_output_when_idle();
                self.resume_wake_word();
            }
            DeviceState::Connecting => {}
            DeviceState::Listening => {
                self.display.update_emotion(emotion_emoji("happy"));
                if !self.codec.is_input_active() {
                    if let Err(e) = self.codec.start_input() {
                        tracing::warn!("Failed to start input stream: {}", e);
                    }
                }
            }
            DeviceState::Speaking => {
                if !self.codec.is_output_active() {
                    if let Err(e) = self.codec.start_output() {
                        tracing::warn!("Failed to start output stream: {}", e);
                    }
                }
                if self.codec.is_input_active() {
                    if let Err(e) = self.codec.stop_input() {
                        tracing::warn!("Failed to stop input stream: {}", e);
                    }
                }
                self.pause_wake_word();
            }
        }

        self.observers.notify(previous, next);
    }

    /// Stop the speaker off the dispatcher thread, since stopping waits for play-out
    ///
    /// Skipped if the engine has left Idle by the time the stream is held.
    fn stop_output_when_idle(&self) {
        if !self.codec.is_output_active() {
            return;
        }
        let codec = self.codec.clone();
        let cell = self.cell.clone();
        let spawned = run_after("output-stop", Duration::ZERO, move || {
            if let Err(e) = codec.stop_output_unless(|| cell.get() != DeviceState::Idle) {
                tracing::warn!("Failed to stop output stream: {}", e);
            }
        });
        if let Err(e) = spawned {
            tracing::error!("Failed to start output stop thread: {}", e);
            if let Err(e) = self.codec.stop_output() {
                tracing::warn!("Failed to stop output stream: {}", e);
            }
        }
    }

    fn pause_wake_word(&self) {
        if let Some(spotter) = &self.wake_word {
            if spotter.is_running() && !spotter.is_paused() {
                spotter.pause();
            }
        }
    }

    fn resume_wake_word(&self) {
        if let Some(spotter) = &self.wake_word {
            if spotter.is_running() && spotter.is_paused() {
                spotter.resume();
            }
        }
    }

    /// Surface a warning to the user
    pub(crate) fn alert(&mut self, title: &str, message: &str) {
        tracing::warn!("Alert: {}: {}", title, message);
        self.display.update_text(&format!("{}: {}", title, message));
    }

    pub(crate) fn show_chat_text(&mut self, text: String) {
        self.display.update_text(&text);
    }

    pub(crate) fn set_emotion(&mut self, tag: String) {
        self.display.update_emotion(emotion_emoji(&tag));
    }

    // --- listening --------------------------------------------------------

    fn request_listen(&mut self, trigger: ListenTrigger) {
        if self.state != DeviceState::Idle {
            tracing::debug!("Listen request ignored while {}", self.state);
            return;
        }
        self.pause_wake_word();

        if self.transport.is_audio_channel_opened() {
            self.begin_listening(trigger);
            return;
        }

        self.set_state(DeviceState::Connecting);
        let scheduler = self.scheduler.clone();
        let timeout = self.config.open_channel_timeout();
        self.send(move |transport| async move {
            let opened = match tokio::time::timeout(timeout, transport.open_audio_channel()).await {
                Ok(opened) => opened,
                Err(_) => {
                    tracing::error!("Opening the audio channel timed out after {:?}", timeout);
                    false
                }
            };
            scheduler.schedule(move |engine| engine.complete_session_open(opened, trigger));
        });
    }

    /// Outcome of the channel open started by a listen request
    pub(crate) fn complete_session_open(&mut self, opened: bool, trigger: ListenTrigger) {
        if self.state != DeviceState::Connecting {
            tracing::debug!("Channel open finished while {}, ignoring", self.state);
            return;
        }
        if !opened {
            self.alert("Error", "Failed to open the audio channel");
            self.set_state(DeviceState::Idle);
            return;
        }
        self.begin_listening(trigger);
    }

    fn begin_listening(&mut self, trigger: ListenTrigger) {
        self.keep_listening = trigger.keep_listening();
        let mode = trigger.mode();
        let wake_word = match trigger {
            ListenTrigger::WakeWord(word) => Some(word),
            _ => None,
        };

        self.send(move |transport| async move {
            if let Some(word) = wake_word {
                transport.send_wake_word_detected(&word).await;
            }
            transport.send_start_listening(mode).await;
        });
        self.set_state(DeviceState::Listening);
    }

    pub(crate) fn toggle_chat_state(&mut self) {
        match self.state {
            DeviceState::Idle => self.request_listen(ListenTrigger::Toggle),
            DeviceState::Speaking => self.abort_speaking(AbortReason::None),
            DeviceState::Listening => {
                self.send(|transport| async move { transport.close_audio_channel().await });
            }
            DeviceState::Connecting => tracing::debug!("Toggle ignored while connecting"),
        }
    }

    /// Push-to-talk press
    pub(crate) fn start_listening(&mut self) {
        match self.state {
            DeviceState::Idle => self.request_listen(ListenTrigger::PushToTalk),
            DeviceState::Speaking if !self.aborted => self.abort_speaking(AbortReason::WakeWordDetected),
            _ => tracing::debug!("Start listening ignored while {}", self.state),
        }
    }

    /// Push-to-talk release
    pub(crate) fn stop_listening(&mut self) {
        if self.state == DeviceState::Listening {
            self.send(|transport| async move { transport.send_stop_listening().await });
            self.set_state(DeviceState::Idle);
        }
    }

    pub(crate) fn set_auto_mode(&mut self, enabled: bool) {
        if self.state != DeviceState::Idle {
            self.alert("Notice", "Conversation mode can only be changed in standby");
            return;
        }
        self.keep_listening = enabled;
        tracing::info!("Conversation mode: {}", if enabled { "auto" } else { "manual" });
    }

    // --- speech -----------------------------------------------------------

    /// `tts/start`; the queue was already cleared when the message arrived
    pub(crate) fn handle_tts_start(&mut self) {
        self.aborted = false;
        self.speech_epoch = self.speech_epoch.wrapping_add(1);
        if matches!(self.state, DeviceState::Idle | DeviceState::Listening) {
            self.set_state(DeviceState::Speaking);
        }
        self.speech_pending.store(false, Ordering::Release);
    }

    /// `tts/stop`: let playback drain on a timer thread, then leave Speaking
    pub(crate) fn handle_tts_stop(&mut self) {
        if self.state != DeviceState::Speaking {
            return;
        }

        let epoch = self.speech_epoch;
        let codec = self.codec.clone();
        let scheduler = self.scheduler.clone();
        let attempts = self.config.drain_max_attempts;
        let spawned = run_after("tts-drain", Duration::ZERO, move || {
            codec.drain_and_wait(attempts);
            scheduler.schedule(move |engine| engine.finish_tts_stop(epoch));
        });
        if let Err(e) = spawned {
            tracing::error!("Failed to start playback drain timer: {}", e);
            self.finish_tts_stop(epoch);
        }
    }

    pub(crate) fn finish_tts_stop(&mut self, epoch: u64) {
        if self.state != DeviceState::Speaking || epoch != self.speech_epoch {
            tracing::debug!("Dropping stale end-of-speech transition");
            return;
        }

        if self.keep_listening {
            self.send(|transport| async move {
                transport.send_start_listening(ListeningMode::AutoStop).await;
            });
            self.set_state(DeviceState::Listening);
        } else {
            self.set_state(DeviceState::Idle);
        }
    }

    pub(crate) fn abort_speaking(&mut self, reason: AbortReason) {
        if self.state != DeviceState::Speaking {
            tracing::debug!("Abort ignored while {}", self.state);
            return;
        }

        tracing::info!("Aborting speech, reason: {:?}", reason);
        self.aborted = true;
        self.codec.clear();
        self.send(move |transport| async move { transport.send_abort_speaking(reason).await });
        self.set_state(DeviceState::Idle);

        if reason == AbortReason::WakeWordDetected && self.keep_listening {
            let scheduler = self.scheduler.clone();
            let spawned = run_after("abort-relisten", self.config.abort_relisten_delay(), move || {
                scheduler.schedule(|engine| engine.relisten_after_abort());
            });
            if let Err(e) = spawned {
                tracing::error!("Failed to schedule listening after abort: {}", e);
            }
        }
    }

    fn relisten_after_abort(&mut self) {
        if self.state == DeviceState::Idle {
            self.request_listen(ListenTrigger::Toggle);
        } else {
            tracing::debug!("Skipping listen after abort while {}", self.state);
        }
    }

    // --- wake word --------------------------------------------------------

    pub(crate) fn handle_wake_word(&mut self, word: String) {
        match self.state {
            DeviceState::Idle => self.request_listen(ListenTrigger::WakeWord(word)),
            DeviceState::Speaking if !self.aborted => self.abort_speaking(AbortReason::WakeWordDetected),
            _ => tracing::debug!("Wake word ignored while {}", self.state),
        }
    }

    pub(crate) fn restart_wake_word(&mut self) {
        if self.state != DeviceState::Idle {
            return;
        }
        let Some(spotter) = self.wake_word.clone() else {
            return;
        };

        tracing::info!("Restarting wake-word spotter");
        spotter.stop();
        let spawned = run_after("wake-word-restart", WAKE_WORD_RESTART_DELAY, move || {
            match spotter.start() {
                Ok(()) => tracing::info!("Wake-word spotter restarted"),
                Err(e) => tracing::error!("Failed to restart wake-word spotter: {}", e),
            }
        });
        if let Err(e) = spawned {
            tracing::error!("Failed to schedule wake-word restart: {}", e);
        }
    }

    // --- connection -------------------------------------------------------

    pub(crate) fn handle_network_error(&mut self, message: String) {
        if self.reconnecting {
            tracing::debug!("Network error during reconnect: {}", message);
            return;
        }
        if self.state == DeviceState::Connecting {
            // The pending channel open reports its own failure
            return;
        }

        self.alert("Network error", &message);
        self.keep_listening = false;
        self.reconnecting = true;
        self.set_state(DeviceState::Connecting);

        let callbacks = self.callbacks.clone();
        let scheduler = self.scheduler.clone();
        let attempts = self.config.reconnect_attempts;
        let backoff = self.config.reconnect_backoff();
        self.send(move |transport| async move {
            transport.close_audio_channel().await;
            let connected = reconnect(transport.as_ref(), &callbacks, attempts, backoff).await;
            scheduler.schedule(move |engine| engine.finish_reconnect(connected));
        });
    }

    pub(crate) fn finish_reconnect(&mut self, connected: bool) {
        self.reconnecting = false;
        if !connected {
            self.alert("Connection lost", "Unable to reconnect to the server");
        }
        self.set_state(DeviceState::Idle);
    }

    pub(crate) fn handle_channel_opened(&mut self) {
        tracing::info!("Audio channel opened");
        self.start_streams();
    }

    pub(crate) fn handle_channel_closed(&mut self) {
        if self.reconnecting {
            self.stop_streams();
            return;
        }

        tracing::info!("Audio channel closed");
        self.set_state(DeviceState::Idle);
        self.keep_listening = false;

        if let Some(spotter) = &self.wake_word {
            if !spotter.is_running() {
                if let Err(e) = spotter.start() {
                    tracing::error!("Failed to start wake-word spotter: {}", e);
                }
            } else if spotter.is_paused() {
                spotter.resume();
            }
        }
        self.stop_streams();
    }

    fn start_streams(&mut self) {
        if !self.codec.is_input_active() {
            if let Err(e) = self.codec.start_input() {
                tracing::error!("Failed to start input stream: {}", e);
            }
        }
        if !self.codec.is_output_active() {
            if let Err(e) = self.codec.start_output() {
                tracing::error!("Failed to start output stream: {}", e);
            }
        }

        if self.pollers.is_none() {
            let input = self.scheduler.clone();
            let output = self.scheduler.clone();
            match AudioPollers::start(
                self.codec.clone(),
                self.frame_interval,
                OUTPUT_POLL_INTERVAL,
                move || input.raise(Signal::InputReady),
                move || output.raise(Signal::OutputReady),
            ) {
                Ok(pollers) => self.pollers = Some(pollers),
                Err(e) => tracing::error!("Failed to start audio pollers: {}", e),
            }
        }
    }

    fn stop_streams(&mut self) {
        if let Some(pollers) = self.pollers.take() {
            pollers.stop();
        }
        if self.codec.is_input_active() {
            if let Err(e) = self.codec.stop_input() {
                tracing::warn!("Failed to stop input stream: {}", e);
            }
        }
        if self.codec.is_output_active() {
            if let Err(e) = self.codec.stop_output() {
                tracing::warn!("Failed to stop output stream: {}", e);
            }
        }
    }

    /// Release audio resources once the dispatcher has stopped
    pub(crate) fn shutdown(&mut self) {
        self.stop_streams();
    }
}

impl SignalHandler for SessionEngine {
    fn on_input_ready(&mut self) {
        if self.state != DeviceState::Listening {
            return;
        }
        for _ in 0..MAX_FRAMES_PER_INPUT {
            match self.codec.read_frame() {
                Some(frame) => self.send(move |transport| async move { transport.send_audio(frame).await }),
                None => break,
            }
        }
    }

    fn on_output_ready(&mut self) {
        self.codec.play_pending();
    }
}

/// Reconnect with a bounded number of attempts, re-installing callbacks each time
pub(crate) async fn reconnect(
    transport: &dyn Transport,
    callbacks: &TransportCallbacks,
    attempts: u32,
    backoff: Duration,
) -> bool {
    for attempt in 1..=attempts {
        tracing::info!("Reconnecting (attempt {}/{})", attempt, attempts);
        transport.set_callbacks(callbacks.clone());
        if transport.connect().await {
            tracing::info!("Reconnected");
            return true;
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    tracing::error!("Reconnect failed after {} attempts", attempts);
    false
}
