//! Test doubles for the collaborator seams

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::{InputStream, OutputStream};
use crate::codec::{FrameDecoder, FrameEncoder};
use crate::display::Display;
use crate::error::{AudioError, CodecError};
use crate::transport::{Transport, TransportCallbacks};
use crate::wake_word::{DetectionCallback, SpotterErrorCallback, WakeWordSpotter};

/// Frame the fake decoder refuses
pub const BAD_FRAME: &[u8] = &[0xde, 0xad];

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// --- audio -----------------------------------------------------------------

#[derive(Default)]
struct InputState {
    active: bool,
    samples: VecDeque<i16>,
}

/// Microphone fed by the test
#[derive(Clone, Default)]
pub struct FakeInput(Arc<Mutex<InputState>>);

impl FakeInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, samples: &[i16]) {
        self.0.lock().samples.extend(samples.iter().copied());
    }
}

impl InputStream for FakeInput {
    fn start(&mut self) -> Result<(), AudioError> {
        self.0.lock().active = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.0.lock().active = false;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.0.lock().active
    }

    fn read(&mut self, samples: usize) -> Result<Option<Vec<i16>>, AudioError> {
        let mut state = self.0.lock();
        if state.samples.len() < samples {
            return Ok(None);
        }
        Ok(Some(state.samples.drain(..samples).collect()))
    }
}

#[derive(Default)]
struct OutputState {
    active: bool,
    started: bool,
    writes: Vec<usize>,
    discards: usize,
    stops: usize,
    play_out: Duration,
}

/// Speaker that records each write's sample count
#[derive(Clone, Default)]
pub struct FakeOutput(Arc<Mutex<OutputState>>);

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<usize> {
        self.0.lock().writes.clone()
    }

    /// Whether the stream was ever started
    pub fn is_started(&self) -> bool {
        self.0.lock().started
    }

    pub fn discards(&self) -> usize {
        self.0.lock().discards
    }

    /// Make `stop` take this long, like a speaker playing out its buffer
    pub fn with_play_out(self, play_out: Duration) -> Self {
        self.0.lock().play_out = play_out;
        self
    }

    pub fn stops(&self) -> usize {
        self.0.lock().stops
    }
}

impl OutputStream for FakeOutput {
    fn start(&mut self) -> Result<(), AudioError> {
        let mut state = self.0.lock();
        state.active = true;
        state.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        let play_out = self.0.lock().play_out;
        thread::sleep(play_out);
        let mut state = self.0.lock();
        state.active = false;
        state.stops += 1;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.0.lock().active
    }

    fn write(&mut self, pcm: &[i16]) -> Result<(), AudioError> {
        let mut state = self.0.lock();
        if !state.active {
            return Err(AudioError::StreamInactive);
        }
        state.writes.push(pcm.len());
        Ok(())
    }

    fn discard(&mut self) {
        self.0.lock().discards += 1;
    }
}

/// One byte per sample
pub struct FakeEncoder {
    samples_per_frame: usize,
}

impl FakeEncoder {
    pub fn new(samples_per_frame: usize) -> Self {
        Self { samples_per_frame }
    }
}

impl FrameEncoder for FakeEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        Ok(pcm.iter().map(|s| *s as u8).collect::<Vec<u8>>().into())
    }

    fn samples_per_frame(&self) -> usize {
        self.samples_per_frame
    }
}

/// One sample per byte; fails on [`BAD_FRAME`]
pub struct FakeDecoder;

impl FrameDecoder for FakeDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError> {
        if frame == BAD_FRAME {
            return Err(CodecError::DecodingFailed("bad frame".into()));
        }
        Ok(frame.iter().map(|b| *b as i16).collect())
    }
}

// --- transport -------------------------------------------------------------

#[derive(Default)]
struct TransportState {
    callbacks: RwLock<TransportCallbacks>,
    opened: AtomicBool,
    open_results: Mutex<VecDeque<bool>>,
    connect_results: Mutex<VecDeque<bool>>,
    connects: AtomicUsize,
    sent: Mutex<Vec<Value>>,
    audio_frames: AtomicUsize,
}

/// In-memory transport; operations succeed unless results are queued
#[derive(Clone, Default)]
pub struct FakeTransport(Arc<TransportState>);

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_open_results(&self, results: &[bool]) {
        self.0.open_results.lock().extend(results.iter().copied());
    }

    pub fn push_connect_results(&self, results: &[bool]) {
        self.0.connect_results.lock().extend(results.iter().copied());
    }

    pub fn connects(&self) -> usize {
        self.0.connects.load(Ordering::SeqCst)
    }

    /// Encoded microphone frames sent so far
    pub fn audio_frames(&self) -> usize {
        self.0.audio_frames.load(Ordering::SeqCst)
    }

    /// Control messages sent with the given `type`, in order
    pub fn sent_of_type(&self, kind: &str) -> Vec<Value> {
        self.0
            .sent
            .lock()
            .iter()
            .filter(|v| v["type"] == kind)
            .cloned()
            .collect()
    }

    fn callbacks(&self) -> TransportCallbacks {
        self.0.callbacks.read().clone()
    }

    pub fn deliver_json(&self, value: Value) {
        self.callbacks().incoming_json(value);
    }

    pub fn deliver_audio(&self, frame: Bytes) {
        self.callbacks().incoming_audio(frame);
    }

    /// Receive failure: network error, then channel closed
    pub fn drop_connection(&self, message: &str) {
        let callbacks = self.callbacks();
        callbacks.network_error(message);
        if self.0.opened.swap(false, Ordering::SeqCst) {
            callbacks.channel_closed();
        }
    }

    /// Server ended the session cleanly
    pub fn remote_close(&self) {
        if self.0.opened.swap(false, Ordering::SeqCst) {
            self.callbacks().channel_closed();
        }
    }

    fn establish(&self, result: bool, what: &str) -> bool {
        let callbacks = self.callbacks();
        if !result {
            callbacks.network_error(format!("{} failed", what));
            return false;
        }
        if !self.0.opened.swap(true, Ordering::SeqCst) {
            callbacks.channel_opened();
        }
        true
    }
}

impl Transport for FakeTransport {
    fn set_callbacks(&self, callbacks: TransportCallbacks) {
        *self.0.callbacks.write() = callbacks;
    }

    fn connect(&self) -> BoxFuture<'_, bool> {
        async move {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            let result = self.0.connect_results.lock().pop_front().unwrap_or(true);
            self.establish(result, "connect")
        }
        .boxed()
    }

    fn open_audio_channel(&self) -> BoxFuture<'_, bool> {
        async move {
            if self.is_audio_channel_opened() {
                return true;
            }
            let result = self.0.open_results.lock().pop_front().unwrap_or(true);
            self.establish(result, "open")
        }
        .boxed()
    }

    fn close_audio_channel(&self) -> BoxFuture<'_, ()> {
        async move { self.remote_close() }.boxed()
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.0.opened.load(Ordering::SeqCst)
    }

    fn send_audio(&self, frame: Bytes) -> BoxFuture<'_, ()> {
        async move {
            drop(frame);
            self.0.audio_frames.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }

    fn send_text(&self, text: String) -> BoxFuture<'_, ()> {
        async move {
            if let Ok(value) = serde_json::from_str(&text) {
                self.0.sent.lock().push(value);
            }
        }
        .boxed()
    }

    fn session_id(&self) -> String {
        "fake-session".to_string()
    }

    fn server_sample_rate(&self) -> Option<u32> {
        Some(24000)
    }
}

// --- front end -------------------------------------------------------------

#[derive(Default)]
struct DisplayLog {
    statuses: Vec<String>,
    texts: Vec<String>,
    emotions: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeDisplay(Arc<Mutex<DisplayLog>>);

impl FakeDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.0.lock().statuses.clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.0.lock().texts.clone()
    }

    pub fn emotions(&self) -> Vec<String> {
        self.0.lock().emotions.clone()
    }
}

impl Display for FakeDisplay {
    fn update_status(&mut self, status: &str) {
        self.0.lock().statuses.push(status.to_string());
    }

    fn update_text(&mut self, text: &str) {
        self.0.lock().texts.push(text.to_string());
    }

    fn update_emotion(&mut self, emoji: &str) {
        self.0.lock().emotions.push(emoji.to_string());
    }
}

#[derive(Default)]
struct SpotterState {
    running: AtomicBool,
    paused: AtomicBool,
    on_detected: Mutex<Option<DetectionCallback>>,
    on_error: Mutex<Option<SpotterErrorCallback>>,
}

#[derive(Clone, Default)]
pub struct FakeWakeWord(Arc<SpotterState>);

impl FakeWakeWord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detect(&self, word: &str, full_text: &str) {
        let callback = self.0.on_detected.lock().clone();
        if let Some(callback) = callback {
            callback(word.to_string(), full_text.to_string());
        }
    }

    pub fn is_paused_now(&self) -> bool {
        self.0.paused.load(Ordering::SeqCst)
    }
}

impl WakeWordSpotter for FakeWakeWord {
    fn set_callbacks(&self, on_detected: DetectionCallback, on_error: SpotterErrorCallback) {
        *self.0.on_detected.lock() = Some(on_detected);
        *self.0.on_error.lock() = Some(on_error);
    }

    fn start(&self) -> Result<(), AudioError> {
        self.0.running.store(true, Ordering::SeqCst);
        self.0.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.0.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.0.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.0.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.0.running.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.0.paused.load(Ordering::SeqCst)
    }
}
