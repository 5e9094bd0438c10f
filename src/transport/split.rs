//! Control/data split transport
//!
//! Control messages go over a publish/subscribe link (MQTT in production),
//! audio goes over encrypted UDP datagrams. The server answers the client
//! hello asynchronously on the control link; that reply carries the session
//! id and the datagram endpoint, key and base nonce.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

use super::crypto::CryptoStream;
use super::{CallbackSlot, Transport, TransportCallbacks};
use crate::config::{AppConfig, MqttInfo};
use crate::constants::{DATAGRAM_READ_TIMEOUT, JOIN_TIMEOUT, MAX_DATAGRAM_SIZE, NONCE_LEN};
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{message_type, AudioParams, ClientMessage, ServerHello, ServerMessage, UdpInfo};
use crate::worker::Worker;

const PROTOCOL_VERSION: u8 = 3;
const TRANSPORT_KIND: &str = "udp";

/// Something that happened on the control link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// One inbound control payload
    Message(String),
    /// The link dropped, with the reason if it was an error
    Disconnected(Option<String>),
}

pub type ControlEventHandler = Arc<dyn Fn(ControlEvent) + Send + Sync>;

/// An established control link
pub trait ControlLink: Send + Sync {
    /// Publish one payload on the device-to-server topic
    fn publish(&self, payload: String) -> BoxFuture<'_, Result<(), TransportError>>;

    fn disconnect(&self) -> BoxFuture<'_, ()>;
}

/// Factory for control links
pub trait ControlConnector: Send + Sync {
    fn connect(
        &self,
        info: MqttInfo,
        on_event: ControlEventHandler,
    ) -> BoxFuture<'_, Result<Box<dyn ControlLink>, TransportError>>;
}

#[derive(Debug, Clone)]
pub struct SplitTransportConfig {
    pub mqtt: Option<MqttInfo>,
    pub audio_params: AudioParams,
    /// Bounds both the control connect and the wait for the server hello
    pub hello_timeout: Duration,
    pub playback_sample_rate: u32,
}

impl SplitTransportConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            mqtt: config.mqtt.clone(),
            audio_params: config.audio.hello_params(),
            hello_timeout: config.session.handshake_timeout(),
            playback_sample_rate: config.audio.output_sample_rate,
        }
    }
}

/// What a control payload asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlOutcome {
    HelloAccepted,
    Goodbye,
    Forwarded,
    Ignored,
}

#[derive(Debug, Default)]
struct SessionState {
    session_id: String,
    server_sample_rate: Option<u32>,
    udp: Option<UdpInfo>,
}

/// Socket, peer and receive thread of an open datagram path
struct DatagramPath {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    worker: Worker<()>,
}

/// State shared with the control event handler and the receive thread
struct SplitState {
    callbacks: CallbackSlot,
    playback_sample_rate: u32,
    session: Mutex<SessionState>,
    crypto: Arc<Mutex<Option<CryptoStream>>>,
    hello_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Channel-opened delivered and channel-closed not yet
    opened: AtomicBool,
    /// Bumped per control connection; events from older links are ignored
    generation: AtomicU64,
    datagram: Mutex<Option<DatagramPath>>,
    link: tokio::sync::Mutex<Option<Box<dyn ControlLink>>>,
    packets_sent: AtomicU64,
}

impl SplitState {
    fn new(callbacks: CallbackSlot, playback_sample_rate: u32) -> Self {
        Self {
            callbacks,
            playback_sample_rate,
            session: Mutex::new(SessionState::default()),
            crypto: Arc::new(Mutex::new(None)),
            hello_tx: Mutex::new(None),
            opened: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            datagram: Mutex::new(None),
            link: tokio::sync::Mutex::new(None),
            packets_sent: AtomicU64::new(0),
        }
    }

    fn event_handler(self: &Arc<Self>, generation: u64) -> ControlEventHandler {
        let state = Arc::downgrade(self);
        Arc::new(move |event| {
            let Some(state) = state.upgrade() else {
                return;
            };
            if state.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!("Ignoring event from a stale control link");
                return;
            }
            state.on_control_event(event);
        })
    }

    fn on_control_event(self: &Arc<Self>, event: ControlEvent) {
        let end_session = match event {
            ControlEvent::Message(payload) => self.handle_control_payload(&payload) == ControlOutcome::Goodbye,
            ControlEvent::Disconnected(reason) => {
                match reason {
                    Some(reason) => tracing::warn!("Control link lost: {}", reason),
                    None => tracing::info!("Control link disconnected"),
                }
                true
            }
        };

        if end_session {
            let state = self.clone();
            tokio::spawn(async move {
                state.end_session().await;
            });
        }
    }

    /// Interpret one inbound control payload
    fn handle_control_payload(&self, payload: &str) -> ControlOutcome {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Dropping malformed control message: {}", e);
                return ControlOutcome::Ignored;
            }
        };

        match message_type(&value) {
            "hello" => match ServerMessage::from_value(&value) {
                Ok(ServerMessage::Hello(hello)) => match self.accept_hello(hello) {
                    Ok(()) => ControlOutcome::HelloAccepted,
                    Err(e) => {
                        tracing::error!("Rejected server hello: {}", e);
                        ControlOutcome::Ignored
                    }
                },
                _ => ControlOutcome::Ignored,
            },
            "goodbye" => {
                let requested = value.get("session_id").and_then(Value::as_str).unwrap_or("");
                let current = self.session.lock().session_id.clone();
                if requested.is_empty() || requested == current {
                    tracing::info!("Server ended session {}", current);
                    ControlOutcome::Goodbye
                } else {
                    tracing::debug!("Ignoring goodbye for session {} (active: {})", requested, current);
                    ControlOutcome::Ignored
                }
            }
            _ => {
                self.callbacks.get().incoming_json(value);
                ControlOutcome::Forwarded
            }
        }
    }

    fn accept_hello(&self, hello: ServerHello) -> Result<(), ProtocolError> {
        hello.expect_transport(TRANSPORT_KIND)?;
        let udp = hello.udp.clone().ok_or(ProtocolError::MissingUdpBlock)?;
        let crypto = CryptoStream::from_hex(&udp.key, &udp.nonce)?;

        {
            let mut session = self.session.lock();
            session.session_id = hello.session_id.clone().unwrap_or_default();
            if let Some(rate) = hello.sample_rate() {
                session.server_sample_rate = Some(rate);
                if rate != self.playback_sample_rate {
                    tracing::warn!(
                        "Server sample rate {} differs from playback rate {}, audio will be resampled",
                        rate,
                        self.playback_sample_rate
                    );
                }
            }
            tracing::info!(
                "Server hello for session {}, audio at {}:{}",
                session.session_id,
                udp.server,
                udp.port
            );
            session.udp = Some(udp);
        }
        // Fresh counters with every handshake
        *self.crypto.lock() = Some(crypto);

        if let Some(tx) = self.hello_tx.lock().take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Bind the datagram socket and start the receive thread
    async fn open_datagram_path(&self) -> Result<(), TransportError> {
        let udp = self
            .session
            .lock()
            .udp
            .clone()
            .ok_or(TransportError::NotInitialized)?;

        let server = tokio::net::lookup_host((udp.server.as_str(), udp.port))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("cannot resolve {}", udp.server)))?;

        self.close_datagram_path().await;
        let socket = Arc::new(bind_datagram_socket(&server)?);

        let receive_socket = socket.clone();
        let crypto = self.crypto.clone();
        let callbacks = self.callbacks.clone();
        let worker = Worker::spawn("udp-receive", move |stop| {
            receive_loop(receive_socket, crypto, callbacks, stop, server)
        })
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        self.packets_sent.store(0, Ordering::Relaxed);
        *self.datagram.lock() = Some(DatagramPath { socket, server, worker });
        Ok(())
    }

    async fn close_datagram_path(&self) {
        let path = self.datagram.lock().take();
        if let Some(path) = path {
            let worker = path.worker;
            let _ = tokio::task::spawn_blocking(move || worker.stop(JOIN_TIMEOUT)).await;
        }
    }

    /// Tear down the datagram path, session and link; fire channel-closed if owed
    async fn end_session(&self) {
        self.close_datagram_path().await;
        *self.session.lock() = SessionState::default();
        *self.crypto.lock() = None;

        let link = self.link.lock().await.take();
        if let Some(link) = link {
            self.generation.fetch_add(1, Ordering::SeqCst);
            link.disconnect().await;
        }

        if self.opened.swap(false, Ordering::SeqCst) {
            tracing::info!("Audio channel closed");
            self.callbacks.get().channel_closed();
        }
    }

    fn send_datagram(&self, frame: &[u8]) -> Result<(), TransportError> {
        let (socket, server) = {
            let path = self.datagram.lock();
            match path.as_ref() {
                Some(path) => (path.socket.clone(), path.server),
                None => return Err(TransportError::NotInitialized),
            }
        };

        let datagram = {
            let mut crypto = self.crypto.lock();
            let crypto = crypto.as_mut().ok_or(TransportError::NotInitialized)?;
            crypto
                .seal(frame)
                .map_err(|e| TransportError::SendFailed(e.to_string()))?
        };

        socket
            .send_to(&datagram, server)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let sent = self.packets_sent.fetch_add(1, Ordering::Relaxed) + 1;
        if sent % 100 == 0 {
            tracing::debug!("Sent {} audio datagrams to {}", sent, server);
        }
        Ok(())
    }
}

fn bind_datagram_socket(server: &SocketAddr) -> Result<UdpSocket, TransportError> {
    let domain = if server.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    socket
        .set_read_timeout(Some(DATAGRAM_READ_TIMEOUT))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    let local: SocketAddr = if server.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    socket
        .bind(&local.into())
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;

    Ok(socket.into())
}

fn receive_loop(
    socket: Arc<UdpSocket>,
    crypto: Arc<Mutex<Option<CryptoStream>>>,
    callbacks: CallbackSlot,
    stop: crate::worker::StopFlag,
    server: SocketAddr,
) {
    tracing::info!("Datagram receiver started for {}", server);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + NONCE_LEN];
    let mut received: u64 = 0;

    while !stop.is_stopped() {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _from)) => len,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                if stop.is_stopped() {
                    break;
                }
                tracing::error!("Datagram receive failed: {}", e);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        let opened = match crypto.lock().as_mut() {
            Some(crypto) => crypto.open(&buf[..len]),
            None => continue,
        };
        match opened {
            Ok(payload) => {
                received += 1;
                if received % 100 == 0 {
                    tracing::debug!("Received {} audio datagrams", received);
                }
                callbacks.get().incoming_audio(payload);
            }
            Err(ProtocolError::StaleSequence { received, last }) => {
                tracing::debug!("Dropping stale datagram {} (last {})", received, last);
            }
            Err(e) => tracing::error!("Dropping datagram: {}", e),
        }
    }

    tracing::info!("Datagram receiver stopped");
}

/// MQTT + UDP implementation of [`Transport`]
pub struct SplitTransport {
    config: SplitTransportConfig,
    connector: Arc<dyn ControlConnector>,
    callbacks: CallbackSlot,
    state: Arc<SplitState>,
}

impl SplitTransport {
    pub fn new(config: SplitTransportConfig, connector: Arc<dyn ControlConnector>) -> Self {
        let callbacks = CallbackSlot::default();
        let state = Arc::new(SplitState::new(callbacks.clone(), config.playback_sample_rate));
        Self {
            config,
            connector,
            callbacks,
            state,
        }
    }

    async fn connect_inner(&self) -> bool {
        let callbacks = self.callbacks.get();

        let info = match &self.config.mqtt {
            Some(info) => info.clone(),
            None => {
                callbacks.network_error("Control link settings are not provisioned");
                return false;
            }
        };
        if let Err(e) = info.validate() {
            callbacks.network_error(e.to_string());
            return false;
        }

        self.state.end_session().await;

        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (hello_tx, hello_rx) = oneshot::channel();
        *self.state.hello_tx.lock() = Some(hello_tx);

        tracing::info!("Connecting control link to {}", info.endpoint);
        let handler = self.state.event_handler(generation);
        let connecting = self.connector.connect(info, handler);
        let link = match tokio::time::timeout(self.config.hello_timeout, connecting).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                callbacks.network_error(format!("Control link failed: {}", e));
                return false;
            }
            Err(_) => {
                callbacks.network_error(TransportError::Timeout("control link").to_string());
                return false;
            }
        };
        *self.state.link.lock().await = Some(link);

        let hello = ClientMessage::hello(PROTOCOL_VERSION, TRANSPORT_KIND, self.config.audio_params.clone());
        if let Err(e) = self.publish(hello.to_json()).await {
            callbacks.network_error(format!("Failed to send hello: {}", e));
            self.state.end_session().await;
            return false;
        }

        match tokio::time::timeout(self.config.hello_timeout, hello_rx).await {
            Ok(Ok(())) => {}
            _ => {
                callbacks.network_error(TransportError::Timeout("server hello").to_string());
                self.state.end_session().await;
                return false;
            }
        }

        if let Err(e) = self.state.open_datagram_path().await {
            callbacks.network_error(format!("Cannot open audio path: {}", e));
            self.state.end_session().await;
            return false;
        }

        if !self.state.opened.swap(true, Ordering::SeqCst) {
            callbacks.channel_opened();
        }
        true
    }

    async fn publish(&self, payload: String) -> Result<(), TransportError> {
        let link = self.state.link.lock().await;
        match link.as_ref() {
            Some(link) => link.publish(payload).await,
            None => Err(TransportError::NotInitialized),
        }
    }
}

impl Transport for SplitTransport {
    fn set_callbacks(&self, callbacks: TransportCallbacks) {
        self.callbacks.set(callbacks);
    }

    fn connect(&self) -> BoxFuture<'_, bool> {
        self.connect_inner().boxed()
    }

    fn open_audio_channel(&self) -> BoxFuture<'_, bool> {
        async move {
            if self.is_audio_channel_opened() {
                return true;
            }
            self.connect_inner().await
        }
        .boxed()
    }

    fn close_audio_channel(&self) -> BoxFuture<'_, ()> {
        async move {
            let session_id = self.session_id();
            if !session_id.is_empty() {
                let goodbye = ClientMessage::goodbye(&session_id);
                if let Err(e) = self.publish(goodbye.to_json()).await {
                    tracing::warn!("Failed to send goodbye: {}", e);
                }
            }
            self.state.end_session().await;
        }
        .boxed()
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.state.opened.load(Ordering::SeqCst) && self.state.datagram.lock().is_some()
    }

    fn send_audio(&self, frame: Bytes) -> BoxFuture<'_, ()> {
        async move {
            match self.state.send_datagram(&frame) {
                Ok(()) => {}
                Err(TransportError::NotInitialized) => tracing::error!("Audio path is not open"),
                Err(e) => self.callbacks.get().network_error(format!("Failed to send audio: {}", e)),
            }
        }
        .boxed()
    }

    fn send_text(&self, text: String) -> BoxFuture<'_, ()> {
        async move {
            match self.publish(text).await {
                Ok(()) => {}
                Err(TransportError::NotInitialized) => tracing::error!("Control link is not connected"),
                Err(e) => self.callbacks.get().network_error(format!("Failed to send message: {}", e)),
            }
        }
        .boxed()
    }

    fn session_id(&self) -> String {
        self.state.session.lock().session_id.clone()
    }

    fn server_sample_rate(&self) -> Option<u32> {
        self.state.session.lock().server_sample_rate
    }
}
