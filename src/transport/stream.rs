//! Single-socket transport over WebSocket
//!
//! Control messages travel as text frames and audio as binary frames on one
//! connection. Opening the audio channel means connecting and completing the
//! hello exchange; closing it closes the socket.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{CallbackSlot, Transport, TransportCallbacks};
use crate::config::AppConfig;
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{message_type, AudioParams, ClientMessage, ServerHello, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const PROTOCOL_VERSION: u8 = 1;
const TRANSPORT_KIND: &str = "websocket";

/// Endpoint, identity and handshake parameters
#[derive(Debug, Clone)]
pub struct StreamTransportConfig {
    pub url: String,
    pub access_token: String,
    pub device_id: String,
    pub client_id: String,
    pub audio_params: AudioParams,
    pub hello_timeout: Duration,
    /// Rate the speaker plays at; a different server rate is only warned about
    pub playback_sample_rate: u32,
}

impl StreamTransportConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            url: config.network.websocket_url.clone(),
            access_token: config.network.access_token.clone(),
            device_id: config.device.device_id.clone(),
            client_id: config.device.client_id.clone(),
            audio_params: config.audio.hello_params(),
            hello_timeout: config.session.handshake_timeout(),
            playback_sample_rate: config.audio.output_sample_rate,
        }
    }

    /// Upgrade request carrying the identity headers
    pub fn request(&self) -> Result<Request, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let headers = [
            ("Authorization", format!("Bearer {}", self.access_token)),
            ("Protocol-Version", PROTOCOL_VERSION.to_string()),
            ("Device-Id", self.device_id.clone()),
            ("Client-Id", self.client_id.clone()),
        ];
        for (name, value) in headers {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", name, e)))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }
}

#[derive(Debug, Default)]
struct SessionInfo {
    session_id: String,
    server_sample_rate: Option<u32>,
}

/// State of one physical connection
struct Connection {
    /// Server hello accepted and channel-opened delivered
    opened: AtomicBool,
    alive: AtomicBool,
    hello_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Connection {
    fn new(hello_tx: oneshot::Sender<()>) -> Self {
        Self {
            opened: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            hello_tx: Mutex::new(Some(hello_tx)),
        }
    }

    fn is_open(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.opened.load(Ordering::SeqCst)
    }

    /// Mark the connection finished; true if channel-closed is owed
    fn finish(&self) -> bool {
        self.alive.store(false, Ordering::SeqCst);
        self.opened.swap(false, Ordering::SeqCst)
    }
}

/// Handles inbound text frames; split out so it can run without a socket
struct Inbound {
    session: Arc<Mutex<SessionInfo>>,
    callbacks: CallbackSlot,
    playback_sample_rate: u32,
}

impl Inbound {
    fn on_text(&self, connection: &Connection, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Dropping malformed control message: {}", e);
                return;
            }
        };

        if message_type(&value) != "hello" {
            self.callbacks.get().incoming_json(value);
            return;
        }

        match parse_hello(&value) {
            Ok(hello) => self.on_hello(connection, hello),
            Err(e) => tracing::error!("Rejected server hello: {}", e),
        }
    }

    fn on_hello(&self, connection: &Connection, hello: ServerHello) {
        {
            let mut session = self.session.lock();
            if let Some(id) = &hello.session_id {
                session.session_id = id.clone();
            }
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
        }

        if let Some(tx) = connection.hello_tx.lock().take() {
            let _ = tx.send(());
        }
        if !connection.opened.swap(true, Ordering::SeqCst) {
            tracing::info!("Server hello accepted");
            self.callbacks.get().channel_opened();
        }
    }
}

/// WebSocket implementation of [`Transport`]
pub struct StreamTransport {
    config: StreamTransportConfig,
    callbacks: CallbackSlot,
    session: Arc<Mutex<SessionInfo>>,
    sink: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    connection: Mutex<Option<Arc<Connection>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    pub fn new(config: StreamTransportConfig) -> Self {
        Self {
            config,
            callbacks: CallbackSlot::default(),
            session: Arc::new(Mutex::new(SessionInfo::default())),
            sink: Arc::new(tokio::sync::Mutex::new(None)),
            connection: Mutex::new(None),
            receive_task: Mutex::new(None),
        }
    }

    fn inbound(&self) -> Inbound {
        Inbound {
            session: self.session.clone(),
            callbacks: self.callbacks.clone(),
            playback_sample_rate: self.config.playback_sample_rate,
        }
    }

    async fn connect_inner(&self) -> bool {
        let callbacks = self.callbacks.get();
        if self.teardown().await {
            callbacks.channel_closed();
        }

        let request = match self.config.request() {
            Ok(request) => request,
            Err(e) => {
                callbacks.network_error(e.to_string());
                return false;
            }
        };

        tracing::info!("Connecting to {}", self.config.url);
        let ws = match connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                callbacks.network_error(format!("Cannot reach service: {}", e));
                return false;
            }
        };

        let (sink, stream) = ws.split();
        let (hello_tx, hello_rx) = oneshot::channel();
        let connection = Arc::new(Connection::new(hello_tx));
        *self.session.lock() = SessionInfo::default();
        *self.sink.lock().await = Some(sink);
        *self.connection.lock() = Some(connection.clone());

        let task = tokio::spawn(receive_loop(stream, connection, self.inbound()));
        *self.receive_task.lock() = Some(task);

        let hello = ClientMessage::hello(PROTOCOL_VERSION, TRANSPORT_KIND, self.config.audio_params.clone());
        if let Err(e) = self.send_message(Message::Text(hello.to_json())).await {
            callbacks.network_error(e.to_string());
            self.teardown().await;
            return false;
        }

        match tokio::time::timeout(self.config.hello_timeout, hello_rx).await {
            Ok(Ok(())) => {
                tracing::info!("Connected to {}", self.config.url);
                true
            }
            Ok(Err(_)) => {
                callbacks.network_error("Connection closed during handshake");
                self.teardown().await;
                false
            }
            Err(_) => {
                callbacks.network_error(TransportError::Timeout("server hello").to_string());
                self.teardown().await;
                false
            }
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink
                .send(message)
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string())),
            None => Err(TransportError::NotInitialized),
        }
    }

    /// Drop the socket and receive task; returns whether channel-closed is owed
    async fn teardown(&self) -> bool {
        let connection = self.connection.lock().take();
        if let Some(task) = self.receive_task.lock().take() {
            task.abort();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        connection.map(|c| c.finish()).unwrap_or(false)
    }
}

async fn receive_loop(mut stream: SplitStream<WsStream>, connection: Arc<Connection>, inbound: Inbound) {
    let mut failure = None;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => inbound.on_text(&connection, &text),
            Ok(Message::Binary(data)) => {
                if connection.is_open() {
                    inbound.callbacks.get().incoming_audio(Bytes::from(data));
                }
            }
            Ok(Message::Close(frame)) => {
                tracing::info!("Server closed the connection: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }

    if !connection.alive.load(Ordering::SeqCst) {
        // Closed locally
        return;
    }

    let callbacks = inbound.callbacks.get();
    if let Some(reason) = failure {
        callbacks.network_error(format!("Connection error: {}", reason));
    }
    if connection.finish() {
        tracing::info!("Audio channel closed by peer");
        callbacks.channel_closed();
    }
}

impl Transport for StreamTransport {
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
            if self.teardown().await {
                tracing::info!("Audio channel closed");
                self.callbacks.get().channel_closed();
            }
            self.session.lock().session_id.clear();
        }
        .boxed()
    }

    fn is_audio_channel_opened(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    fn send_audio(&self, frame: Bytes) -> BoxFuture<'_, ()> {
        async move {
            if !self.is_audio_channel_opened() {
                return;
            }
            if let Err(e) = self.send_message(Message::Binary(frame.to_vec())).await {
                self.callbacks.get().network_error(format!("Failed to send audio: {}", e));
            }
        }
        .boxed()
    }

    fn send_text(&self, text: String) -> BoxFuture<'_, ()> {
        async move {
            if let Err(e) = self.send_message(Message::Text(text)).await {
                match e {
                    TransportError::NotInitialized => tracing::error!("Cannot send, not connected"),
                    e => self.callbacks.get().network_error(format!("Failed to send message: {}", e)),
                }
            }
        }
        .boxed()
    }

    fn session_id(&self) -> String {
        self.session.lock().session_id.clone()
    }

    fn server_sample_rate(&self) -> Option<u32> {
        self.session.lock().server_sample_rate
    }
}

/// Server hello addressed to this transport
fn parse_hello(value: &Value) -> Result<ServerHello, ProtocolError> {
    match ServerMessage::from_value(value)? {
        ServerMessage::Hello(hello) => {
            hello.expect_transport(TRANSPORT_KIND)?;
            Ok(hello)
        }
        _ => Err(ProtocolError::UnsupportedTransport(None)),
    }
}
