//! StreamTransport against an in-process WebSocket server

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use voice_assistant_client::protocol::{AudioParams, ListeningMode};
use voice_assistant_client::transport::stream::StreamTransportConfig;
use voice_assistant_client::transport::{StreamTransport, Transport, TransportCallbacks};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Event {
    Opened,
    Closed,
    Audio(Vec<u8>),
    Json(Value),
    Error(String),
}

fn config(port: u16, hello_timeout: Duration) -> StreamTransportConfig {
    StreamTransportConfig {
        url: format!("ws://127.0.0.1:{}/v1/", port),
        access_token: "secret".into(),
        device_id: "02:00:00:00:00:01".into(),
        client_id: "client-1".into(),
        audio_params: AudioParams::default(),
        hello_timeout,
        playback_sample_rate: 24000,
    }
}

fn recording_callbacks() -> (TransportCallbacks, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (t1, t2, t3, t4, t5) = (tx.clone(), tx.clone(), tx.clone(), tx.clone(), tx);
    let callbacks = TransportCallbacks::new()
        .on_audio_channel_opened(move || {
            let _ = t1.send(Event::Opened);
        })
        .on_audio_channel_closed(move || {
            let _ = t2.send(Event::Closed);
        })
        .on_incoming_audio(move |frame| {
            let _ = t3.send(Event::Audio(frame.to_vec()));
        })
        .on_incoming_json(move |value| {
            let _ = t4.send(Event::Json(value));
        })
        .on_network_error(move |message| {
            let _ = t5.send(Event::Error(message));
        });
    (callbacks, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a transport event")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (auth_tx, auth_rx) = oneshot::channel();
    let (listen_tx, listen_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let capture_auth = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let auth = request.headers()["Authorization"].to_str().unwrap().to_string();
            let _ = auth_tx.send(auth);
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, capture_auth).await.unwrap();

        let hello: Value = match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected client hello, got {:?}", other),
        };
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["transport"], "websocket");
        assert_eq!(hello["audio_params"]["sample_rate"], 16000);

        let reply = r#"{"type":"hello","transport":"websocket","session_id":"sess-7","audio_params":{"sample_rate":24000}}"#;
        ws.send(Message::Text(reply.to_string())).await.unwrap();
        ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        ws.send(Message::Text(r#"{"type":"tts","state":"start"}"#.to_string()))
            .await
            .unwrap();

        if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
            let _ = listen_tx.send(serde_json::from_str::<Value>(&text).unwrap());
        }
        ws.close(None).await.unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let transport = StreamTransport::new(config(port, WAIT));
    let (callbacks, mut events) = recording_callbacks();
    transport.set_callbacks(callbacks);

    assert!(transport.open_audio_channel().await);
    assert!(transport.is_audio_channel_opened());
    assert_eq!(transport.session_id(), "sess-7");
    assert_eq!(transport.server_sample_rate(), Some(24000));
    assert_eq!(auth_rx.await.unwrap(), "Bearer secret");

    assert!(matches!(next_event(&mut events).await, Event::Opened));
    match next_event(&mut events).await {
        Event::Audio(frame) => assert_eq!(frame, vec![1, 2, 3]),
        other => panic!("expected audio, got {:?}", other),
    }
    match next_event(&mut events).await {
        Event::Json(value) => assert_eq!(value["type"], "tts"),
        other => panic!("expected json, got {:?}", other),
    }

    transport.send_start_listening(ListeningMode::AutoStop).await;
    let listen = tokio::time::timeout(WAIT, listen_rx).await.unwrap().unwrap();
    assert_eq!(listen["type"], "listen");
    assert_eq!(listen["session_id"], "sess-7");
    assert_eq!(listen["mode"], "auto");

    // Server-initiated close reports the channel closed exactly once
    assert!(matches!(next_event(&mut events).await, Event::Closed));
    assert!(!transport.is_audio_channel_opened());
    server.await.unwrap();

    transport.close_audio_channel().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_server_hello_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (done_tx, done_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = ws.next().await;
        // Hold the socket open without answering
        let _ = done_rx.await;
    });

    let transport = StreamTransport::new(config(port, Duration::from_millis(200)));
    let (callbacks, mut events) = recording_callbacks();
    transport.set_callbacks(callbacks);

    assert!(!transport.open_audio_channel().await);
    assert!(!transport.is_audio_channel_opened());
    match next_event(&mut events).await {
        Event::Error(message) => assert!(message.contains("server hello"), "{}", message),
        other => panic!("expected network error, got {:?}", other),
    }
    let _ = done_tx.send(());
}

#[tokio::test]
async fn unreachable_service_reports_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = StreamTransport::new(config(port, Duration::from_millis(500)));
    let (callbacks, mut events) = recording_callbacks();
    transport.set_callbacks(callbacks);

    assert!(!transport.open_audio_channel().await);
    assert!(matches!(next_event(&mut events).await, Event::Error(_)));
    assert!(transport.session_id().is_empty());
}
