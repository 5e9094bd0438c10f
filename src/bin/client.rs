//! Voice Assistant Console Client
//!
//! Drives one session engine from stdin commands, speaking to the service
//! over either the WebSocket or the MQTT + UDP transport.

use anyhow::{bail, Context, Result};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_assistant_client::{
    audio::{list_devices, CpalInputStream, CpalOutputStream, FrameCodec},
    codec::{OpusFrameDecoder, OpusFrameEncoder},
    config::AppConfig,
    display::TracingDisplay,
    protocol::AbortReason,
    session::{Client, ClientParts},
    transport::{
        mqtt::MqttConnector, split::SplitTransportConfig, stream::StreamTransportConfig,
        SplitTransport, StreamTransport, Transport,
    },
};

const USAGE: &str = "\
usage: voice-client [--protocol websocket|mqtt] [--config PATH] [--list-devices]

commands:
  toggle    start or end a conversation, or interrupt speech
  listen    push-to-talk press
  stop      push-to-talk release
  abort     interrupt the assistant
  auto on   keep listening after each reply
  auto off  return to standby after each reply
  status    print the device state
  quit      close the session and exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    WebSocket,
    Mqtt,
}

struct Args {
    protocol: Protocol,
    config: Option<PathBuf>,
    list_devices: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        protocol: Protocol::WebSocket,
        config: None,
        list_devices: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--protocol" => {
                args.protocol = match iter.next().as_deref() {
                    Some("websocket") => Protocol::WebSocket,
                    Some("mqtt") => Protocol::Mqtt,
                    other => bail!("unknown protocol {:?}\n{}", other, USAGE),
                }
            }
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--list-devices" => args.list_devices = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => bail!("unknown argument {}\n{}", other, USAGE),
        }
    }
    Ok(args)
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

fn build_transport(protocol: Protocol, config: &AppConfig) -> Result<Arc<dyn Transport>> {
    Ok(match protocol {
        Protocol::WebSocket => {
            tracing::info!("Using WebSocket transport: {}", config.network.websocket_url);
            Arc::new(StreamTransport::new(StreamTransportConfig::from_app(config)))
        }
        Protocol::Mqtt => {
            let mqtt = config
                .mqtt
                .as_ref()
                .context("the [mqtt] section must be provisioned for the mqtt protocol")?;
            mqtt.validate()?;
            tracing::info!("Using MQTT + UDP transport: {}", mqtt.endpoint);
            Arc::new(SplitTransport::new(
                SplitTransportConfig::from_app(config),
                Arc::new(MqttConnector::new()),
            ))
        }
    })
}

fn build_codec(config: &AppConfig) -> Result<Arc<FrameCodec>> {
    let audio = &config.audio;
    let encoder = OpusFrameEncoder::new(audio.input_sample_rate, audio.channels, audio.frame_duration_ms)?;
    let decoder = OpusFrameDecoder::new(audio.output_sample_rate, audio.channels)?;
    let input = CpalInputStream::new(audio.input_device.clone(), audio.input_sample_rate, audio.channels);
    let output = CpalOutputStream::new(audio.output_device.clone(), audio.output_sample_rate, audio.channels);

    Ok(Arc::new(FrameCodec::new(
        Box::new(input),
        Box::new(output),
        Box::new(encoder),
        Box::new(decoder),
    )))
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    tracing::info!("Device {} (client {})", config.device.device_id, config.device.client_id);

    let client = Client::start(ClientParts {
        transport: build_transport(args.protocol, &config)?,
        codec: build_codec(&config)?,
        display: Box::new(TracingDisplay::new()),
        wake_word: None,
        session: config.session.clone(),
        frame_interval: config.audio.frame_duration(),
    })?;

    println!("{}", USAGE);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["toggle"] => client.toggle_chat_state(),
            ["listen"] => client.start_listening(),
            ["stop"] => client.stop_listening(),
            ["abort"] => client.abort_speaking(AbortReason::None),
            ["auto", "on"] => client.set_auto_mode(true),
            ["auto", "off"] => client.set_auto_mode(false),
            ["status"] => println!("{}", client.device_state()),
            ["quit"] | ["exit"] => break,
            _ => println!("{}", USAGE),
        }
    }

    tracing::info!("Shutting down");
    client.shutdown();
    Ok(())
}
