//! MQTT control link for the split transport

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::split::{ControlConnector, ControlEvent, ControlEventHandler, ControlLink};
use crate::config::MqttInfo;
use crate::constants::{MQTT_KEEP_ALIVE, MQTT_TLS_PORT};
use crate::error::TransportError;

/// Requests buffered between the client handle and its event loop
const REQUEST_CAPACITY: usize = 32;

/// How long a clean disconnect may take before the event loop is dropped
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Opens TLS MQTT sessions against the provisioned broker
#[derive(Debug, Clone)]
pub struct MqttConnector {
    port: u16,
    tls: bool,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            port: MQTT_TLS_PORT,
            tls: true,
        }
    }
}

impl MqttConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain TCP on a custom port, for local brokers
    pub fn plaintext(port: u16) -> Self {
        Self { port, tls: false }
    }

    fn options(&self, info: &MqttInfo) -> MqttOptions {
        let mut options = MqttOptions::new(info.client_id.clone(), info.endpoint.clone(), self.port);
        options.set_keep_alive(MQTT_KEEP_ALIVE);
        options.set_credentials(info.username.clone(), info.password.clone());
        if self.tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        options
    }
}

/// Poll until the broker acknowledges the connection
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::ConnectionFailed(format!("broker refused: {:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(TransportError::ConnectionFailed(e.to_string())),
        }
    }
}

async fn run_eventloop(mut eventloop: EventLoop, on_event: ControlEventHandler) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => match String::from_utf8(publish.payload.to_vec()) {
                Ok(text) => on_event(ControlEvent::Message(text)),
                Err(_) => tracing::warn!("Dropping non UTF-8 message on {}", publish.topic),
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                on_event(ControlEvent::Disconnected(None));
                break;
            }
            // Our own disconnect request
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                on_event(ControlEvent::Disconnected(Some(e.to_string())));
                break;
            }
        }
    }
    tracing::debug!("MQTT event loop finished");
}

impl ControlConnector for MqttConnector {
    fn connect(
        &self,
        info: MqttInfo,
        on_event: ControlEventHandler,
    ) -> BoxFuture<'_, Result<Box<dyn ControlLink>, TransportError>> {
        async move {
            let (client, mut eventloop) = AsyncClient::new(self.options(&info), REQUEST_CAPACITY);

            await_connack(&mut eventloop).await?;
            tracing::info!("Connected to MQTT broker {}:{}", info.endpoint, self.port);

            client
                .subscribe(info.subscribe_topic.clone(), QoS::AtMostOnce)
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

            let task = tokio::spawn(run_eventloop(eventloop, on_event));
            Ok(Box::new(MqttLink {
                client,
                publish_topic: info.publish_topic,
                task: Mutex::new(Some(task)),
            }) as Box<dyn ControlLink>)
        }
        .boxed()
    }
}

/// A connected MQTT session
struct MqttLink {
    client: AsyncClient,
    publish_topic: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlLink for MqttLink {
    fn publish(&self, payload: String) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            self.client
                .publish(self.publish_topic.clone(), QoS::AtMostOnce, false, payload.into_bytes())
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }
        .boxed()
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        async move {
            if let Err(e) = self.client.disconnect().await {
                tracing::debug!("MQTT disconnect request failed: {}", e);
            }
            let task = self.task.lock().take();
            if let Some(mut task) = task {
                if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                    task.abort();
                }
            }
        }
        .boxed()
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> MqttInfo {
        MqttInfo {
            endpoint: "broker.local".into(),
            client_id: "device-1".into(),
            username: "user".into(),
            password: "secret".into(),
            publish_topic: "device-server".into(),
            subscribe_topic: "devices/device-1".into(),
        }
    }

    #[test]
    fn test_options_from_provisioned_settings() {
        let options = MqttConnector::new().options(&info());
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(options.client_id(), "device-1");
        assert_eq!(options.keep_alive(), Duration::from_secs(90));
        assert_eq!(options.credentials(), Some(("user".to_string(), "secret".to_string())));
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails() {
        let connector = MqttConnector::plaintext(1);
        let mut info = info();
        info.endpoint = "127.0.0.1".into();
        let result = connector.connect(info, std::sync::Arc::new(|_| {})).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
