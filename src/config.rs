//! Client configuration
//!
//! One TOML file in the platform config directory. A missing file is created
//! with defaults on first load, which also fixes the generated client and
//! device identities for later runs.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_CHANNELS, DEFAULT_FRAME_DURATION_MS, DEFAULT_INPUT_SAMPLE_RATE,
    DEFAULT_OUTPUT_SAMPLE_RATE, DRAIN_MAX_ATTEMPTS,
};
use crate::error::{ConfigError, TransportError};
use crate::protocol::AudioParams;

const CONFIG_FILE: &str = "config.toml";

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub mqtt: Option<MqttInfo>,
    pub audio: AudioConfig,
    pub session: SessionConfig,
}

/// Identity presented to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub client_id: String,
    /// MAC-formatted device identifier
    pub device_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            device_id: generate_device_id(),
        }
    }
}

/// Locally administered MAC address derived from random bytes
fn generate_device_id() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[..6]);
    mac[0] = (mac[0] | 0x02) & !0x01;
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Stream transport endpoint and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub websocket_url: String,
    pub access_token: String,
    /// Provisioning endpoint used by device registration
    pub ota_version_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            websocket_url: "wss://assistant.example.com/v1/".to_string(),
            access_token: "test-token".to_string(),
            ota_version_url: "https://assistant.example.com/ota/".to_string(),
        }
    }
}

/// Control-plane settings for the split transport, provisioned externally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttInfo {
    pub endpoint: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub publish_topic: String,
    pub subscribe_topic: String,
}

impl MqttInfo {
    /// Names of the fields that are still empty
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("endpoint", &self.endpoint),
            ("client_id", &self.client_id),
            ("username", &self.username),
            ("password", &self.password),
            ("publish_topic", &self.publish_topic),
            ("subscribe_topic", &self.subscribe_topic),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect()
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TransportError::IncompleteSettings(missing.join(", ")))
        }
    }
}

/// Audio format settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Parameters advertised in the client hello
    pub fn hello_params(&self) -> AudioParams {
        AudioParams {
            format: "opus".to_string(),
            sample_rate: self.input_sample_rate,
            channels: self.channels,
            frame_duration: self.frame_duration_ms,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

/// Session timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub handshake_timeout_ms: u64,
    /// Bound on a whole channel open, handshake included
    pub open_channel_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub abort_relisten_delay_ms: u64,
    pub drain_max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            open_channel_timeout_ms: 15_000,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 2_000,
            abort_relisten_delay_ms: 200,
            drain_max_attempts: DRAIN_MAX_ATTEMPTS,
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn open_channel_timeout(&self) -> Duration {
        Duration::from_millis(self.open_channel_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn abort_relisten_delay(&self) -> Duration {
        Duration::from_millis(self.abort_relisten_delay_ms)
    }
}

/// One-shot provisioning of split-transport credentials
pub trait DeviceRegistration: Send {
    fn register(&mut self, device: &DeviceConfig) -> Result<MqttInfo, TransportError>;
}

impl AppConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        ProjectDirs::from("", "", "voice-assistant-client")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from the default location, writing defaults when missing
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            tracing::info!("Wrote default configuration to {}", path.display());
            return Ok(config);
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Look up a value by dotted path, e.g. `session.reconnect_attempts`
    pub fn lookup(&self, path: &str) -> Option<toml::Value> {
        let mut current = toml::Value::try_from(self).ok()?;
        for key in path.split('.') {
            current = match current {
                toml::Value::Table(mut table) => table.remove(key)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Provisioned split-transport settings, registering the device if absent
    pub fn ensure_mqtt(
        &mut self,
        registration: &mut dyn DeviceRegistration,
    ) -> Result<&MqttInfo, TransportError> {
        let complete = self
            .mqtt
            .as_ref()
            .map(|info| info.validate().is_ok())
            .unwrap_or(false);

        if !complete {
            tracing::info!("Registering device {}", self.device.device_id);
            let info = registration.register(&self.device)?;
            info.validate()?;
            self.mqtt = Some(info);
        }

        self.mqtt.as_ref().ok_or(TransportError::NotInitialized)
    }
}
