//! Audio device lookup and enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Sample rates probed when listing devices
const PROBED_RATES: [u32; 5] = [16000, 24000, 44100, 48000, 96000];

/// Device summary shown by the front end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Input device by exact name, or the host default when `name` is `None`
pub fn find_input_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
        Some(name) => {
            let devices = host
                .input_devices()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
            find_by_name(devices, name)
        }
    }
}

/// Output device by exact name, or the host default when `name` is `None`
pub fn find_output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string())),
        Some(name) => {
            let devices = host
                .output_devices()
                .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
            find_by_name(devices, name)
        }
    }
}

fn find_by_name(
    devices: impl Iterator<Item = cpal::Device>,
    name: &str,
) -> Result<cpal::Device, AudioError> {
    devices
        .into_iter()
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| AudioError::DeviceNotFound(name.to_string()))
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                // Duplex devices show up once
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }
                let (sample_rates, channels) = capabilities(&device, false);
                devices.push(AudioDeviceInfo {
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in PROBED_RATES {
            let sr = cpal::SampleRate(rate);
            if sr >= config.min_sample_rate() && sr <= config.max_sample_rate() && !sample_rates.contains(&rate) {
                sample_rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }
    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}
