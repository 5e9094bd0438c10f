//! Uplink speech encoding
//!
//! One microphone block in, one Opus frame out. The encoder is tuned for
//! voice with in-band FEC so a lost datagram can be partly recovered from
//! the next one.

use bytes::Bytes;
use opus::{Application, Encoder};

use super::{frame_size, opus_channels, FrameEncoder};
use crate::error::CodecError;

/// Upper bound on one encoded frame; Opus packets never exceed 1275 bytes per 20 ms
const MAX_PACKET: usize = 4000;

pub struct OpusFrameEncoder {
    encoder: Encoder,
    sample_rate: u32,
    /// Per-channel samples in one block
    block: usize,
    channels: usize,
    packet: Vec<u8>,
}

impl OpusFrameEncoder {
    /// Encoder for blocks of `frame_duration_ms`
    pub fn new(sample_rate: u32, channels: u16, frame_duration_ms: u32) -> Result<Self, CodecError> {
        let layout = opus_channels(channels)
            .ok_or_else(|| CodecError::EncoderInit(format!("{} channels not supported", channels)))?;
        let mut encoder = Encoder::new(sample_rate, layout, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| CodecError::EncoderInit(format!("in-band FEC: {}", e)))?;

        Ok(Self {
            encoder,
            sample_rate,
            block: frame_size(sample_rate, frame_duration_ms),
            channels: channels as usize,
            packet: vec![0; MAX_PACKET],
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError> {
        if pcm.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }
        let len = self
            .encoder
            .encode(pcm, &mut self.packet)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        Ok(Bytes::copy_from_slice(&self.packet[..len]))
    }

    fn samples_per_frame(&self) -> usize {
        self.block * self.channels
    }
}
