//! Downlink speech decoding
//!
//! Frames are decoded at the local playback rate. Opus resamples internally,
//! so the rate the server encoded at never has to match.

use opus::Decoder;

use super::{opus_channels, FrameDecoder};
use crate::error::CodecError;

/// Longest frame Opus can carry
const MAX_FRAME_MS: usize = 120;

pub struct OpusFrameDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: usize,
    /// Scratch PCM sized for the longest frame
    pcm: Vec<i16>,
}

impl OpusFrameDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let layout = opus_channels(channels)
            .ok_or_else(|| CodecError::DecoderInit(format!("{} channels not supported", channels)))?;
        let decoder =
            Decoder::new(sample_rate, layout).map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        let channels = channels as usize;
        Ok(Self {
            decoder,
            sample_rate,
            channels,
            pcm: vec![0; sample_rate as usize * channels * MAX_FRAME_MS / 1000],
        })
    }

    /// Rate of the PCM handed to the speaker
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl FrameDecoder for OpusFrameDecoder {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError> {
        let per_channel = self
            .decoder
            .decode(frame, &mut self.pcm, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        Ok(self.pcm[..per_channel * self.channels].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameEncoder, OpusFrameEncoder};

    fn tone(samples: usize) -> Vec<i16> {
        (0..samples)
            .map(|i| {
                let t = i as f32 / 16000.0;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_uplink_frame_decodes_to_one_block() {
        let mut encoder = OpusFrameEncoder::new(16000, 1, 60).unwrap();
        let mut decoder = OpusFrameDecoder::new(16000, 1).unwrap();

        let pcm = tone(encoder.samples_per_frame());
        let decoded = decoder.decode(&encoder.encode(&pcm).unwrap()).unwrap();
        assert_eq!(decoded.len(), pcm.len());
    }

    #[test]
    fn test_decode_at_playback_rate() {
        let mut encoder = OpusFrameEncoder::new(16000, 1, 60).unwrap();
        let mut decoder = OpusFrameDecoder::new(24000, 1).unwrap();
        assert_eq!(decoder.sample_rate(), 24000);

        let decoded = decoder.decode(&encoder.encode(&[0i16; 960]).unwrap()).unwrap();
        assert_eq!(decoded.len(), 1440);
    }

    #[test]
    fn test_garbage_frame_is_an_error() {
        let mut decoder = OpusFrameDecoder::new(24000, 1).unwrap();
        // TOC byte announcing a code 3 packet with no frame count
        assert!(matches!(decoder.decode(&[0xFF]), Err(CodecError::DecodingFailed(_))));
        assert!(OpusFrameDecoder::new(24000, 4).is_err());
    }
}
