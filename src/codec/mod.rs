//! Frame codec primitives
//!
//! The session engine only sees opaque encoded frames. These traits are the
//! seam between it and the concrete Opus implementation.

pub mod decoder;
pub mod encoder;

pub use decoder::OpusFrameDecoder;
pub use encoder::OpusFrameEncoder;

use bytes::Bytes;

use crate::error::CodecError;

/// Encodes one fixed-duration block of PCM into a frame
pub trait FrameEncoder: Send {
    /// Input must hold exactly one frame of interleaved i16 samples
    fn encode(&mut self, pcm: &[i16]) -> Result<Bytes, CodecError>;

    /// Samples per frame across all channels
    fn samples_per_frame(&self) -> usize;
}

/// Decodes one encoded frame into PCM
pub trait FrameDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, CodecError>;
}

/// Opus channel layout for a channel count; only mono and stereo exist
fn opus_channels(channels: u16) -> Option<opus::Channels> {
    match channels {
        1 => Some(opus::Channels::Mono),
        2 => Some(opus::Channels::Stereo),
        _ => None,
    }
}

/// Samples per channel in a frame of `duration_ms` at `sample_rate`
pub fn frame_size(sample_rate: u32, duration_ms: u32) -> usize {
    (sample_rate as u64 * duration_ms as u64 / 1000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(frame_size(16000, 60), 960);
        assert_eq!(frame_size(24000, 60), 1440);
        assert_eq!(frame_size(48000, 10), 480);
    }

    #[test]
    fn test_only_mono_and_stereo() {
        assert!(opus_channels(1).is_some());
        assert!(opus_channels(2).is_some());
        assert!(opus_channels(0).is_none());
        assert!(opus_channels(6).is_none());
    }
}
