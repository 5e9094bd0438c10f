//! Raw PCM stream seams
//!
//! The frame codec adapter talks to the sound hardware only through these
//! two traits. The cpal implementations live in `capture` and `playback`.

use crate::error::AudioError;

/// Microphone side
pub trait InputStream: Send {
    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    fn is_active(&self) -> bool;

    /// Take exactly `samples` interleaved samples, or `None` if fewer are buffered
    fn read(&mut self, samples: usize) -> Result<Option<Vec<i16>>, AudioError>;
}

/// Speaker side
pub trait OutputStream: Send {
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop after the samples already written have been played, bounded in time
    fn stop(&mut self) -> Result<(), AudioError>;

    fn is_active(&self) -> bool;

    /// Append samples for playback without blocking on the device
    fn write(&mut self, pcm: &[i16]) -> Result<(), AudioError>;

    /// Drop samples written but not yet played
    fn discard(&mut self);
}
