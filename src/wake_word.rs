//! Wake-word spotter seam
//!
//! Spotting itself happens outside this crate. The session engine only
//! pauses and resumes the spotter around conversations and reacts to its
//! two callbacks, which may arrive on any thread.

use std::sync::Arc;

use crate::error::AudioError;

/// Called with the spotted word and the full recognized text
pub type DetectionCallback = Arc<dyn Fn(String, String) + Send + Sync>;

/// Called when the spotter fails
pub type SpotterErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

pub trait WakeWordSpotter: Send + Sync {
    fn set_callbacks(&self, on_detected: DetectionCallback, on_error: SpotterErrorCallback);

    fn start(&self) -> Result<(), AudioError>;

    fn pause(&self);

    fn resume(&self);

    fn stop(&self);

    fn is_running(&self) -> bool;

    fn is_paused(&self) -> bool;
}
