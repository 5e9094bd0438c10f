//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod frame_codec;
pub mod playback;
pub mod poller;
pub mod stream;

pub use buffer::{PlaybackQueue, QueueStats};
pub use capture::CpalInputStream;
pub use device::{list_devices, AudioDeviceInfo};
pub use frame_codec::FrameCodec;
pub use playback::CpalOutputStream;
pub use poller::AudioPollers;
pub use stream::{InputStream, OutputStream};
