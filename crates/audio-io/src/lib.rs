//! Live PCM16 audio capture and playback.
//!
//! Capture delivers fixed-size chunks of interleaved little-endian 16-bit samples to a
//! single registered sink. Playback accepts arbitrary-length byte buffers and blocks the
//! writer while the device catches up. Both engines share one lifecycle
//! (`Idle`, `Running`, `Stopped`, `Errored`, `Closed`) and read their defaults from a
//! process-wide [`ConfigStore`] at `start`.

pub mod backend;
mod capture;
pub mod config;
pub mod decode;
pub mod device;
mod error;
mod lifecycle;
mod playback;
mod queue;
pub mod status;

pub use capture::{AudioBuffer, AudioCapture, CaptureSink};
pub use config::{
    AudioConfig, ConfigPatch, ConfigStore, EngineTuning, StreamConfig, get_config, init,
    init_config, update_config,
};
pub use device::{
    DefaultDevicePolicy, DeviceDescriptor, DeviceIndex, Direction, find_device_by_name,
    list_input_devices, list_output_devices,
};
pub use error::{AudioError, Result};
pub use lifecycle::{ManagedStream, StreamGuard, StreamState};
pub use playback::AudioPlayer;
pub use status::{CaptureStats, PlaybackStats, StreamEvent};
