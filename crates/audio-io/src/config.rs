//! Stream configuration and the process-wide defaults store.
//!
//! Engines never read the store while streaming: they copy a snapshot out of it at
//! `start` and validate that snapshot once.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::device::DeviceIndex;
use crate::error::{AudioError, Result};

/// Bytes per PCM16 sample.
pub const SAMPLE_WIDTH_BYTES: usize = 2;

const MAX_SAMPLE_RATE: u32 = 768_000;
const MAX_CHANNELS: u16 = 32;

/// Parameters of one PCM16 stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Capture delivery unit in bytes. Must hold whole frames.
    pub chunk_size: usize,
    pub device: DeviceIndex,
}

impl StreamConfig {
    pub fn new(sample_rate: u32, channels: u16, chunk_size: usize) -> Self {
        Self {
            sample_rate,
            channels,
            chunk_size,
            device: DeviceIndex::Default,
        }
    }

    pub fn with_device(mut self, device: DeviceIndex) -> Self {
        self.device = device;
        self
    }

    /// Bytes in one interleaved frame.
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * SAMPLE_WIDTH_BYTES
    }

    /// Frames carried by one capture chunk.
    pub fn chunk_frames(&self) -> usize {
        self.chunk_size / self.bytes_per_frame().max(1)
    }

    /// Check the PCM16 invariants.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.sample_rate > MAX_SAMPLE_RATE {
            return Err(AudioError::Config(format!(
                "sample_rate must be in 1..={MAX_SAMPLE_RATE}, got {}",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(AudioError::Config(format!(
                "channels must be in 1..={MAX_CHANNELS}, got {}",
                self.channels
            )));
        }
        if self.chunk_size == 0 {
            return Err(AudioError::Config("chunk_size must be positive".into()));
        }
        let frame = self.bytes_per_frame();
        if self.chunk_size % frame != 0 {
            return Err(AudioError::Config(format!(
                "chunk_size {} is not a multiple of the {frame}-byte frame ({} ch x 16-bit)",
                self.chunk_size, self.channels
            )));
        }
        Ok(())
    }
}

/// Round `chunk_size` down to whole frames, keeping at least one frame.
pub(crate) fn align_chunk_size(chunk_size: usize, channels: u16) -> usize {
    let frame = channels.max(1) as usize * SAMPLE_WIDTH_BYTES;
    (chunk_size / frame).max(1) * frame
}

/// Process-wide defaults that seed new sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: usize,
    pub capture_device: DeviceIndex,
    pub player_device: DeviceIndex,
}

impl Default for AudioConfig {
    /// 16 kHz mono, 100 ms chunks, default devices.
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_size: 3_200,
            capture_device: DeviceIndex::Default,
            player_device: DeviceIndex::Default,
        }
    }
}

impl AudioConfig {
    /// Stream config for the capture side.
    pub fn capture_stream(&self) -> StreamConfig {
        StreamConfig::new(self.sample_rate, self.channels, self.chunk_size)
            .with_device(self.capture_device)
    }

    /// Stream config for the playback side.
    pub fn player_stream(&self) -> StreamConfig {
        StreamConfig::new(self.sample_rate, self.channels, self.chunk_size)
            .with_device(self.player_device)
    }

    pub fn validate(&self) -> Result<()> {
        self.capture_stream().validate()
    }
}

/// Partial update for [`ConfigStore::update`]; `None` keeps the current value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub chunk_size: Option<usize>,
    pub capture_device: Option<DeviceIndex>,
    pub player_device: Option<DeviceIndex>,
}

impl ConfigPatch {
    /// Fields set in `over` win.
    pub fn overlay(self, over: ConfigPatch) -> ConfigPatch {
        ConfigPatch {
            sample_rate: over.sample_rate.or(self.sample_rate),
            channels: over.channels.or(self.channels),
            chunk_size: over.chunk_size.or(self.chunk_size),
            capture_device: over.capture_device.or(self.capture_device),
            player_device: over.player_device.or(self.player_device),
        }
    }

    /// Merge into `base` without validating.
    pub fn apply(&self, mut base: AudioConfig) -> AudioConfig {
        if let Some(v) = self.sample_rate {
            base.sample_rate = v;
        }
        if let Some(v) = self.channels {
            base.channels = v;
        }
        if let Some(v) = self.chunk_size {
            base.chunk_size = v;
        }
        if let Some(v) = self.capture_device {
            base.capture_device = v;
        }
        if let Some(v) = self.player_device {
            base.player_device = v;
        }
        base
    }
}

/// Defaults store: written rarely, read on every `start`.
///
/// Reads copy the value out under a short read lock, so a reader never observes a
/// half-written config and never holds the lock afterwards.
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: RwLock<AudioConfig>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AudioConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(config),
        })
    }

    /// The store shared by every engine that was not given its own.
    pub fn global() -> Arc<ConfigStore> {
        static GLOBAL: OnceLock<Arc<ConfigStore>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(ConfigStore::new())).clone()
    }

    /// Replace the whole config. Invalid input leaves the previous value in place.
    pub fn init(&self, config: AudioConfig) -> Result<()> {
        config.validate()?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = config;
        tracing::debug!(?config, "audio config initialized");
        Ok(())
    }

    /// Merge `patch` into the current config and return the result.
    pub fn update(&self, patch: ConfigPatch) -> Result<AudioConfig> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let merged = patch.apply(*guard);
        merged.validate()?;
        *guard = merged;
        Ok(merged)
    }

    pub fn get(&self) -> AudioConfig {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Set the process-wide defaults. Device indices use `-1` for "auto-select".
pub fn init(
    sample_rate: u32,
    channels: u16,
    chunk_size: usize,
    capture_device: i32,
    player_device: i32,
) -> Result<()> {
    init_config(AudioConfig {
        sample_rate,
        channels,
        chunk_size,
        capture_device: DeviceIndex::try_from(capture_device)?,
        player_device: DeviceIndex::try_from(player_device)?,
    })
}

pub fn init_config(config: AudioConfig) -> Result<()> {
    ConfigStore::global().init(config)
}

pub fn update_config(patch: ConfigPatch) -> Result<AudioConfig> {
    ConfigStore::global().update(patch)
}

/// Snapshot of the process-wide defaults.
pub fn get_config() -> AudioConfig {
    ConfigStore::global().get()
}

/// Engine tuning shared by the capture and playback paths.
#[derive(Clone, Debug)]
pub struct EngineTuning {
    /// Playback queue capacity, in seconds of audio.
    pub playback_buffer_seconds: f32,
    /// Frames requested per output callback.
    pub output_frames_per_buffer: u32,
    /// Lower bound on frames requested per input callback.
    pub min_capture_frames: u32,
    /// Capacity of the event side channel.
    pub event_capacity: usize,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            playback_buffer_seconds: 0.5,
            output_frames_per_buffer: 256,
            min_capture_frames: 64,
            event_capacity: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_values() {
        let store = ConfigStore::new();
        let cfg = store.get();
        assert_eq!(cfg.sample_rate, 16_000);
        assert_eq!(cfg.channels, 1);
        assert_eq!(cfg.chunk_size, 3_200);
        assert_eq!(cfg.capture_device, DeviceIndex::Default);
        assert_eq!(cfg.player_device, DeviceIndex::Default);
    }

    #[test]
    fn init_replaces_every_field() {
        let store = ConfigStore::new();
        store
            .init(AudioConfig {
                sample_rate: 48_000,
                channels: 2,
                chunk_size: 4_096,
                capture_device: DeviceIndex::Index(1),
                player_device: DeviceIndex::Index(2),
            })
            .unwrap();
        store
            .init(AudioConfig {
                sample_rate: 8_000,
                channels: 1,
                chunk_size: 320,
                capture_device: DeviceIndex::Default,
                player_device: DeviceIndex::Default,
            })
            .unwrap();
        let cfg = store.get();
        assert_eq!(cfg.sample_rate, 8_000);
        assert_eq!(cfg.capture_device, DeviceIndex::Default);
        assert_eq!(cfg.player_device, DeviceIndex::Default);
    }

    #[test]
    fn invalid_init_keeps_previous_value() {
        let store = ConfigStore::new();
        let bad = AudioConfig {
            channels: 2,
            chunk_size: 3_202,
            ..AudioConfig::default()
        };
        assert!(matches!(store.init(bad), Err(AudioError::Config(_))));
        assert_eq!(store.get(), AudioConfig::default());
    }

    #[test]
    fn update_merges_only_set_fields() {
        let store = ConfigStore::new();
        let merged = store
            .update(ConfigPatch {
                sample_rate: Some(44_100),
                ..ConfigPatch::default()
            })
            .unwrap();
        assert_eq!(merged.sample_rate, 44_100);
        assert_eq!(merged.channels, 1);
        assert_eq!(merged.chunk_size, 3_200);
    }

    #[test]
    fn update_rejects_merged_result_that_breaks_alignment() {
        let store = ConfigStore::new();
        let err = store.update(ConfigPatch {
            channels: Some(3),
            ..ConfigPatch::default()
        });
        assert!(matches!(err, Err(AudioError::Config(_))));
        assert_eq!(store.get().channels, 1);
    }

    #[test]
    fn validate_rejects_zero_values() {
        assert!(StreamConfig::new(0, 1, 3_200).validate().is_err());
        assert!(StreamConfig::new(16_000, 0, 3_200).validate().is_err());
        assert!(StreamConfig::new(16_000, 1, 0).validate().is_err());
        assert!(StreamConfig::new(16_000, 2, 4_096).validate().is_ok());
    }

    #[test]
    fn validate_rejects_partial_frames() {
        let err = StreamConfig::new(16_000, 2, 4_098).validate();
        assert!(matches!(err, Err(AudioError::Config(_))));
    }

    #[test]
    fn chunk_frames_accounts_for_channels() {
        assert_eq!(StreamConfig::new(16_000, 1, 3_200).chunk_frames(), 1_600);
        assert_eq!(StreamConfig::new(48_000, 2, 4_096).chunk_frames(), 1_024);
    }

    #[test]
    fn align_chunk_size_keeps_whole_frames() {
        assert_eq!(align_chunk_size(3_200, 1), 3_200);
        assert_eq!(align_chunk_size(3_201, 2), 3_200);
        assert_eq!(align_chunk_size(1, 2), 4);
    }

    #[test]
    fn config_serializes_with_raw_device_indices() {
        let json = serde_json::to_value(AudioConfig::default()).unwrap();
        assert_eq!(json["sample_rate"], 16_000);
        assert_eq!(json["channels"], 1);
        assert_eq!(json["chunk_size"], 3_200);
        assert_eq!(json["capture_device"], -1);
        assert_eq!(json["player_device"], -1);
    }

    #[test]
    fn patch_overlay_prefers_later_fields() {
        let file = ConfigPatch {
            sample_rate: Some(44_100),
            channels: Some(2),
            ..ConfigPatch::default()
        };
        let flags = ConfigPatch {
            sample_rate: Some(48_000),
            player_device: Some(DeviceIndex::Index(2)),
            ..ConfigPatch::default()
        };
        let merged = file.overlay(flags).apply(AudioConfig::default());
        assert_eq!(merged.sample_rate, 48_000);
        assert_eq!(merged.channels, 2);
        assert_eq!(merged.chunk_size, 3_200);
        assert_eq!(merged.player_device, DeviceIndex::Index(2));
        assert_eq!(merged.capture_device, DeviceIndex::Default);
    }

    #[test]
    fn patch_reads_raw_device_indices() {
        let patch: ConfigPatch =
            serde_json::from_str(r#"{"capture_device": -1, "player_device": 3}"#).unwrap();
        assert_eq!(patch.capture_device, Some(DeviceIndex::Default));
        assert_eq!(patch.player_device, Some(DeviceIndex::Index(3)));
        assert!(serde_json::from_str::<ConfigPatch>(r#"{"player_device": -4}"#).is_err());
        assert!(serde_json::from_str::<ConfigPatch>(r#"{"rate": 8000}"#).is_err());
    }
}
