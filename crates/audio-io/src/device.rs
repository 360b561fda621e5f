//! Device discovery and selection.
//!
//! Indices are positions in the backend's per-direction enumeration at call time.
//! Nothing here is cached: devices can appear or vanish between calls.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::{AudioBackend, CpalBackend};
use crate::error::{AudioError, Result};

/// Stream direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Snapshot of one device as reported by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
    pub direction: Direction,
}

/// Device selector. The raw integer form uses `-1` for the default device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum DeviceIndex {
    #[default]
    Default,
    Index(usize),
}

impl DeviceIndex {
    pub fn is_default(&self) -> bool {
        matches!(self, DeviceIndex::Default)
    }

    /// `other` when `self` is the default selector.
    pub fn or(self, other: DeviceIndex) -> DeviceIndex {
        match self {
            DeviceIndex::Default => other,
            explicit => explicit,
        }
    }
}

impl TryFrom<i32> for DeviceIndex {
    type Error = AudioError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            -1 => Ok(DeviceIndex::Default),
            i if i >= 0 => Ok(DeviceIndex::Index(i as usize)),
            other => Err(AudioError::Config(format!(
                "device index must be -1 (default) or >= 0, got {other}"
            ))),
        }
    }
}

impl From<DeviceIndex> for i32 {
    fn from(index: DeviceIndex) -> i32 {
        match index {
            DeviceIndex::Default => -1,
            DeviceIndex::Index(i) => i32::try_from(i).unwrap_or(i32::MAX),
        }
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIndex::Default => f.write_str("default"),
            DeviceIndex::Index(i) => write!(f, "#{i}"),
        }
    }
}

/// How [`DeviceIndex::Default`] resolves to a concrete device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DefaultDevicePolicy {
    /// The host's default device, or the first listed one when the host has none.
    #[default]
    HostDefault,
    /// Always the first device of the enumeration.
    FirstListed,
}

/// Input devices of the default host.
pub fn list_input_devices() -> Result<Vec<DeviceDescriptor>> {
    CpalBackend::new().devices(Direction::Input)
}

/// Output devices of the default host.
pub fn list_output_devices() -> Result<Vec<DeviceDescriptor>> {
    CpalBackend::new().devices(Direction::Output)
}

/// Index of the first device whose name contains `needle` (case-insensitive).
pub fn find_device_by_name(devices: &[DeviceDescriptor], needle: &str) -> Option<usize> {
    devices
        .iter()
        .find(|d| matches_device_name(&d.name, needle))
        .map(|d| d.index)
}

pub(crate) fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}
