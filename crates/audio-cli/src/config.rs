//! Effective engine defaults: built-in values, then the TOML file, then flags.

use std::path::Path;

use anyhow::{Context, Result};
use audio_io::{AudioConfig, ConfigPatch, DeviceIndex};

use crate::cli::Args;

/// Parse a TOML defaults file. Every key is optional.
pub fn load_file(path: &Path) -> Result<ConfigPatch> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
}

/// Command-line overrides as a patch.
pub fn flags_patch(args: &Args) -> Result<ConfigPatch> {
    Ok(ConfigPatch {
        sample_rate: args.sample_rate,
        channels: args.channels,
        chunk_size: args.chunk_size,
        capture_device: args
            .capture_device
            .map(DeviceIndex::try_from)
            .transpose()
            .context("--capture-device")?,
        player_device: args
            .player_device
            .map(DeviceIndex::try_from)
            .transpose()
            .context("--player-device")?,
    })
}

/// Merge file and flags over the built-in defaults and validate.
pub fn resolve(args: &Args) -> Result<AudioConfig> {
    let file = match &args.config {
        Some(path) => load_file(path)?,
        None => ConfigPatch::default(),
    };
    let config = file
        .overlay(flags_patch(args)?)
        .apply(AudioConfig::default());
    config.validate().context("invalid audio config")?;
    Ok(config)
}
