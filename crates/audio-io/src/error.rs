//! Error taxonomy for the audio engine.
//!
//! Configuration and lifecycle errors are returned synchronously to the call that caused
//! them. Data-path glitches (overruns, underruns) are never errors; see [`crate::status`].

use thiserror::Error;

/// Errors returned by the engine's public operations.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Invalid sample rate, channel count, chunk size or device index.
    #[error("invalid stream config: {0}")]
    Config(String),

    /// The device index is unknown, busy, or cannot run the requested format.
    #[error("failed to open device: {0}")]
    DeviceOpen(String),

    /// `start` was called on a stream that is already running.
    #[error("stream is already running")]
    AlreadyRunning,

    /// The operation needs a running stream (e.g. `write` after `stop`/`close`).
    #[error("stream is closed")]
    StreamClosed,

    /// No usable audio subsystem.
    #[error("audio backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Unrecoverable mid-stream failure. The stream must be closed before it can be reopened.
    #[error("stream failed: {0}")]
    Stream(String),

    /// `stop`/`close` was invoked from inside the engine's own capture callback.
    #[error("cannot stop a stream from inside its own callback")]
    CalledFromCallback,

    /// The file is not a 16-bit PCM file the engine can play.
    #[error("unsupported audio file: {0}")]
    UnsupportedFile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;
