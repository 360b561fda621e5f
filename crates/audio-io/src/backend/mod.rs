//! Audio backend abstraction.
//!
//! The engines drive hardware only through [`AudioBackend`]. A backend opens one stream
//! per request and runs its callbacks on a thread it owns; dropping the returned
//! [`BackendStream`] stops the hardware and releases the device.
//!
//! - [`CpalBackend`]: host audio through CPAL.
//! - [`FakeBackend`]: deterministic, instrumented backend for tests.

mod cpal_host;
mod fake;

use std::sync::Arc;

use crate::device::{DeviceDescriptor, DeviceIndex, Direction};
use crate::error::Result;

pub use self::cpal_host::CpalBackend;
pub use self::fake::{FakeBackend, FakeInputScript, FakeOutputPace};

/// What the engine asks the backend to open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamRequest {
    pub direction: Direction,
    pub device: DeviceIndex,
    pub sample_rate: u32,
    pub channels: u16,
    /// Preferred frames per callback; backends may deliver other sizes.
    pub frames_per_buffer: u32,
}

/// One hardware-delivered block of interleaved capture samples.
#[derive(Clone, Copy, Debug)]
pub struct InputBlock<'a> {
    pub samples: &'a [i16],
    /// Data was lost before this block (the backend fell behind).
    pub overrun: bool,
}

/// Failure reported asynchronously by a backend stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendFault {
    /// The device went away. The stream cannot continue.
    Disconnected(String),
    /// Glitch the backend recovered from.
    Transient(String),
}

/// Receives capture blocks on the backend thread.
pub type InputHandler = Box<dyn FnMut(InputBlock<'_>) + Send + 'static>;

/// Fills an output block on the backend thread. Returns how many samples carried real
/// audio; the handler is responsible for writing silence past that point.
pub type OutputHandler = Box<dyn FnMut(&mut [i16]) -> usize + Send + 'static>;

/// Receives asynchronous stream faults.
pub type FaultHandler = Arc<dyn Fn(BackendFault) + Send + Sync + 'static>;

/// A host audio subsystem.
pub trait AudioBackend: Send + Sync {
    /// Short backend label for logs.
    fn name(&self) -> &'static str;

    /// Current device enumeration for `direction`.
    fn devices(&self, direction: Direction) -> Result<Vec<DeviceDescriptor>>;

    /// Open and start a capture stream.
    fn open_input(
        &self,
        request: &StreamRequest,
        on_data: InputHandler,
        on_fault: FaultHandler,
    ) -> Result<Box<dyn BackendStream>>;

    /// Open and start a playback stream.
    fn open_output(
        &self,
        request: &StreamRequest,
        on_fill: OutputHandler,
        on_fault: FaultHandler,
    ) -> Result<Box<dyn BackendStream>>;
}

/// A running backend stream. Dropping it stops the stream and joins its thread.
pub trait BackendStream: Send {
    fn device_name(&self) -> &str;
}
