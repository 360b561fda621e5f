//! CPAL-backed host audio.
//!
//! CPAL streams are not `Send`, so each stream is built, played and dropped on a
//! dedicated thread. The handle talks to that thread over two channels: one reports
//! whether the open succeeded, the other tells it to drop the stream.

use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;

use super::{
    AudioBackend, BackendFault, BackendStream, FaultHandler, InputBlock, InputHandler,
    OutputHandler, StreamRequest,
};
use crate::device::{DefaultDevicePolicy, DeviceDescriptor, DeviceIndex, Direction};
use crate::error::{AudioError, Result};

/// Host audio through CPAL.
#[derive(Clone, Debug)]
pub struct CpalBackend {
    host_id: cpal::HostId,
    policy: DefaultDevicePolicy,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    /// The platform's default host.
    pub fn new() -> Self {
        Self::with_host(cpal::default_host().id())
    }

    pub fn with_host(host_id: cpal::HostId) -> Self {
        Self {
            host_id,
            policy: DefaultDevicePolicy::default(),
        }
    }

    /// Choose how `DeviceIndex::Default` resolves.
    pub fn with_default_policy(mut self, policy: DefaultDevicePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn host(&self) -> Result<cpal::Host> {
        open_host(self.host_id)
    }

    fn spawn_stream<F>(&self, request: StreamRequest, build: F) -> Result<Box<dyn BackendStream>>
    where
        F: FnOnce(&cpal::Device, &cpal::StreamConfig, cpal::SampleFormat) -> Result<cpal::Stream>
            + Send
            + 'static,
    {
        let host_id = self.host_id;
        let policy = self.policy;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<String>>(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let join = thread::Builder::new()
            .name(format!("audio-io-{}", request.direction))
            .spawn(move || match open_on_thread(host_id, policy, &request, build) {
                Ok((stream, name)) => {
                    if ready_tx.send(Ok(name)).is_err() {
                        return;
                    }
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        match ready_rx.recv() {
            Ok(Ok(device_name)) => Ok(Box::new(CpalStream {
                device_name,
                stop_tx: Some(stop_tx),
                join: Some(join),
            })),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(AudioError::DeviceOpen("audio thread exited during open".into()))
            }
        }
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn devices(&self, direction: Direction) -> Result<Vec<DeviceDescriptor>> {
        let host = self.host()?;
        Ok(enumerate(&host, direction)?
            .iter()
            .enumerate()
            .map(|(index, d)| DeviceDescriptor {
                index,
                name: device_label(d),
                direction,
            })
            .collect())
    }

    fn open_input(
        &self,
        request: &StreamRequest,
        on_data: InputHandler,
        on_fault: FaultHandler,
    ) -> Result<Box<dyn BackendStream>> {
        self.spawn_stream(*request, move |device, config, format| {
            build_input_stream(device, config, format, on_data, on_fault)
        })
    }

    fn open_output(
        &self,
        request: &StreamRequest,
        on_fill: OutputHandler,
        on_fault: FaultHandler,
    ) -> Result<Box<dyn BackendStream>> {
        self.spawn_stream(*request, move |device, config, format| {
            build_output_stream(device, config, format, on_fill, on_fault)
        })
    }
}

/// Handle to the thread that owns a CPAL stream.
struct CpalStream {
    device_name: String,
    stop_tx: Option<Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl BackendStream for CpalStream {
    fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(join) = self.join.take() {
            // Dropped from inside its own callback: the thread exits once it returns.
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

fn open_host(host_id: cpal::HostId) -> Result<cpal::Host> {
    cpal::host_from_id(host_id).map_err(|e| AudioError::BackendUnavailable(e.to_string()))
}

fn open_on_thread<F>(
    host_id: cpal::HostId,
    policy: DefaultDevicePolicy,
    request: &StreamRequest,
    build: F,
) -> Result<(cpal::Stream, String)>
where
    F: FnOnce(&cpal::Device, &cpal::StreamConfig, cpal::SampleFormat) -> Result<cpal::Stream>,
{
    let host = open_host(host_id)?;
    let device = resolve_device(&host, request.direction, request.device, policy)?;
    let name = device_label(&device);
    let supported = pick_stream_config(&device, request, &name)?;
    let mut config = supported.config();
    config.buffer_size = pick_buffer_size(&supported, request.frames_per_buffer);

    let stream = build(&device, &config, supported.sample_format())?;
    stream
        .play()
        .map_err(|e| AudioError::DeviceOpen(format!("{name}: {e}")))?;
    tracing::info!(
        device = %name,
        direction = %request.direction,
        sample_rate = config.sample_rate,
        channels = config.channels,
        sample_format = ?supported.sample_format(),
        buffer = ?config.buffer_size,
        "cpal stream playing"
    );
    Ok((stream, name))
}

fn enumerate(host: &cpal::Host, direction: Direction) -> Result<Vec<cpal::Device>> {
    let devices = match direction {
        Direction::Input => host
            .input_devices()
            .map_err(|e| AudioError::BackendUnavailable(e.to_string()))?
            .collect(),
        Direction::Output => host
            .output_devices()
            .map_err(|e| AudioError::BackendUnavailable(e.to_string()))?
            .collect(),
    };
    Ok(devices)
}

fn device_label(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "<unnamed device>".to_string())
}

fn resolve_device(
    host: &cpal::Host,
    direction: Direction,
    device: DeviceIndex,
    policy: DefaultDevicePolicy,
) -> Result<cpal::Device> {
    match device {
        DeviceIndex::Index(i) => enumerate(host, direction)?
            .into_iter()
            .nth(i)
            .ok_or_else(|| AudioError::DeviceOpen(format!("no {direction} device at index {i}"))),
        DeviceIndex::Default => {
            let host_default = match (policy, direction) {
                (DefaultDevicePolicy::FirstListed, _) => None,
                (DefaultDevicePolicy::HostDefault, Direction::Input) => host.default_input_device(),
                (DefaultDevicePolicy::HostDefault, Direction::Output) => {
                    host.default_output_device()
                }
            };
            match host_default {
                Some(d) => Ok(d),
                None => enumerate(host, direction)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| AudioError::DeviceOpen(format!("no {direction} devices"))),
            }
        }
    }
}

/// Find a config that runs the requested rate and channel count natively.
///
/// The engine does no resampling or channel mapping, so both must match exactly.
/// Among matching ranges the sample format closest to PCM16 wins.
fn pick_stream_config(
    device: &cpal::Device,
    request: &StreamRequest,
    name: &str,
) -> Result<cpal::SupportedStreamConfig> {
    let ranges: Vec<cpal::SupportedStreamConfigRange> = match request.direction {
        Direction::Input => device
            .supported_input_configs()
            .map_err(|e| AudioError::DeviceOpen(format!("{name}: {e}")))?
            .collect(),
        Direction::Output => device
            .supported_output_configs()
            .map_err(|e| AudioError::DeviceOpen(format!("{name}: {e}")))?
            .collect(),
    };

    let mut best: Option<(u8, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        if range.channels() != request.channels {
            continue;
        }
        let (min, max) = (range.min_sample_rate(), range.max_sample_rate());
        if request.sample_rate < min || request.sample_rate > max {
            continue;
        }
        let rank = sample_format_rank(range.sample_format());
        let replace = best.as_ref().map(|(r, _)| rank < *r).unwrap_or(true);
        if replace {
            best = Some((rank, range.with_sample_rate(request.sample_rate)));
        }
    }

    best.map(|(_, cfg)| cfg).ok_or_else(|| {
        AudioError::DeviceOpen(format!(
            "{name} cannot run {} Hz x {} ch",
            request.sample_rate, request.channels
        ))
    })
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::I16 => 0,
        cpal::SampleFormat::F32 => 1,
        cpal::SampleFormat::I32 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Request `frames` per callback when the device reports a range; otherwise let CPAL pick.
fn pick_buffer_size(config: &cpal::SupportedStreamConfig, frames: u32) -> cpal::BufferSize {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => {
            cpal::BufferSize::Fixed(clamp_buffer_frames(frames, *min, *max))
        }
        cpal::SupportedBufferSize::Unknown => cpal::BufferSize::Default,
    }
}

fn clamp_buffer_frames(frames: u32, min: u32, max: u32) -> u32 {
    if min > max {
        return frames.max(min);
    }
    frames.clamp(min, max)
}

fn report_stream_error(on_fault: &FaultHandler, err: cpal::StreamError) {
    match err {
        cpal::StreamError::DeviceNotAvailable => {
            on_fault(BackendFault::Disconnected("device no longer available".into()))
        }
        other => on_fault(BackendFault::Transient(other.to_string())),
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> AudioError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            AudioError::DeviceOpen("device not available".into())
        }
        other => AudioError::DeviceOpen(other.to_string()),
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    on_data: InputHandler,
    on_fault: FaultHandler,
) -> Result<cpal::Stream> {
    match format {
        cpal::SampleFormat::I16 => build_input::<i16>(device, config, on_data, on_fault),
        cpal::SampleFormat::F32 => build_input::<f32>(device, config, on_data, on_fault),
        cpal::SampleFormat::I32 => build_input::<i32>(device, config, on_data, on_fault),
        cpal::SampleFormat::U16 => build_input::<u16>(device, config, on_data, on_fault),
        other => Err(AudioError::DeviceOpen(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

/// Capture callback: convert to PCM16 and flag gaps between hardware timestamps.
fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut on_data: InputHandler,
    on_fault: FaultHandler,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
    i16: cpal::FromSample<T>,
{
    let rate = config.sample_rate;
    let channels = config.channels.max(1) as usize;
    let mut scratch: Vec<i16> = Vec::new();
    let mut clock = CaptureClock::default();

    device
        .build_input_stream(
            config,
            move |data: &[T], info: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(
                    data.iter()
                        .map(|s| <i16 as cpal::Sample>::from_sample::<T>(*s)),
                );
                let overrun = clock.observe(info.timestamp().capture, data.len() / channels, rate);
                on_data(InputBlock {
                    samples: &scratch,
                    overrun,
                });
            },
            move |err| report_stream_error(&on_fault, err),
            None,
        )
        .map_err(map_build_error)
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    format: cpal::SampleFormat,
    on_fill: OutputHandler,
    on_fault: FaultHandler,
) -> Result<cpal::Stream> {
    match format {
        cpal::SampleFormat::I16 => build_output::<i16>(device, config, on_fill, on_fault),
        cpal::SampleFormat::F32 => build_output::<f32>(device, config, on_fill, on_fault),
        cpal::SampleFormat::I32 => build_output::<i32>(device, config, on_fill, on_fault),
        cpal::SampleFormat::U16 => build_output::<u16>(device, config, on_fill, on_fault),
        other => Err(AudioError::DeviceOpen(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

/// Playback callback: the engine fills PCM16, converted here to the device format.
fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut on_fill: OutputHandler,
    on_fault: FaultHandler,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<i16>,
{
    let mut scratch: Vec<i16> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0);
                on_fill(&mut scratch);
                for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = <T as cpal::Sample>::from_sample::<i16>(*src);
                }
            },
            move |err| report_stream_error(&on_fault, err),
            None,
        )
        .map_err(map_build_error)
}

/// Tracks hardware capture timestamps to spot dropped input.
#[derive(Default)]
struct CaptureClock {
    last: Option<(cpal::StreamInstant, Duration)>,
}

impl CaptureClock {
    fn observe(&mut self, at: cpal::StreamInstant, frames: usize, rate: u32) -> bool {
        let span = frames_to_duration(frames, rate);
        let overrun = match self.last {
            Some((prev, prev_span)) => at
                .duration_since(&prev)
                .map(|gap| is_capture_gap(gap, prev_span))
                .unwrap_or(false),
            None => false,
        };
        self.last = Some((at, span));
        overrun
    }
}

fn frames_to_duration(frames: usize, rate: u32) -> Duration {
    if rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / rate as f64)
}

/// A block started later than the previous block's length plus one more block of slack.
fn is_capture_gap(gap: Duration, expected: Duration) -> bool {
    let slack = expected.max(Duration::from_millis(5));
    gap > expected + slack
}
