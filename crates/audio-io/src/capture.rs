//! Capture engine: device blocks in, fixed-size PCM16 chunks out.
//!
//! The backend thread hands over whatever block size the hardware produced. The engine
//! appends it to a byte buffer and calls the registered sink once per complete
//! `chunk_size` slice, synchronously, on that same thread. A sink that takes longer than
//! one chunk's worth of audio will make the backend overrun.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam_channel::Receiver;

use crate::backend::{AudioBackend, BackendStream, CpalBackend, InputBlock, InputHandler, StreamRequest};
use crate::config::{ConfigStore, EngineTuning, StreamConfig, SAMPLE_WIDTH_BYTES};
use crate::device::{DeviceDescriptor, DeviceIndex, Direction};
use crate::error::{AudioError, Result};
use crate::lifecycle::{
    fault_handler, inside_callback, next_engine_id, ActiveStream, CallbackScope, DeliveryGate,
    FaultSlot, Lifecycle, ManagedStream, StreamGuard, StreamState,
};
use crate::status::{CaptureCounters, CaptureStats, EventBus, StreamEvent};

/// One captured chunk, valid for the duration of the sink call.
#[derive(Clone, Copy)]
pub struct AudioBuffer<'a> {
    bytes: &'a [u8],
    sample_rate: u32,
    channels: u16,
}

impl<'a> AudioBuffer<'a> {
    /// Wrap interleaved little-endian PCM16 bytes.
    pub fn new(bytes: &'a [u8], sample_rate: u32, channels: u16) -> Self {
        Self {
            bytes,
            sample_rate,
            channels,
        }
    }

    /// Interleaved little-endian PCM16.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.bytes.len() / (self.channels.max(1) as usize * SAMPLE_WIDTH_BYTES)
    }

    pub fn samples(self) -> impl Iterator<Item = i16> + 'a {
        self.bytes
            .chunks_exact(SAMPLE_WIDTH_BYTES)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    /// Copy the chunk out, for sinks that hand data to another thread.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl Deref for AudioBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl fmt::Debug for AudioBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("len", &self.bytes.len())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish()
    }
}

/// Receives captured chunks on the backend thread.
pub type CaptureSink = Arc<dyn Fn(AudioBuffer<'_>) + Send + Sync + 'static>;

/// State shared between the engine handle and the backend callback.
struct CaptureShared {
    id: u64,
    sink: Mutex<Option<CaptureSink>>,
    /// Config of the session feeding the sink, readable without the lifecycle lock.
    streaming: Mutex<Option<StreamConfig>>,
    counters: CaptureCounters,
    events: EventBus,
}

impl CaptureShared {
    fn new(id: u64, event_capacity: usize, sink: Option<CaptureSink>) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            streaming: Mutex::new(None),
            counters: CaptureCounters::default(),
            events: EventBus::new(event_capacity),
        }
    }

    fn current_sink(&self) -> Option<CaptureSink> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn streaming_config(&self) -> Option<StreamConfig> {
        *self.streaming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_streaming_config(&self, config: StreamConfig) {
        *self.streaming.lock().unwrap_or_else(PoisonError::into_inner) = Some(config);
    }

    fn replace_sink(&self, sink: Option<CaptureSink>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    fn deliver(&self, chunk: &[u8], config: &StreamConfig) {
        // Cloned out so the sink can swap itself without deadlocking.
        match self.current_sink() {
            Some(sink) => {
                let _scope = CallbackScope::enter(self.id);
                sink(AudioBuffer::new(chunk, config.sample_rate, config.channels));
                self.counters.delivered(chunk.len());
            }
            None => {
                self.counters.dropped(chunk.len());
                tracing::trace!(bytes = chunk.len(), "no capture sink, chunk dropped");
            }
        }
    }

    fn overrun(&self) {
        let total = self.counters.overrun();
        tracing::warn!(total, "capture overrun");
        self.events.emit(StreamEvent::OverrunDetected { total });
    }
}

/// Backend resources of a running capture session.
pub(crate) struct CaptureStream {
    gate: Arc<DeliveryGate>,
    stream: Option<Box<dyn BackendStream>>,
}

impl ActiveStream for CaptureStream {
    fn halt(&mut self) {
        self.gate.shut();
        drop(self.stream.take());
    }
}

fn input_handler(
    shared: Arc<CaptureShared>,
    gate: Arc<DeliveryGate>,
    config: StreamConfig,
) -> InputHandler {
    let chunk_size = config.chunk_size;
    let mut pending: Vec<u8> = Vec::with_capacity(chunk_size * 2);

    Box::new(move |block: InputBlock<'_>| {
        let Some(_in_flight) = gate.enter() else {
            return;
        };
        if block.overrun {
            shared.overrun();
        }

        pending.reserve(block.samples.len() * SAMPLE_WIDTH_BYTES);
        for s in block.samples {
            pending.extend_from_slice(&s.to_le_bytes());
        }

        let mut consumed = 0;
        while pending.len() - consumed >= chunk_size {
            shared.deliver(&pending[consumed..consumed + chunk_size], &config);
            consumed += chunk_size;
        }
        pending.drain(..consumed);
    })
}

/// Live capture from one input device.
///
/// ```no_run
/// use audio_io::{AudioCapture, DeviceIndex};
///
/// let capture = AudioCapture::new(DeviceIndex::Default);
/// capture.set_callback(|chunk| println!("{} bytes", chunk.len()));
/// let _session = capture.session()?;
/// std::thread::sleep(std::time::Duration::from_secs(1));
/// # Ok::<(), audio_io::AudioError>(())
/// ```
pub struct AudioCapture {
    backend: Arc<dyn AudioBackend>,
    store: Arc<ConfigStore>,
    device: DeviceIndex,
    tuning: EngineTuning,
    shared: Arc<CaptureShared>,
    lifecycle: Lifecycle<CaptureStream>,
}

impl AudioCapture {
    /// Capture from `device` on the default host, seeded by the global config.
    pub fn new(device: DeviceIndex) -> Self {
        Self::with_backend(Arc::new(CpalBackend::new()), device)
    }

    pub fn with_backend(backend: Arc<dyn AudioBackend>, device: DeviceIndex) -> Self {
        let tuning = EngineTuning::default();
        Self {
            backend,
            store: ConfigStore::global(),
            device,
            shared: Arc::new(CaptureShared::new(
                next_engine_id(),
                tuning.event_capacity,
                None,
            )),
            tuning,
            lifecycle: Lifecycle::new("capture"),
        }
    }

    /// Read defaults from `store` instead of the process-wide one.
    pub fn with_config_store(mut self, store: Arc<ConfigStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_tuning(mut self, tuning: EngineTuning) -> Self {
        let sink = self.shared.current_sink();
        self.shared = Arc::new(CaptureShared::new(
            self.shared.id,
            tuning.event_capacity,
            sink,
        ));
        self.tuning = tuning;
        self
    }

    /// Register the chunk sink. Replaces any previous one, also while running.
    ///
    /// The sink runs on the backend thread. From inside it, `stop` and `close` fail with
    /// [`AudioError::CalledFromCallback`]; call them from another thread instead.
    pub fn set_callback<F>(&self, sink: F)
    where
        F: Fn(AudioBuffer<'_>) + Send + Sync + 'static,
    {
        let sink: CaptureSink = Arc::new(sink);
        self.shared.replace_sink(Some(sink));
    }

    /// Unregister the sink. Later chunks are dropped and counted.
    pub fn clear_callback(&self) {
        self.shared.replace_sink(None);
    }

    /// Start with a snapshot of the config store.
    pub fn start(&self) -> Result<()> {
        self.start_with(self.store.get().capture_stream())
    }

    pub fn start_with(&self, config: StreamConfig) -> Result<()> {
        if inside_callback(self.shared.id) {
            return Err(AudioError::AlreadyRunning);
        }
        let config = StreamConfig {
            device: config.device.or(self.device),
            ..config
        };
        self.lifecycle
            .start(config, |config, fault| self.open(config, fault))
    }

    fn open(&self, config: &StreamConfig, fault: Arc<FaultSlot>) -> Result<CaptureStream> {
        let gate = Arc::new(DeliveryGate::new());
        let chunk_frames = u32::try_from(config.chunk_frames()).unwrap_or(u32::MAX);
        let request = StreamRequest {
            direction: Direction::Input,
            device: config.device,
            sample_rate: config.sample_rate,
            channels: config.channels,
            frames_per_buffer: chunk_frames.max(self.tuning.min_capture_frames),
        };

        let fatal_gate = gate.clone();
        let on_fault = fault_handler("capture", fault, self.shared.events.clone(), move || {
            fatal_gate.close()
        });
        self.shared.set_streaming_config(*config);
        let on_data = input_handler(self.shared.clone(), gate.clone(), *config);
        let stream = self.backend.open_input(&request, on_data, on_fault)?;
        tracing::debug!(
            backend = self.backend.name(),
            device = stream.device_name(),
            frames_per_buffer = request.frames_per_buffer,
            "capture device opened"
        );

        Ok(CaptureStream {
            gate,
            stream: Some(stream),
        })
    }

    /// Stop delivery and release the device. No sink call happens after this returns.
    pub fn stop(&self) -> Result<()> {
        if inside_callback(self.shared.id) {
            return Err(AudioError::CalledFromCallback);
        }
        self.lifecycle.stop()
    }

    pub fn close(&self) -> Result<()> {
        if inside_callback(self.shared.id) {
            return Err(AudioError::CalledFromCallback);
        }
        self.lifecycle.close();
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        if inside_callback(self.shared.id) {
            return StreamState::Running;
        }
        self.lifecycle.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// Config of the running session, device included.
    pub fn active_config(&self) -> Option<StreamConfig> {
        // The lifecycle lock may be held by a `stop` waiting for this very delivery.
        if inside_callback(self.shared.id) {
            return self.shared.streaming_config();
        }
        self.lifecycle.active_config()
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.counters.snapshot()
    }

    /// Overrun and fault notifications.
    pub fn events(&self) -> Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Input devices of this engine's backend.
    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.backend.devices(Direction::Input)
    }

    /// Start with the store defaults; the guard closes the engine when dropped.
    pub fn session(&self) -> Result<StreamGuard<'_, Self>> {
        self.start()?;
        Ok(StreamGuard::new(self))
    }

    pub fn session_with(&self, config: StreamConfig) -> Result<StreamGuard<'_, Self>> {
        self.start_with(config)?;
        Ok(StreamGuard::new(self))
    }

    /// Guard without starting.
    pub fn guard(&self) -> StreamGuard<'_, Self> {
        StreamGuard::new(self)
    }
}

impl ManagedStream for AudioCapture {
    fn release(&self) {
        if !inside_callback(self.shared.id) {
            self.lifecycle.close();
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if !inside_callback(self.shared.id) {
            self.lifecycle.close();
            return;
        }
        // The sink dropped the last handle. Halting here would wait on the delivery this
        // thread is running, so the stream is released from a helper thread instead.
        let Some(mut stream) = self.lifecycle.detach() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("audio-io-release".into())
            .spawn(move || stream.halt());
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn capture release thread");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FakeBackend, FakeInputScript};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn engine(fake: &FakeBackend) -> AudioCapture {
        AudioCapture::with_backend(Arc::new(fake.clone()), DeviceIndex::Default)
            .with_config_store(Arc::new(ConfigStore::new()))
    }

    fn scripted(block_frames: usize, total_frames: u64) -> FakeBackend {
        let fake = FakeBackend::new();
        fake.set_input_script(FakeInputScript {
            block_frames,
            total_frames: Some(total_frames),
            ..FakeInputScript::default()
        });
        fake
    }

    #[test]
    fn audio_buffer_views() {
        let bytes = [1u8, 0, 2, 0, 0xff, 0xff, 4, 0];
        let buf = AudioBuffer::new(&bytes, 16_000, 2);
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.frames(), 2);
        assert_eq!(buf.samples().collect::<Vec<_>>(), vec![1, 2, -1, 4]);
        assert_eq!(buf.to_vec(), bytes.to_vec());
    }

    #[test]
    fn rechunks_odd_blocks_into_exact_chunks() {
        let fake = scripted(100, 16_000);
        let capture = engine(&fake);
        let collected = Arc::new(Mutex::new(Vec::<u8>::new()));
        let sizes = Arc::new(Mutex::new(Vec::<usize>::new()));
        {
            let collected = collected.clone();
            let sizes = sizes.clone();
            capture.set_callback(move |chunk| {
                sizes.lock().unwrap().push(chunk.len());
                collected.lock().unwrap().extend_from_slice(&chunk);
            });
        }

        capture.start().unwrap();
        assert!(fake.wait_for_input_frames(16_000, WAIT));
        capture.stop().unwrap();

        let sizes = sizes.lock().unwrap();
        assert_eq!(sizes.len(), 10);
        assert!(sizes.iter().all(|&n| n == 3_200));

        let expected: Vec<u8> = fake
            .input_samples()
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(*collected.lock().unwrap(), expected);
        assert_eq!(capture.stats().delivered_bytes, 32_000);
    }

    #[test]
    fn requests_at_least_min_capture_frames() {
        let fake = scripted(0, 0);
        let capture = engine(&fake);
        capture
            .start_with(StreamConfig::new(16_000, 1, 32))
            .unwrap();
        capture.close().unwrap();

        let requests = fake.requests();
        assert_eq!(requests[0].frames_per_buffer, 64);
        assert_eq!(requests[0].direction, Direction::Input);
    }

    #[test]
    fn chunks_without_sink_are_counted_as_dropped() {
        let fake = scripted(1_600, 8_000);
        let capture = engine(&fake);
        capture.start().unwrap();
        assert!(fake.wait_for_input_frames(8_000, WAIT));
        capture.stop().unwrap();

        let stats = capture.stats();
        assert_eq!(stats.delivered_chunks, 0);
        assert_eq!(stats.dropped_chunks, 5);
        assert_eq!(stats.dropped_bytes, 16_000);
    }

    #[test]
    fn last_registered_sink_wins() {
        let fake = scripted(1_600, 4_800);
        let capture = engine(&fake);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let first = first.clone();
            capture.set_callback(move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let second = second.clone();
            capture.set_callback(move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            });
        }

        capture.start().unwrap();
        assert!(fake.wait_for_input_frames(4_800, WAIT));
        capture.stop().unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stop_from_inside_sink_is_rejected() {
        let fake = scripted(1_600, 1_600);
        let capture = Arc::new(engine(&fake));
        let seen = Arc::new(Mutex::new(None));
        {
            let weak = Arc::downgrade(&capture);
            let seen = seen.clone();
            capture.set_callback(move |_| {
                if let Some(capture) = weak.upgrade() {
                    let stop = capture.stop();
                    let close = capture.close();
                    *seen.lock().unwrap() = Some((stop, close, capture.state()));
                }
            });
        }

        capture.start().unwrap();
        assert!(fake.wait_for_input_frames(1_600, WAIT));
        let (stop, close, state) = seen.lock().unwrap().take().unwrap();
        assert!(matches!(stop, Err(AudioError::CalledFromCallback)));
        assert!(matches!(close, Err(AudioError::CalledFromCallback)));
        assert_eq!(state, StreamState::Running);

        capture.stop().unwrap();
        assert_eq!(capture.state(), StreamState::Stopped);
    }

    #[test]
    fn overrun_is_counted_and_reported() {
        let fake = FakeBackend::new();
        fake.set_input_script(FakeInputScript {
            block_frames: 1_600,
            total_frames: Some(6_400),
            overrun_blocks: vec![1, 3],
            ..FakeInputScript::default()
        });
        let capture = engine(&fake);
        let events = capture.events();
        capture.start().unwrap();
        assert!(fake.wait_for_input_frames(6_400, WAIT));

        assert_eq!(capture.state(), StreamState::Running);
        capture.stop().unwrap();
        assert_eq!(capture.stats().overruns, 2);
        assert_eq!(
            events.try_recv().unwrap(),
            StreamEvent::OverrunDetected { total: 1 }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            StreamEvent::OverrunDetected { total: 2 }
        );
    }

    #[test]
    fn constructor_device_fills_in_default() {
        let fake = FakeBackend::with_devices(&["mic a", "mic b"], &["speaker"]);
        fake.set_input_script(FakeInputScript {
            total_frames: Some(0),
            ..FakeInputScript::default()
        });
        let capture = AudioCapture::with_backend(Arc::new(fake.clone()), DeviceIndex::Index(1))
            .with_config_store(Arc::new(ConfigStore::new()));
        capture.start().unwrap();
        assert!(fake.is_held(Direction::Input, 1));
        assert_eq!(
            capture.active_config().map(|c| c.device),
            Some(DeviceIndex::Index(1))
        );
        capture.close().unwrap();
        assert!(!fake.is_held(Direction::Input, 1));
    }
}
