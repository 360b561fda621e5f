//! Playback engine: blocking PCM16 writes with backpressure.
//!
//! `write` converts little-endian bytes to samples and pushes them into a bounded
//! [`PcmQueue`]; the backend's fill callback pops without blocking and pads with silence.
//! The queue holds `playback_buffer_seconds` of audio, so a writer running ahead of the
//! device blocks instead of growing memory or dropping data.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::backend::{AudioBackend, BackendStream, CpalBackend, OutputHandler, StreamRequest};
use crate::config::{align_chunk_size, ConfigStore, EngineTuning, StreamConfig, SAMPLE_WIDTH_BYTES};
use crate::decode::Pcm16File;
use crate::device::{DeviceDescriptor, DeviceIndex, Direction};
use crate::error::{AudioError, Result};
use crate::lifecycle::{
    fault_handler, ActiveStream, DeliveryGate, FaultSlot, Lifecycle, ManagedStream, StreamGuard,
    StreamState,
};
use crate::queue::{calc_max_buffered_samples, PcmQueue};
use crate::status::{EventBus, PlaybackCounters, PlaybackStats, StreamEvent};

struct PlayerShared {
    counters: PlaybackCounters,
    events: EventBus,
    /// Number of callers inside `drain`; running dry is expected while non-zero.
    draining: AtomicUsize,
}

impl PlayerShared {
    fn new(event_capacity: usize) -> Self {
        Self {
            counters: PlaybackCounters::default(),
            events: EventBus::new(event_capacity),
            draining: AtomicUsize::new(0),
        }
    }

    fn underrun(&self) {
        let total = self.counters.underrun();
        tracing::warn!(total, "playback underrun");
        self.events.emit(StreamEvent::UnderrunDetected { total });
    }
}

struct DrainMark<'a>(&'a AtomicUsize);

impl<'a> DrainMark<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for DrainMark<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Converts byte writes to samples, carrying an odd trailing byte into the next write.
#[derive(Debug, Default)]
struct WriteCarry(Option<u8>);

impl WriteCarry {
    fn samples(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut out = Vec::with_capacity(bytes.len() / SAMPLE_WIDTH_BYTES + 1);
        let mut rest = bytes;
        if let Some(lo) = self.0.take() {
            match rest.split_first() {
                Some((&hi, tail)) => {
                    out.push(i16::from_le_bytes([lo, hi]));
                    rest = tail;
                }
                None => self.0 = Some(lo),
            }
        }

        let mut pairs = rest.chunks_exact(SAMPLE_WIDTH_BYTES);
        out.extend(pairs.by_ref().map(|b| i16::from_le_bytes([b[0], b[1]])));
        if let [last] = pairs.remainder() {
            self.0 = Some(*last);
        }
        out
    }
}

/// Backend resources of a running playback session.
pub(crate) struct PlaybackStream {
    gate: Arc<DeliveryGate>,
    queue: Arc<PcmQueue>,
    /// Serializes writers so each `write` lands contiguously.
    writer: Arc<Mutex<WriteCarry>>,
    /// Audio still in the device after the queue empties.
    tail: Duration,
    stream: Option<Box<dyn BackendStream>>,
}

impl ActiveStream for PlaybackStream {
    fn halt(&mut self) {
        self.gate.close();
        self.queue.close();
        self.gate.drain();
        drop(self.stream.take());
    }
}

fn output_handler(
    shared: Arc<PlayerShared>,
    gate: Arc<DeliveryGate>,
    queue: Arc<PcmQueue>,
) -> OutputHandler {
    let mut playing = false;

    Box::new(move |out: &mut [i16]| {
        let filled = match gate.enter() {
            Some(_in_flight) => queue.pop_into(out),
            None => 0,
        };
        out[filled..].fill(0);

        if filled > 0 {
            shared.counters.played(filled * SAMPLE_WIDTH_BYTES);
        }
        // Real audio ran out inside this block. Silence after silence is not a new underrun.
        let ran_dry = filled < out.len() && (playing || filled > 0);
        if ran_dry && shared.draining.load(Ordering::Acquire) == 0 && !queue.is_closed() {
            shared.underrun();
        }
        playing = filled == out.len();
        filled
    })
}

/// Live playback to one output device.
pub struct AudioPlayer {
    backend: Arc<dyn AudioBackend>,
    store: Arc<ConfigStore>,
    device: DeviceIndex,
    tuning: EngineTuning,
    shared: Arc<PlayerShared>,
    lifecycle: Lifecycle<PlaybackStream>,
}

impl AudioPlayer {
    /// Play to `device` on the default host, seeded by the global config.
    pub fn new(device: DeviceIndex) -> Self {
        Self::with_backend(Arc::new(CpalBackend::new()), device)
    }

    pub fn with_backend(backend: Arc<dyn AudioBackend>, device: DeviceIndex) -> Self {
        let tuning = EngineTuning::default();
        Self {
            backend,
            store: ConfigStore::global(),
            device,
            shared: Arc::new(PlayerShared::new(tuning.event_capacity)),
            tuning,
            lifecycle: Lifecycle::new("playback"),
        }
    }

    pub fn with_config_store(mut self, store: Arc<ConfigStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_tuning(mut self, tuning: EngineTuning) -> Self {
        self.shared = Arc::new(PlayerShared::new(tuning.event_capacity));
        self.tuning = tuning;
        self
    }

    /// Start with a snapshot of the config store.
    pub fn start(&self) -> Result<()> {
        self.start_with(self.store.get().player_stream())
    }

    pub fn start_with(&self, config: StreamConfig) -> Result<()> {
        let config = StreamConfig {
            device: config.device.or(self.device),
            ..config
        };
        self.lifecycle
            .start(config, |config, fault| self.open(config, fault))
    }

    fn open(&self, config: &StreamConfig, fault: Arc<FaultSlot>) -> Result<PlaybackStream> {
        let gate = Arc::new(DeliveryGate::new());
        let channels = config.channels as usize;
        let capacity = calc_max_buffered_samples(
            config.sample_rate,
            channels,
            self.tuning.playback_buffer_seconds,
        );
        let queue = Arc::new(PcmQueue::new(capacity));
        let frames_per_buffer = self.tuning.output_frames_per_buffer.max(1);
        let request = StreamRequest {
            direction: Direction::Output,
            device: config.device,
            sample_rate: config.sample_rate,
            channels: config.channels,
            frames_per_buffer,
        };

        let fatal_queue = queue.clone();
        let on_fault = fault_handler("playback", fault, self.shared.events.clone(), move || {
            fatal_queue.close()
        });
        let on_fill = output_handler(self.shared.clone(), gate.clone(), queue.clone());
        let stream = self.backend.open_output(&request, on_fill, on_fault)?;
        tracing::debug!(
            backend = self.backend.name(),
            device = stream.device_name(),
            queue_samples = queue.capacity_samples(),
            "playback device opened"
        );

        Ok(PlaybackStream {
            gate,
            queue,
            writer: Arc::new(Mutex::new(WriteCarry::default())),
            tail: Duration::from_secs_f64(frames_per_buffer as f64 / config.sample_rate as f64),
            stream: Some(stream),
        })
    }

    /// Queue `bytes` of interleaved little-endian PCM16, blocking while the buffer is full.
    ///
    /// Returns once every byte is accepted. Buffers need not be frame aligned. Fails with
    /// [`AudioError::StreamClosed`] if the stream is not running or is stopped while the
    /// call is blocked.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let (gate, queue, writer, fault) = self.lifecycle.with_running(|s| {
            (
                s.stream.gate.clone(),
                s.stream.queue.clone(),
                s.stream.writer.clone(),
                s.fault.clone(),
            )
        })?;
        if bytes.is_empty() {
            return Ok(());
        }

        let Some(_in_flight) = gate.enter() else {
            return Err(AudioError::StreamClosed);
        };
        let mut carry = writer.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = carry.samples(bytes);
        if !queue.push_blocking(&samples) {
            return Err(interrupted(&fault));
        }
        self.shared.counters.accepted(bytes.len());
        Ok(())
    }

    /// Block until everything written so far has been played.
    pub fn drain(&self) -> Result<()> {
        let (gate, queue, tail, fault) = self.lifecycle.with_running(|s| {
            (
                s.stream.gate.clone(),
                s.stream.queue.clone(),
                s.stream.tail,
                s.fault.clone(),
            )
        })?;
        let _draining = DrainMark::enter(&self.shared.draining);

        let emptied = {
            let Some(_in_flight) = gate.enter() else {
                return Err(AudioError::StreamClosed);
            };
            queue.wait_until_empty()
        };
        if !emptied {
            return Err(interrupted(&fault));
        }
        thread::sleep(tail);
        Ok(())
    }

    /// Play a 16-bit PCM WAV or AIFF file to the end, then stop.
    ///
    /// Starts the stream with the file's rate and channel count unless it is already
    /// running, in which case both must match. Returns the payload bytes written.
    pub fn play_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let mut file = Pcm16File::open(path)?;

        match self.lifecycle.active_config() {
            Some(active)
                if active.sample_rate != file.sample_rate()
                    || active.channels != file.channels() =>
            {
                return Err(AudioError::Config(format!(
                    "{} is {} Hz x {} ch but the stream runs {} Hz x {} ch",
                    path.display(),
                    file.sample_rate(),
                    file.channels(),
                    active.sample_rate,
                    active.channels
                )));
            }
            Some(_) => {}
            None => {
                let defaults = self.store.get().player_stream();
                self.start_with(StreamConfig {
                    sample_rate: file.sample_rate(),
                    channels: file.channels(),
                    chunk_size: align_chunk_size(defaults.chunk_size, file.channels()),
                    device: defaults.device,
                })?;
            }
        }
        tracing::info!(
            path = %path.display(),
            sample_rate = file.sample_rate(),
            channels = file.channels(),
            duration_ms = ?file.duration_ms(),
            "playing file"
        );

        let written = match self.write_file(&mut file) {
            Ok(written) => written,
            Err(e) => {
                let _ = self.stop();
                return Err(e);
            }
        };
        self.drain()?;
        self.stop()?;
        Ok(written)
    }

    fn write_file(&self, file: &mut Pcm16File) -> Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = file.next_chunk()? {
            self.write(&chunk)?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }

    /// Stop playback and release the device. Queued audio is discarded.
    pub fn stop(&self) -> Result<()> {
        self.lifecycle.stop()
    }

    pub fn close(&self) {
        self.lifecycle.close();
    }

    pub fn state(&self) -> StreamState {
        self.lifecycle.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    pub fn active_config(&self) -> Option<StreamConfig> {
        self.lifecycle.active_config()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.shared.counters.snapshot()
    }

    /// Underrun and fault notifications.
    pub fn events(&self) -> Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.backend.devices(Direction::Output)
    }

    pub fn session(&self) -> Result<StreamGuard<'_, Self>> {
        self.start()?;
        Ok(StreamGuard::new(self))
    }

    pub fn session_with(&self, config: StreamConfig) -> Result<StreamGuard<'_, Self>> {
        self.start_with(config)?;
        Ok(StreamGuard::new(self))
    }

    pub fn guard(&self) -> StreamGuard<'_, Self> {
        StreamGuard::new(self)
    }
}

fn interrupted(fault: &FaultSlot) -> AudioError {
    match fault.reason() {
        Some(reason) => AudioError::Stream(reason),
        None => AudioError::StreamClosed,
    }
}

impl ManagedStream for AudioPlayer {
    fn release(&self) {
        self.lifecycle.close();
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        self.lifecycle.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FakeBackend, FakeOutputPace};
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn engine(fake: &FakeBackend) -> AudioPlayer {
        AudioPlayer::with_backend(Arc::new(fake.clone()), DeviceIndex::Default)
            .with_config_store(Arc::new(ConfigStore::new()))
    }

    fn le_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn write_carry_joins_split_samples() {
        let mut carry = WriteCarry::default();
        assert_eq!(carry.samples(&[0x01, 0x02, 0x03]), vec![0x0201]);
        assert_eq!(carry.samples(&[]), Vec::<i16>::new());
        assert_eq!(carry.samples(&[0x04]), vec![0x0403]);
        assert_eq!(carry.samples(&[0xff, 0xff]), vec![-1]);
        assert!(carry.0.is_none());
    }

    #[test]
    fn written_samples_reach_the_device_in_order() {
        let fake = FakeBackend::new();
        let player = engine(&fake);
        player.start().unwrap();

        let samples: Vec<i16> = (0..4_000).map(|n| n as i16 - 2_000).collect();
        let bytes = le_bytes(&samples);
        // Deliberately misaligned writes.
        for piece in bytes.chunks(333) {
            player.write(piece).unwrap();
        }
        player.drain().unwrap();
        player.stop().unwrap();

        assert_eq!(fake.played_samples(), samples);
        let stats = player.stats();
        assert_eq!(stats.accepted_bytes, bytes.len() as u64);
        assert_eq!(stats.played_bytes, bytes.len() as u64);
    }

    #[test]
    fn write_requires_running_stream() {
        let fake = FakeBackend::new();
        let player = engine(&fake);
        assert!(matches!(player.write(&[0, 0]), Err(AudioError::StreamClosed)));
        assert!(matches!(player.drain(), Err(AudioError::StreamClosed)));

        player.start().unwrap();
        player.write(&[]).unwrap();
        player.stop().unwrap();
        assert!(matches!(player.write(&[0, 0]), Err(AudioError::StreamClosed)));

        player.close();
        assert!(matches!(player.write(&[0, 0]), Err(AudioError::StreamClosed)));
    }

    #[test]
    fn stop_interrupts_blocked_writer() {
        let fake = FakeBackend::new();
        fake.set_output_pace(FakeOutputPace {
            block_frames: 16,
            period: Duration::from_secs(10),
        });
        let player = Arc::new(
            engine(&fake).with_tuning(EngineTuning {
                playback_buffer_seconds: 0.01,
                ..EngineTuning::default()
            }),
        );
        player.start().unwrap();

        let writer = {
            let player = player.clone();
            thread::spawn(move || player.write(&vec![0u8; 64_000]))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        let started = Instant::now();
        player.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            writer.join().unwrap(),
            Err(AudioError::StreamClosed)
        ));
        assert_eq!(player.state(), StreamState::Stopped);
        assert_eq!(player.stats().accepted_bytes, 0);
    }

    #[test]
    fn running_dry_counts_one_underrun() {
        let fake = FakeBackend::new();
        let player = engine(&fake);
        let events = player.events();
        player.start().unwrap();

        player.write(&le_bytes(&[7i16; 800])).unwrap();
        assert!(fake.wait_for_played_samples(800, WAIT));
        thread::sleep(Duration::from_millis(20));

        assert_eq!(player.stats().underruns, 1);
        assert_eq!(
            events.try_recv().unwrap(),
            StreamEvent::UnderrunDetected { total: 1 }
        );
        assert_eq!(player.state(), StreamState::Running);
        player.stop().unwrap();
    }

    #[test]
    fn every_starved_block_counts_as_underrun() {
        let shared = Arc::new(PlayerShared::new(16));
        let events = shared.events.subscribe();
        let queue = Arc::new(PcmQueue::new(1_024));
        let mut fill = output_handler(shared.clone(), Arc::new(DeliveryGate::new()), queue.clone());
        let mut out = [1i16; 256];

        // A writer that only ever keeps up with part of each block.
        for _ in 0..3 {
            assert!(queue.push_blocking(&[5i16; 200]));
            assert_eq!(fill(&mut out[..]), 200);
            assert!(out[200..].iter().all(|&s| s == 0));
        }
        assert_eq!(shared.counters.snapshot().underruns, 3);

        // Silence following silence is the same gap.
        assert_eq!(fill(&mut out[..]), 0);
        assert_eq!(shared.counters.snapshot().underruns, 3);

        assert!(queue.push_blocking(&[5i16; 256]));
        assert_eq!(fill(&mut out[..]), 256);
        assert_eq!(fill(&mut out[..]), 0);
        assert_eq!(shared.counters.snapshot().underruns, 4);

        // Running dry at the end of a drain is expected.
        assert!(queue.push_blocking(&[5i16; 256]));
        assert_eq!(fill(&mut out[..]), 256);
        let _draining = DrainMark::enter(&shared.draining);
        assert_eq!(fill(&mut out[..]), 0);
        assert_eq!(shared.counters.snapshot().underruns, 4);

        let totals: Vec<StreamEvent> = events.try_iter().collect();
        assert_eq!(
            totals,
            (1..=4)
                .map(|total| StreamEvent::UnderrunDetected { total })
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn single_byte_write_fails_once_queue_is_closed() {
        let fake = FakeBackend::new();
        let player = engine(&fake);
        player.start().unwrap();
        player
            .lifecycle
            .with_running(|s| s.stream.queue.close())
            .unwrap();

        assert!(matches!(player.write(&[7]), Err(AudioError::StreamClosed)));
        assert_eq!(player.stats().accepted_bytes, 0);
        player.stop().unwrap();
    }

    #[test]
    fn drain_does_not_count_underrun() {
        let fake = FakeBackend::new();
        let player = engine(&fake);
        player.start().unwrap();

        // Twice the queue, so the device is still busy when drain begins.
        player.write(&le_bytes(&vec![1i16; 16_000])).unwrap();
        player.drain().unwrap();
        player.stop().unwrap();

        assert_eq!(player.stats().underruns, 0);
        assert_eq!(fake.played_samples().len(), 16_000);
    }

    #[test]
    fn disconnect_fails_writes_until_closed() {
        let fake = FakeBackend::new();
        let player = engine(&fake);
        player.start().unwrap();
        fake.disconnect(Direction::Output, "speaker unplugged");

        assert!(matches!(player.write(&[0, 0]), Err(AudioError::Stream(_))));
        assert_eq!(player.state(), StreamState::Errored);
        assert!(matches!(player.start(), Err(AudioError::Stream(_))));
        assert!(!fake.is_held(Direction::Output, 0));

        player.close();
        player.start().unwrap();
        player.write(&[0, 0]).unwrap();
        player.close();
    }

    #[test]
    fn output_request_uses_tuning() {
        let fake = FakeBackend::new();
        let player = engine(&fake).with_tuning(EngineTuning {
            output_frames_per_buffer: 480,
            ..EngineTuning::default()
        });
        player
            .start_with(StreamConfig::new(48_000, 2, 9_600))
            .unwrap();
        player.close();

        let request = fake.requests()[0];
        assert_eq!(request.direction, Direction::Output);
        assert_eq!(request.frames_per_buffer, 480);
        assert_eq!(request.sample_rate, 48_000);
        assert_eq!(request.channels, 2);
    }
}
