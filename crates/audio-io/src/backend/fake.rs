//! In-process backend with scripted devices.
//!
//! Streams run on real threads, like hardware would, but produce and consume samples on
//! a fixed schedule. Everything the engines hand to the "hardware" is recorded so tests
//! can check byte-exact delivery, device holds and fault handling.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{
    AudioBackend, BackendFault, BackendStream, FaultHandler, InputBlock, InputHandler,
    OutputHandler, StreamRequest,
};
use crate::device::{DeviceDescriptor, DeviceIndex, Direction};
use crate::error::{AudioError, Result};

/// How fake capture streams produce data.
#[derive(Clone, Debug)]
pub struct FakeInputScript {
    /// Frames per callback. `0` uses the request's `frames_per_buffer`.
    pub block_frames: usize,
    /// Stop producing after this many frames per stream.
    pub total_frames: Option<u64>,
    /// Pause between callbacks.
    pub period: Duration,
    /// Zero-based callback numbers reported as overruns.
    pub overrun_blocks: Vec<u64>,
}

impl Default for FakeInputScript {
    fn default() -> Self {
        Self {
            block_frames: 0,
            total_frames: None,
            period: Duration::from_millis(1),
            overrun_blocks: Vec::new(),
        }
    }
}

/// How fast fake playback streams consume data.
#[derive(Clone, Debug)]
pub struct FakeOutputPace {
    pub block_frames: usize,
    pub period: Duration,
}

impl Default for FakeOutputPace {
    fn default() -> Self {
        Self {
            block_frames: 256,
            period: Duration::from_millis(1),
        }
    }
}

#[derive(Default)]
struct Progress {
    input_frames: u64,
    input_samples: Vec<i16>,
    played: Vec<i16>,
    silence_samples: u64,
}

struct OpenStream {
    direction: Direction,
    on_fault: FaultHandler,
    dead: Arc<AtomicBool>,
}

struct FakeState {
    inputs: Mutex<Vec<String>>,
    outputs: Mutex<Vec<String>>,
    available: AtomicBool,
    input_script: Mutex<FakeInputScript>,
    output_pace: Mutex<FakeOutputPace>,
    held: Mutex<HashSet<(Direction, usize)>>,
    active: Mutex<HashMap<u64, OpenStream>>,
    requests: Mutex<Vec<StreamRequest>>,
    progress: Mutex<Progress>,
    progress_cv: Condvar,
    next_id: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted backend. Clones share the same devices and recordings.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    /// One microphone and one speaker.
    pub fn new() -> Self {
        Self::with_devices(&["Fake Microphone"], &["Fake Speaker"])
    }

    pub fn with_devices(inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            state: Arc::new(FakeState {
                inputs: Mutex::new(inputs.iter().map(|s| s.to_string()).collect()),
                outputs: Mutex::new(outputs.iter().map(|s| s.to_string()).collect()),
                available: AtomicBool::new(true),
                input_script: Mutex::new(FakeInputScript::default()),
                output_pace: Mutex::new(FakeOutputPace::default()),
                held: Mutex::new(HashSet::new()),
                active: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                progress: Mutex::new(Progress::default()),
                progress_cv: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// A backend whose subsystem cannot be queried or opened.
    pub fn unavailable() -> Self {
        let backend = Self::new();
        backend.state.available.store(false, Ordering::SeqCst);
        backend
    }

    pub fn set_input_script(&self, script: FakeInputScript) {
        *lock(&self.state.input_script) = script;
    }

    pub fn set_output_pace(&self, pace: FakeOutputPace) {
        *lock(&self.state.output_pace) = pace;
    }

    /// Replace the device list for `direction`, as if hardware was (un)plugged.
    pub fn set_devices(&self, direction: Direction, names: &[&str]) {
        let list = names.iter().map(|s| s.to_string()).collect();
        match direction {
            Direction::Input => *lock(&self.state.inputs) = list,
            Direction::Output => *lock(&self.state.outputs) = list,
        }
    }

    /// Whether an open stream currently holds the device exclusively.
    pub fn is_held(&self, direction: Direction, index: usize) -> bool {
        lock(&self.state.held).contains(&(direction, index))
    }

    pub fn open_streams(&self) -> usize {
        lock(&self.state.active).len()
    }

    /// Every request passed to `open_*`, oldest first.
    pub fn requests(&self) -> Vec<StreamRequest> {
        lock(&self.state.requests).clone()
    }

    /// Simulate the device disappearing under every open stream of `direction`.
    pub fn disconnect(&self, direction: Direction, reason: &str) {
        let handlers: Vec<FaultHandler> = lock(&self.state.active)
            .values()
            .filter(|s| s.direction == direction)
            .map(|s| {
                s.dead.store(true, Ordering::SeqCst);
                s.on_fault.clone()
            })
            .collect();
        for handler in handlers {
            handler(BackendFault::Disconnected(reason.to_string()));
        }
    }

    /// Report a recoverable glitch to every open stream of `direction`.
    pub fn glitch(&self, direction: Direction, reason: &str) {
        let handlers: Vec<FaultHandler> = lock(&self.state.active)
            .values()
            .filter(|s| s.direction == direction)
            .map(|s| s.on_fault.clone())
            .collect();
        for handler in handlers {
            handler(BackendFault::Transient(reason.to_string()));
        }
    }

    /// Frames produced by capture streams so far.
    pub fn input_frames(&self) -> u64 {
        lock(&self.state.progress).input_frames
    }

    /// Every sample produced by capture streams, in order.
    pub fn input_samples(&self) -> Vec<i16> {
        lock(&self.state.progress).input_samples.clone()
    }

    /// Real (non-silence) samples consumed by playback streams, in order.
    pub fn played_samples(&self) -> Vec<i16> {
        lock(&self.state.progress).played.clone()
    }

    /// Samples the playback streams had to fill with silence.
    pub fn silence_samples(&self) -> u64 {
        lock(&self.state.progress).silence_samples
    }

    /// Block until at least `frames` capture frames were produced.
    pub fn wait_for_input_frames(&self, frames: u64, timeout: Duration) -> bool {
        self.wait_progress(timeout, |p| p.input_frames >= frames)
    }

    /// Block until at least `samples` real samples were played.
    pub fn wait_for_played_samples(&self, samples: usize, timeout: Duration) -> bool {
        self.wait_progress(timeout, |p| p.played.len() >= samples)
    }

    fn wait_progress(&self, timeout: Duration, done: impl Fn(&Progress) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = lock(&self.state.progress);
        while !done(&g) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _) = self
                .state
                .progress_cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            g = ng;
        }
        true
    }

    fn resolve(&self, direction: Direction, device: DeviceIndex) -> Result<(usize, String)> {
        let names = match direction {
            Direction::Input => lock(&self.state.inputs).clone(),
            Direction::Output => lock(&self.state.outputs).clone(),
        };
        let index = match device {
            DeviceIndex::Index(i) => i,
            DeviceIndex::Default => 0,
        };
        names
            .get(index)
            .map(|name| (index, name.clone()))
            .ok_or_else(|| AudioError::DeviceOpen(format!("no {direction} device {device}")))
    }

    fn acquire(
        &self,
        request: &StreamRequest,
        on_fault: FaultHandler,
    ) -> Result<(u64, (Direction, usize), String, Arc<AtomicBool>)> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(AudioError::BackendUnavailable("fake backend disabled".into()));
        }
        lock(&self.state.requests).push(*request);

        let (index, name) = self.resolve(request.direction, request.device)?;
        let key = (request.direction, index);
        if !lock(&self.state.held).insert(key) {
            return Err(AudioError::DeviceOpen(format!("{name} is busy")));
        }

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let dead = Arc::new(AtomicBool::new(false));
        lock(&self.state.active).insert(
            id,
            OpenStream {
                direction: request.direction,
                on_fault,
                dead: dead.clone(),
            },
        );
        Ok((id, key, name, dead))
    }

    fn release(&self, id: u64, key: (Direction, usize)) {
        self.state.release(id, key);
    }
}

impl FakeState {
    fn release(&self, id: u64, key: (Direction, usize)) {
        lock(&self.active).remove(&id);
        lock(&self.held).remove(&key);
    }
}

impl AudioBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn devices(&self, direction: Direction) -> Result<Vec<DeviceDescriptor>> {
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(AudioError::BackendUnavailable("fake backend disabled".into()));
        }
        let names = match direction {
            Direction::Input => lock(&self.state.inputs).clone(),
            Direction::Output => lock(&self.state.outputs).clone(),
        };
        Ok(names
            .into_iter()
            .enumerate()
            .map(|(index, name)| DeviceDescriptor {
                index,
                name,
                direction,
            })
            .collect())
    }

    fn open_input(
        &self,
        request: &StreamRequest,
        mut on_data: InputHandler,
        on_fault: FaultHandler,
    ) -> Result<Box<dyn BackendStream>> {
        let (id, key, name, dead) = self.acquire(request, on_fault)?;
        let script = lock(&self.state.input_script).clone();
        let channels = request.channels.max(1) as usize;
        let block_frames = if script.block_frames == 0 {
            request.frames_per_buffer.max(1) as usize
        } else {
            script.block_frames
        };
        let state = self.state.clone();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let join = thread::Builder::new()
            .name("fake-input".into())
            .spawn(move || {
                let mut produced: u64 = 0;
                let mut block_no: u64 = 0;
                let mut next_sample: u64 = 0;
                let mut buf = Vec::with_capacity(block_frames * channels);
                loop {
                    let remaining = script
                        .total_frames
                        .map(|t| t.saturating_sub(produced))
                        .unwrap_or(u64::MAX);
                    if remaining == 0 || dead.load(Ordering::SeqCst) {
                        let _ = stop_rx.recv();
                        break;
                    }
                    let frames = (block_frames as u64).min(remaining) as usize;
                    buf.clear();
                    for _ in 0..frames * channels {
                        buf.push((next_sample % 32_768) as i16);
                        next_sample += 1;
                    }
                    on_data(InputBlock {
                        samples: &buf,
                        overrun: script.overrun_blocks.contains(&block_no),
                    });
                    produced += frames as u64;
                    block_no += 1;
                    {
                        let mut p = lock(&state.progress);
                        p.input_frames += frames as u64;
                        p.input_samples.extend_from_slice(&buf);
                    }
                    state.progress_cv.notify_all();

                    if !pace(&stop_rx, script.period) {
                        break;
                    }
                }
            });
        let join = match join {
            Ok(join) => join,
            Err(e) => {
                self.release(id, key);
                return Err(e.into());
            }
        };

        Ok(Box::new(FakeStream {
            id,
            key,
            device_name: name,
            stop_tx: Some(stop_tx),
            join: Some(join),
            state: self.state.clone(),
        }))
    }

    fn open_output(
        &self,
        request: &StreamRequest,
        mut on_fill: OutputHandler,
        on_fault: FaultHandler,
    ) -> Result<Box<dyn BackendStream>> {
        let (id, key, name, dead) = self.acquire(request, on_fault)?;
        let pace_cfg = lock(&self.state.output_pace).clone();
        let channels = request.channels.max(1) as usize;
        let state = self.state.clone();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let join = thread::Builder::new()
            .name("fake-output".into())
            .spawn(move || {
                let mut buf = vec![0i16; pace_cfg.block_frames.max(1) * channels];
                loop {
                    if !dead.load(Ordering::SeqCst) {
                        let filled = on_fill(&mut buf).min(buf.len());
                        {
                            let mut p = lock(&state.progress);
                            p.played.extend_from_slice(&buf[..filled]);
                            p.silence_samples += (buf.len() - filled) as u64;
                        }
                        state.progress_cv.notify_all();
                    }
                    if !pace(&stop_rx, pace_cfg.period) {
                        break;
                    }
                }
            });
        let join = match join {
            Ok(join) => join,
            Err(e) => {
                self.release(id, key);
                return Err(e.into());
            }
        };

        Ok(Box::new(FakeStream {
            id,
            key,
            device_name: name,
            stop_tx: Some(stop_tx),
            join: Some(join),
            state: self.state.clone(),
        }))
    }
}

/// Wait one period. `false` once the stream handle was dropped.
fn pace(stop_rx: &Receiver<()>, period: Duration) -> bool {
    matches!(stop_rx.recv_timeout(period), Err(RecvTimeoutError::Timeout))
}

struct FakeStream {
    id: u64,
    key: (Direction, usize),
    device_name: String,
    stop_tx: Option<Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
    state: Arc<FakeState>,
}

impl BackendStream for FakeStream {
    fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(join) = self.join.take() {
            // Dropped from inside its own callback: the thread exits once it returns.
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
        self.state.release(self.id, self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(direction: Direction) -> StreamRequest {
        StreamRequest {
            direction,
            device: DeviceIndex::Default,
            sample_rate: 16_000,
            channels: 1,
            frames_per_buffer: 160,
        }
    }

    fn no_faults() -> FaultHandler {
        Arc::new(|_: BackendFault| {})
    }

    #[test]
    fn lists_devices_per_direction() {
        let backend = FakeBackend::with_devices(&["mic a", "mic b"], &["spk"]);
        let inputs = backend.devices(Direction::Input).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].index, 1);
        assert_eq!(inputs[1].name, "mic b");
        assert_eq!(inputs[1].direction, Direction::Input);
        assert_eq!(backend.devices(Direction::Output).unwrap().len(), 1);
    }

    #[test]
    fn unavailable_backend_reports_error() {
        let backend = FakeBackend::unavailable();
        assert!(matches!(
            backend.devices(Direction::Input),
            Err(AudioError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn device_is_held_while_stream_lives() {
        let backend = FakeBackend::new();
        let stream = backend
            .open_input(&request(Direction::Input), Box::new(|_: InputBlock<'_>| {}), no_faults())
            .unwrap();
        assert!(backend.is_held(Direction::Input, 0));
        assert!(matches!(
            backend.open_input(&request(Direction::Input), Box::new(|_: InputBlock<'_>| {}), no_faults()),
            Err(AudioError::DeviceOpen(_))
        ));
        drop(stream);
        assert!(!backend.is_held(Direction::Input, 0));
        assert_eq!(backend.open_streams(), 0);
    }

    #[test]
    fn unknown_index_fails_to_open() {
        let backend = FakeBackend::new();
        let mut req = request(Direction::Output);
        req.device = DeviceIndex::Index(4);
        assert!(matches!(
            backend.open_output(&req, Box::new(|_: &mut [i16]| 0), no_faults()),
            Err(AudioError::DeviceOpen(_))
        ));
    }

    #[test]
    fn scripted_input_stops_after_total_frames() {
        let backend = FakeBackend::new();
        backend.set_input_script(FakeInputScript {
            block_frames: 100,
            total_frames: Some(250),
            period: Duration::from_millis(0),
            overrun_blocks: vec![],
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let stream = backend
            .open_input(
                &request(Direction::Input),
                Box::new(move |block: InputBlock<'_>| lock(&sink).push(block.samples.len())),
                no_faults(),
            )
            .unwrap();
        assert!(backend.wait_for_input_frames(250, Duration::from_secs(2)));
        drop(stream);
        assert_eq!(*lock(&seen), vec![100, 100, 50]);
    }
}
