//! Stream lifecycle shared by the capture and playback engines.
//!
//! ```text
//!   Idle ──start──▶ Running ──stop──▶ Stopped ──start──▶ Running
//!                      │ fault
//!                      ▼
//!                   Errored ──close──▶ Closed ──start──▶ Running
//! ```
//!
//! `close` is accepted from every state. The controller mutex serializes concurrent
//! `start` calls: the second caller waits for the first and then gets `AlreadyRunning`.
//!
//! The [`DeliveryGate`] is what makes `stop` a hard barrier. Every backend callback and
//! every blocking `write` holds the read side while it touches engine state; `stop`
//! clears the flag and then takes the write side, so it returns only after the last
//! in-flight delivery has finished and no later delivery can get through.

use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use crate::backend::{BackendFault, FaultHandler};
use crate::config::StreamConfig;
use crate::error::{AudioError, Result};
use crate::status::{EventBus, StreamEvent};

/// Observable stream state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Never started.
    Idle,
    Running,
    /// Hardware released; `start` reopens.
    Stopped,
    /// Backend failure. Only `close` is accepted.
    Errored,
    /// Released by `close`; `start` opens a fresh stream.
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Idle => "idle",
            StreamState::Running => "running",
            StreamState::Stopped => "stopped",
            StreamState::Errored => "errored",
            StreamState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Barrier between backend deliveries and `stop`.
#[derive(Debug)]
pub(crate) struct DeliveryGate {
    open: AtomicBool,
    in_flight: RwLock<()>,
}

impl DeliveryGate {
    pub(crate) fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            in_flight: RwLock::new(()),
        }
    }

    /// Admit one delivery. `None` once the gate is closed.
    pub(crate) fn enter(&self) -> Option<RwLockReadGuard<'_, ()>> {
        let guard = self.in_flight.read().unwrap_or_else(PoisonError::into_inner);
        if self.open.load(Ordering::Acquire) {
            Some(guard)
        } else {
            None
        }
    }

    /// Refuse new deliveries. In-flight ones keep running.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Wait for every in-flight delivery to leave.
    pub(crate) fn drain(&self) {
        drop(self.in_flight.write().unwrap_or_else(PoisonError::into_inner));
    }

    pub(crate) fn shut(&self) {
        self.close();
        self.drain();
    }
}

/// Fatal fault raised by a backend thread, observed by the next API call.
#[derive(Debug, Default)]
pub(crate) struct FaultSlot {
    raised: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl FaultSlot {
    /// Record the first fault. Later ones are ignored.
    pub(crate) fn raise(&self, reason: String) -> bool {
        let mut g = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if g.is_some() {
            return false;
        }
        *g = Some(reason);
        self.raised.store(true, Ordering::Release);
        true
    }

    pub(crate) fn reason(&self) -> Option<String> {
        if !self.raised.load(Ordering::Acquire) {
            return None;
        }
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Build the backend fault callback for one session.
///
/// Fatal faults land in `slot`, post [`StreamEvent::Faulted`] and run `on_fatal`
/// (used to wake blocked writers). Transient faults are only logged.
pub(crate) fn fault_handler(
    label: &'static str,
    slot: Arc<FaultSlot>,
    events: EventBus,
    on_fatal: impl Fn() + Send + Sync + 'static,
) -> FaultHandler {
    Arc::new(move |fault: BackendFault| match fault {
        BackendFault::Disconnected(reason) => {
            if slot.raise(reason.clone()) {
                tracing::error!(stream = label, %reason, "stream fault");
                events.emit(StreamEvent::Faulted { reason });
                on_fatal();
            }
        }
        BackendFault::Transient(reason) => {
            tracing::warn!(stream = label, %reason, "transient stream error");
        }
    })
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE_CALLBACK: Cell<Option<u64>> = const { Cell::new(None) };
}

pub(crate) fn next_engine_id() -> u64 {
    NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Marks the current thread as running engine `id`'s user callback.
pub(crate) struct CallbackScope {
    prev: Option<u64>,
}

impl CallbackScope {
    pub(crate) fn enter(id: u64) -> Self {
        Self {
            prev: ACTIVE_CALLBACK.replace(Some(id)),
        }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        ACTIVE_CALLBACK.set(self.prev);
    }
}

pub(crate) fn inside_callback(id: u64) -> bool {
    ACTIVE_CALLBACK.get() == Some(id)
}

/// Backend resources of one running session.
pub(crate) trait ActiveStream: Send {
    /// Stop deliveries, wait for in-flight ones, release the hardware.
    fn halt(&mut self);
}

pub(crate) struct Session<S> {
    pub(crate) stream: S,
    pub(crate) config: StreamConfig,
    pub(crate) fault: Arc<FaultSlot>,
}

struct Slot<S> {
    state: StreamState,
    session: Option<Session<S>>,
    error: Option<String>,
}

/// The state machine. One per engine.
pub(crate) struct Lifecycle<S> {
    label: &'static str,
    slot: Mutex<Slot<S>>,
}

impl<S: ActiveStream> Lifecycle<S> {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            slot: Mutex::new(Slot {
                state: StreamState::Idle,
                session: None,
                error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<S>> {
        let mut g = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.observe_fault(&mut g);
        g
    }

    fn observe_fault(&self, slot: &mut Slot<S>) {
        if slot.state != StreamState::Running {
            return;
        }
        let Some(reason) = slot.session.as_ref().and_then(|s| s.fault.reason()) else {
            return;
        };
        if let Some(mut session) = slot.session.take() {
            session.stream.halt();
        }
        tracing::warn!(stream = self.label, %reason, "stream errored, close required");
        slot.state = StreamState::Errored;
        slot.error = Some(reason);
    }

    fn errored(slot: &Slot<S>) -> AudioError {
        AudioError::Stream(slot.error.clone().unwrap_or_else(|| "unknown failure".into()))
    }

    pub(crate) fn state(&self) -> StreamState {
        self.lock().state
    }

    pub(crate) fn active_config(&self) -> Option<StreamConfig> {
        self.lock().session.as_ref().map(|s| s.config)
    }

    /// Validate `config` and open a session with `open`. State is untouched on failure.
    pub(crate) fn start(
        &self,
        config: StreamConfig,
        open: impl FnOnce(&StreamConfig, Arc<FaultSlot>) -> Result<S>,
    ) -> Result<()> {
        let mut g = self.lock();
        match g.state {
            StreamState::Running => return Err(AudioError::AlreadyRunning),
            StreamState::Errored => return Err(Self::errored(&g)),
            StreamState::Idle | StreamState::Stopped | StreamState::Closed => {}
        }
        config.validate()?;

        let fault = Arc::new(FaultSlot::default());
        let stream = open(&config, fault.clone())?;
        g.session = Some(Session {
            stream,
            config,
            fault,
        });
        g.state = StreamState::Running;
        tracing::info!(
            stream = self.label,
            sample_rate = config.sample_rate,
            channels = config.channels,
            chunk_size = config.chunk_size,
            device = %config.device,
            "stream started"
        );
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<()> {
        let mut g = self.lock();
        match g.state {
            StreamState::Running => {
                if let Some(mut session) = g.session.take() {
                    session.stream.halt();
                }
                g.state = StreamState::Stopped;
                tracing::info!(stream = self.label, "stream stopped");
                Ok(())
            }
            StreamState::Errored => Err(Self::errored(&g)),
            StreamState::Idle | StreamState::Stopped | StreamState::Closed => Ok(()),
        }
    }

    /// Release everything. Idempotent.
    pub(crate) fn close(&self) {
        let mut g = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut session) = g.session.take() {
            session.stream.halt();
        }
        if g.state != StreamState::Closed {
            tracing::debug!(stream = self.label, from = %g.state, "stream closed");
        }
        g.state = StreamState::Closed;
        g.error = None;
    }

    /// Take the session out without halting it and mark the engine closed.
    ///
    /// For teardown on a thread that must not wait on the stream's own deliveries.
    pub(crate) fn detach(&self) -> Option<S> {
        let mut g = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        g.state = StreamState::Closed;
        g.error = None;
        g.session.take().map(|session| session.stream)
    }

    /// Run `f` against the running session.
    pub(crate) fn with_running<R>(&self, f: impl FnOnce(&Session<S>) -> R) -> Result<R> {
        let g = self.lock();
        match (g.state, g.session.as_ref()) {
            (StreamState::Running, Some(session)) => Ok(f(session)),
            (StreamState::Errored, _) => Err(Self::errored(&g)),
            _ => Err(AudioError::StreamClosed),
        }
    }
}

/// Engines that can be closed by a [`StreamGuard`].
pub trait ManagedStream {
    /// Release the stream, whatever its state.
    fn release(&self);
}

/// Scoped stream: dropping the guard closes the engine on every exit path.
pub struct StreamGuard<'a, E: ManagedStream> {
    engine: &'a E,
}

impl<'a, E: ManagedStream> StreamGuard<'a, E> {
    pub(crate) fn new(engine: &'a E) -> Self {
        Self { engine }
    }
}

impl<E: ManagedStream> Deref for StreamGuard<'_, E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.engine
    }
}

impl<E: ManagedStream> Drop for StreamGuard<'_, E> {
    fn drop(&mut self) {
        self.engine.release();
    }
}
