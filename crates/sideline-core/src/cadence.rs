//! CPR cadence engine.
//!
//! A timed state machine driving the compression/breath protocol:
//!
//! ```text
//!  start ──▶ compressions ──(N+1th tick)──▶ breaths ──(last breath)──▶ compressions ...
//!                 │                            │
//!                 └──────────── stop ──────────┴──▶ idle
//! ```
//!
//! Each run is driven by a single task, so the compression ticker and the
//! breath sequence are never active at the same time. Ticks use
//! [`MissedTickBehavior::Delay`]: a late tick is not compensated, the next
//! one fires a full interval after the late one ran.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Default broadcast capacity for cadence events.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Compressions,
    Breaths,
}

/// Protocol timing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadenceParams {
    /// Time between compressions (600 ms = 100 per minute).
    pub compression_interval: Duration,
    /// Compressions before the breath phase.
    pub compressions_per_cycle: u32,
    /// Rescue breaths per cycle.
    pub breaths_per_cycle: u32,
    /// Duration of one breath.
    pub breath_duration: Duration,
    /// Pause before the first breath.
    pub breath_lead_in: Duration,
}

impl Default for CadenceParams {
    fn default() -> Self {
        Self {
            compression_interval: Duration::from_millis(600),
            compressions_per_cycle: 30,
            breaths_per_cycle: 2,
            breath_duration: Duration::from_millis(1000),
            breath_lead_in: Duration::from_millis(1000),
        }
    }
}

/// A fact reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceEvent {
    /// A fresh session began in the compression phase.
    Started,
    /// Compression number `n` of the current cycle. Tick `N + 1` is followed
    /// by the switch to breaths.
    CompressionTick(u32),
    /// The protocol moved to another phase.
    PhaseChanged(Phase),
    /// Breath number `n` of the current cycle.
    BreathTick(u32),
    /// A full compressions + breaths loop finished; carries the new count.
    CycleCompleted(u32),
    /// Guidance stopped after `cycles` full cycles.
    Stopped { cycles: u32 },
    /// The session was discarded.
    Reset,
}

/// Snapshot of a running or stopped session.
#[derive(Debug, Clone, PartialEq)]
pub struct CadenceSession {
    pub phase: Phase,
    /// Position within the phase (compression or breath number).
    pub phase_index: u32,
    pub elapsed_in_phase: Duration,
    pub cycle_count: u32,
    pub started_at: DateTime<Utc>,
}

/// Error reported by a cue output.
#[derive(Debug, Error)]
pub enum CueError {
    /// The output device is not available.
    #[error("Output unavailable: {0}")]
    Unavailable(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A consumer turning cadence events into vibration, sound or display.
///
/// Sinks are called from the engine's timing path and must return quickly.
/// They must not call back into the engine. Errors are logged and never
/// stop the timer.
pub trait CueSink: Send + Sync {
    /// Handle one event.
    fn cue(&self, event: &CadenceEvent) -> Result<(), CueError>;
}

#[derive(Debug)]
struct RunState {
    /// Bumped on every start/stop/reset; stale drivers compare against it.
    generation: u64,
    running: bool,
    phase: Phase,
    phase_index: u32,
    cycle_count: u32,
    started: Option<(DateTime<Utc>, Instant)>,
    phase_started: Instant,
    stopped_at: Option<Instant>,
}

impl RunState {
    fn new() -> Self {
        Self {
            generation: 0,
            running: false,
            phase: Phase::Idle,
            phase_index: 0,
            cycle_count: 0,
            started: None,
            phase_started: Instant::now(),
            stopped_at: None,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.phase_index = 0;
        self.phase_started = Instant::now();
    }

    fn now(&self) -> Instant {
        self.stopped_at.unwrap_or_else(Instant::now)
    }
}

struct Shared {
    params: CadenceParams,
    state: Mutex<RunState>,
    events: broadcast::Sender<CadenceEvent>,
    sinks: RwLock<Vec<Arc<dyn CueSink>>>,
}

impl Shared {
    /// Deliver an event. Called with the state lock held so delivery order
    /// matches state order.
    fn emit(&self, event: CadenceEvent) {
        trace!(?event, "Cadence event");
        // No receivers is fine
        let _ = self.events.send(event);
        for sink in self.sinks.read().iter() {
            if let Err(e) = sink.cue(&event) {
                warn!(error = %e, ?event, "Cue output failed");
            }
        }
    }

    /// Mutate state on behalf of the driver of `generation`.
    ///
    /// Returns `None` if that driver has been superseded or stopped.
    fn step<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut RunState, &mut Vec<CadenceEvent>) -> R,
    ) -> Option<R> {
        let mut state = self.state.lock();
        if state.generation != generation || !state.running {
            return None;
        }
        let mut events = Vec::with_capacity(2);
        let result = f(&mut state, &mut events);
        for event in events {
            self.emit(event);
        }
        Some(result)
    }
}

/// Drives the CPR protocol.
pub struct CadenceEngine {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CadenceEngine {
    /// Create an engine with the given parameters.
    #[must_use]
    pub fn new(params: CadenceParams) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                params,
                state: Mutex::new(RunState::new()),
                events,
                sinks: RwLock::new(Vec::new()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Get the parameters.
    #[must_use]
    pub fn params(&self) -> &CadenceParams {
        &self.shared.params
    }

    /// Receive phase and tick events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CadenceEvent> {
        self.shared.events.subscribe()
    }

    /// Attach a cue output.
    pub fn add_sink(&self, sink: Arc<dyn CueSink>) {
        self.shared.sinks.write().push(sink);
    }

    /// Start a fresh session, discarding any running one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if let Some(handle) = task.take() {
            handle.abort();
        }

        let generation = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.running = true;
            state.cycle_count = 0;
            state.started = Some((Utc::now(), Instant::now()));
            state.stopped_at = None;
            state.enter(Phase::Compressions);
            self.shared.emit(CadenceEvent::Started);
            state.generation
        };

        debug!(generation, "Cadence started");
        *task = Some(tokio::spawn(drive(Arc::clone(&self.shared), generation)));
    }

    /// Stop guidance. The cycle count stays readable until [`reset`](Self::reset).
    ///
    /// Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }

        let mut state = self.shared.state.lock();
        if !state.running {
            return;
        }
        state.generation += 1;
        state.running = false;
        state.phase = Phase::Idle;
        state.stopped_at = Some(Instant::now());
        let cycles = state.cycle_count;
        debug!(cycles, "Cadence stopped");
        self.shared.emit(CadenceEvent::Stopped { cycles });
    }

    /// Stop and discard the session.
    pub fn reset(&self) {
        self.stop();

        let mut state = self.shared.state.lock();
        let had_session = state.started.is_some();
        let generation = state.generation + 1;
        *state = RunState::new();
        state.generation = generation;
        if had_session {
            self.shared.emit(CadenceEvent::Reset);
        }
    }

    /// Snapshot of the session, or `None` if there is none.
    #[must_use]
    pub fn snapshot(&self) -> Option<CadenceSession> {
        let state = self.shared.state.lock();
        let (started_at, _) = state.started?;
        Some(CadenceSession {
            phase: state.phase,
            phase_index: state.phase_index,
            elapsed_in_phase: state.now().saturating_duration_since(state.phase_started),
            cycle_count: state.cycle_count,
            started_at,
        })
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Completed cycles in the current (or last stopped) session.
    #[must_use]
    pub fn cycle_count(&self) -> u32 {
        self.shared.state.lock().cycle_count
    }

    /// Check if guidance is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Total time the session has been running.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        let state = self.shared.state.lock();
        state
            .started
            .map(|(_, at)| state.now().saturating_duration_since(at))
            .unwrap_or_default()
    }
}

impl Drop for CadenceEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for CadenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenceEngine")
            .field("params", &self.shared.params)
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

enum Tick {
    Compression,
    ToBreaths,
}

async fn drive(shared: Arc<Shared>, generation: u64) {
    let params = shared.params.clone();
    // interval() rejects a zero period
    let period = params.compression_interval.max(Duration::from_millis(1));

    loop {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let tick = shared.step(generation, |state, events| {
                state.phase_index += 1;
                events.push(CadenceEvent::CompressionTick(state.phase_index));
                if state.phase_index > params.compressions_per_cycle {
                    state.enter(Phase::Breaths);
                    events.push(CadenceEvent::PhaseChanged(Phase::Breaths));
                    Tick::ToBreaths
                } else {
                    Tick::Compression
                }
            });
            match tick {
                Some(Tick::Compression) => {}
                Some(Tick::ToBreaths) => break,
                None => return,
            }
        }

        time::sleep(params.breath_lead_in).await;
        for breath in 1..=params.breaths_per_cycle {
            let stepped = shared.step(generation, |state, events| {
                state.phase_index = breath;
                events.push(CadenceEvent::BreathTick(breath));
            });
            if stepped.is_none() {
                return;
            }
            time::sleep(params.breath_duration).await;
        }

        let stepped = shared.step(generation, |state, events| {
            state.cycle_count += 1;
            state.enter(Phase::Compressions);
            events.push(CadenceEvent::CycleCompleted(state.cycle_count));
            events.push(CadenceEvent::PhaseChanged(Phase::Compressions));
        });
        if stepped.is_none() {
            return;
        }
    }
}
