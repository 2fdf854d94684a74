//! Metronome: the async handle around the lookahead scheduler.
//!
//! Owns the scheduler state, the precise clock, the observer registries and
//! the poll task. The poll task is a single tokio task that sleeps for the
//! corrected re-arm delay between passes; its `JoinHandle` is the cancellable
//! re-arm handle. Every start bumps a generation counter and every pass checks
//! it under the state lock, so a pass that was already running when `stop()`
//! returned can neither submit nor commit another tick.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::MetronomeConfig;
use crate::engine::backend::AudioClock;
use crate::error::{log_clock_error, ClockError, ErrorCode};
use crate::managers::ObserverRegistry;
use crate::scheduler::{MetronomeState, Scheduler, Tick};

#[path = "core_subscriptions.rs"]
mod core_subscriptions;

/// Telemetry event emitted by the metronome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp_ms: u64,
    pub kind: TelemetryEventKind,
}

/// Types of telemetry events supported by the metronome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryEventKind {
    Started { bpm: f64 },
    Stopped { time_offset: f64 },
    BpmChanged { bpm: f64 },
    MeterChanged { meter: u32 },
    StartFailed { code: i32 },
    Disposed,
}

/// Delay before the poll task retries a pass that found another in flight.
const BUSY_RETRY: Duration = Duration::from_millis(1);

/// Result of one poll pass.
#[derive(Debug, Clone, Copy, PartialEq)]
enum PassOutcome {
    /// Transport still running; poll again after the delay.
    Rearm { ticks: usize, delay: Duration },
    /// Transport stopped (or restarted) underneath the pass.
    Stopped { ticks: usize },
    /// Another pass is in flight.
    Busy,
}

/// State guarded by one lock: scheduler, poll generation and re-arm handle.
struct Core {
    scheduler: Scheduler,
    /// Bumped by every start and stop; a poll pass only runs for its own.
    generation: u64,
    /// Bumped by every `stop()`/`dispose()` call, running or not. A start
    /// that observes a different epoch after awaiting the clock gives up.
    epoch: u64,
    disposed: bool,
    poll_task: Option<JoinHandle<()>>,
}

struct Inner {
    clock: Arc<dyn AudioClock>,
    core: Mutex<Core>,
    /// Serializes poll passes; never taken by setters.
    pass_lock: Mutex<()>,
    tick_observers: ObserverRegistry<Tick>,
    state_observers: ObserverRegistry<MetronomeState>,
    telemetry_tx: broadcast::Sender<TelemetryEvent>,
    start_instant: Instant,
}

/// Precision metronome handle.
///
/// All setters and `stop()` are synchronous and complete on return.
/// `start()` is the only suspension point: it awaits the clock resource and
/// must run inside a Tokio runtime, which also hosts the poll task.
pub struct Metronome {
    inner: Arc<Inner>,
}

impl Metronome {
    /// Create a metronome over `clock` with the given configuration.
    pub fn from_config(config: MetronomeConfig, clock: Arc<dyn AudioClock>) -> Self {
        let config = config.sanitized();
        let (telemetry_tx, _) = broadcast::channel(128);

        Self {
            inner: Arc::new(Inner {
                clock,
                core: Mutex::new(Core {
                    scheduler: Scheduler::new(&config),
                    generation: 0,
                    epoch: 0,
                    disposed: false,
                    poll_task: None,
                }),
                pass_lock: Mutex::new(()),
                tick_observers: ObserverRegistry::new(),
                state_observers: ObserverRegistry::new(),
                telemetry_tx,
                start_instant: Instant::now(),
            }),
        }
    }

    /// Create a metronome over `clock` with default configuration.
    pub fn with_clock(clock: Arc<dyn AudioClock>) -> Self {
        Self::from_config(MetronomeConfig::default(), clock)
    }

    pub fn clock(&self) -> Arc<dyn AudioClock> {
        Arc::clone(&self.inner.clock)
    }

    // ========================================================================
    // READ ACCESSORS
    // ========================================================================

    pub fn is_playing(&self) -> bool {
        self.inner.lock_core().scheduler.is_playing()
    }

    pub fn pulse(&self) -> u32 {
        self.inner.lock_core().scheduler.transport().pulse()
    }

    pub fn meter(&self) -> u32 {
        self.inner.lock_core().scheduler.tempo().meter()
    }

    pub fn bpm(&self) -> f64 {
        self.inner.lock_core().scheduler.tempo().bpm()
    }

    /// Copy of the accent mask.
    pub fn accents(&self) -> Vec<bool> {
        self.inner.lock_core().scheduler.tempo().accents().to_vec()
    }

    pub fn state(&self) -> MetronomeState {
        self.inner.lock_core().scheduler.snapshot()
    }

    // ========================================================================
    // TEMPO / METER / ACCENT MUTATORS
    // ========================================================================

    /// Set the tempo, clamped into the configured bounds.
    ///
    /// The due time of the next tick is not touched; the new interval applies
    /// from the next committed tick.
    pub fn set_bpm(&self, bpm: f64) {
        let bpm = self.inner.lock_core().scheduler.tempo_mut().set_bpm(bpm);
        self.inner.emit(TelemetryEventKind::BpmChanged { bpm });
        self.inner.notify_state();
    }

    pub fn increase_bpm(&self, delta: f64) {
        self.set_bpm(self.bpm() + delta);
    }

    pub fn decrease_bpm(&self, delta: f64) {
        self.set_bpm(self.bpm() - delta);
    }

    /// Change the meter and reset the accent mask to "beat 1 accented".
    ///
    /// A meter of zero is ignored. The pulse is not reset while playing.
    pub fn set_meter(&self, meter: u32) {
        self.apply_meter(meter, None);
    }

    /// Change the meter and adopt `accents`, fitted to the new meter.
    pub fn set_meter_with_accents(&self, meter: u32, accents: Vec<bool>) {
        self.apply_meter(meter, Some(&accents));
    }

    fn apply_meter(&self, meter: u32, accents: Option<&[bool]>) {
        let changed = self
            .inner
            .lock_core()
            .scheduler
            .tempo_mut()
            .set_meter(meter, accents);
        if !changed {
            return;
        }
        self.inner.emit(TelemetryEventKind::MeterChanged { meter });
        self.inner.notify_state();
    }

    /// Replace the accent mask, fitted to the current meter.
    pub fn set_accents(&self, accents: Vec<bool>) {
        self.inner
            .lock_core()
            .scheduler
            .tempo_mut()
            .set_accents(&accents);
        self.inner.notify_state();
    }

    /// Flip the accent of beat `index` (0-based). Out of range is ignored.
    pub fn toggle_accent(&self, index: usize) {
        let changed = self
            .inner
            .lock_core()
            .scheduler
            .tempo_mut()
            .toggle_accent(index);
        if changed {
            self.inner.notify_state();
        }
    }

    /// Set the accent of beat `index` (0-based). Out of range is ignored.
    pub fn set_accent(&self, index: usize, accented: bool) {
        let changed = self
            .inner
            .lock_core()
            .scheduler
            .tempo_mut()
            .set_accent(index, accented);
        if changed {
            self.inner.notify_state();
        }
    }

    // ========================================================================
    // TRANSPORT
    // ========================================================================

    /// Start playing. A no-op when already running.
    ///
    /// Awaits the clock resource first; if that fails the error is returned
    /// and the transport stays stopped.
    ///
    /// A `stop()` or `dispose()` issued while the clock is still being
    /// acquired cancels the start: after `stop()` it returns `Ok` without
    /// playing, after `dispose()` it releases the clock again and returns
    /// [`ClockError::Closed`].
    pub async fn start(&self) -> Result<(), ClockError> {
        let epoch = {
            let mut core = self.inner.lock_core();
            if core.scheduler.is_playing() {
                return Ok(());
            }
            core.disposed = false;
            core.epoch
        };

        if let Err(err) = self.inner.clock.resume_if_suspended().await {
            log_clock_error(&err, "start");
            self.inner
                .emit(TelemetryEventKind::StartFailed { code: err.code() });
            return Err(err);
        }

        let (generation, bpm) = {
            let mut core = self.inner.lock_core();
            if core.epoch != epoch {
                if core.disposed {
                    drop(core);
                    tracing::info!("[Metronome] Disposed while starting; releasing clock");
                    self.inner.clock.close();
                    return Err(ClockError::Closed);
                }
                tracing::info!("[Metronome] Stopped while starting");
                return Ok(());
            }
            let now = self.inner.clock.now();
            if !core.scheduler.start_at(now) {
                return Ok(());
            }
            core.generation += 1;
            (core.generation, core.scheduler.tempo().bpm())
        };
        tracing::info!("[Metronome] Started at {} bpm", bpm);
        self.inner.emit(TelemetryEventKind::Started { bpm });

        // A pass left over from before the last stop may still hold the pass
        // lock; the poll task then retries shortly instead of this pass.
        let first_delay = match self.inner.pass(self.inner.clock.now(), generation) {
            PassOutcome::Rearm { delay, .. } => Some(delay),
            PassOutcome::Busy => Some(BUSY_RETRY),
            PassOutcome::Stopped { .. } => None,
        };
        if let Some(delay) = first_delay {
            let task = spawn_poll_loop(Arc::downgrade(&self.inner), generation, delay);
            let mut core = self.inner.lock_core();
            if core.generation == generation {
                core.poll_task = Some(task);
            } else {
                task.abort();
            }
        }

        self.inner.notify_state();
        Ok(())
    }

    /// Stop playing. A no-op when already stopped.
    ///
    /// Captures the phase for the next start, cancels the pending re-arm and
    /// releases the render voice before returning.
    pub fn stop(&self) {
        let time_offset = {
            let mut core = self.inner.lock_core();
            core.epoch += 1;
            let now = self.inner.clock.now();
            if !core.scheduler.stop_at(now, self.inner.clock.as_ref()) {
                return;
            }
            core.generation += 1;
            if let Some(task) = core.poll_task.take() {
                task.abort();
            }
            core.scheduler.transport().time_offset()
        };
        tracing::info!("[Metronome] Stopped, next beat offset {:.4}s", time_offset);
        self.inner
            .emit(TelemetryEventKind::Stopped { time_offset });
        self.inner.notify_state();
    }

    pub async fn toggle(&self) -> Result<(), ClockError> {
        if self.is_playing() {
            self.stop();
            Ok(())
        } else {
            self.start().await
        }
    }

    /// Optionally set the tempo, then toggle.
    pub async fn handle(&self, bpm: Option<f64>) -> Result<(), ClockError> {
        if let Some(bpm) = bpm {
            self.set_bpm(bpm);
        }
        self.toggle().await
    }

    /// Stop, drop every observer and release the clock resource.
    ///
    /// Safe to call repeatedly and while stopped. A later `start()`
    /// re-acquires the clock.
    pub fn dispose(&self) {
        self.inner.lock_core().disposed = true;
        self.stop();
        self.inner.tick_observers.clear();
        self.inner.state_observers.clear();
        self.inner.clock.close();
        self.inner.emit(TelemetryEventKind::Disposed);
    }

    /// Run one poll pass at clock time `now`, returning the ticks scheduled.
    ///
    /// The poll task calls this on its own; exposed for callers that drive
    /// the clock themselves.
    pub fn run_once(&self, now: f64) -> usize {
        let generation = self.inner.lock_core().generation;
        match self.inner.pass(now, generation) {
            PassOutcome::Rearm { ticks, .. } | PassOutcome::Stopped { ticks } => ticks,
            PassOutcome::Busy => 0,
        }
    }
}

impl Inner {
    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn emit(&self, kind: TelemetryEventKind) {
        let timestamp_ms = self.start_instant.elapsed().as_millis() as u64;
        let _ = self.telemetry_tx.send(TelemetryEvent { timestamp_ms, kind });
    }

    fn notify_state(&self) {
        let snapshot = self.lock_core().scheduler.snapshot();
        self.state_observers.notify(&snapshot);
    }

    /// Schedule every tick due before `now + schedule_ahead_time`.
    ///
    /// The state lock is released while observers run, so they may call back
    /// into the metronome; a bpm edit made by an observer already applies to
    /// the interval committed for the tick being notified.
    fn pass(&self, now: f64, generation: u64) -> PassOutcome {
        let _pass = match self.pass_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(err)) => err.into_inner(),
            Err(TryLockError::WouldBlock) => return PassOutcome::Busy,
        };

        let mut ticks = 0;
        loop {
            let (tick, snapshot) = {
                let mut core = self.lock_core();
                if core.generation != generation || !core.scheduler.is_playing() {
                    return PassOutcome::Stopped { ticks };
                }
                let horizon = core.scheduler.horizon(now);
                match core.scheduler.next_due(horizon, self.clock.as_ref()) {
                    Some(tick) => (tick, core.scheduler.snapshot()),
                    None => {
                        return PassOutcome::Rearm {
                            ticks,
                            delay: core.scheduler.rearm_delay(now),
                        }
                    }
                }
            };

            tracing::debug!(
                "[Metronome] Tick pulse={} accented={} at {:.6}",
                tick.pulse,
                tick.is_accented,
                tick.time
            );
            self.tick_observers.notify(&tick);
            self.state_observers.notify(&snapshot);
            ticks += 1;

            let mut core = self.lock_core();
            if core.generation != generation {
                return PassOutcome::Stopped { ticks };
            }
            core.scheduler.commit(&tick);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let core = self.core.get_mut().unwrap_or_else(|err| err.into_inner());
        if let Some(task) = core.poll_task.take() {
            task.abort();
        }
    }
}

/// Spawn the poll task: sleep, pass, re-arm, until the generation moves on.
fn spawn_poll_loop(weak: Weak<Inner>, generation: u64, first_delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = first_delay;
        loop {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let now = inner.clock.now();
            delay = match inner.pass(now, generation) {
                PassOutcome::Rearm { delay, .. } => delay,
                PassOutcome::Busy => BUSY_RETRY,
                PassOutcome::Stopped { .. } => break,
            };
        }
    })
}

#[cfg(test)]
mod tests;
