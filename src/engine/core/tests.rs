use super::*;
use crate::engine::backend::{ManualClock, RenderHandle};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Manual clock whose resume completes only once the gate is opened.
struct GatedClock {
    inner: Arc<ManualClock>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl GatedClock {
    fn new(inner: Arc<ManualClock>) -> (oneshot::Sender<()>, Self) {
        let (open_tx, open_rx) = oneshot::channel();
        let clock = Self {
            inner,
            gate: Mutex::new(Some(open_rx)),
        };
        (open_tx, clock)
    }
}

impl AudioClock for GatedClock {
    fn now(&self) -> f64 {
        self.inner.now()
    }

    fn resume_if_suspended(&self) -> BoxFuture<'_, Result<(), ClockError>> {
        let gate = self.gate.lock().unwrap().take();
        Box::pin(async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.inner.resume_if_suspended().await
        })
    }

    fn create_tone_source(&self) -> Result<RenderHandle, ClockError> {
        self.inner.create_tone_source()
    }

    fn create_envelope_control(&self) -> Result<RenderHandle, ClockError> {
        self.inner.create_envelope_control()
    }

    fn schedule_frequency(
        &self,
        tone: RenderHandle,
        frequency_hz: f64,
        at_time: f64,
    ) -> Result<(), ClockError> {
        self.inner.schedule_frequency(tone, frequency_hz, at_time)
    }

    fn schedule_envelope(
        &self,
        envelope: RenderHandle,
        at_time: f64,
        attack_time: f64,
        decay_time: f64,
    ) -> Result<(), ClockError> {
        self.inner
            .schedule_envelope(envelope, at_time, attack_time, decay_time)
    }

    fn release(&self, handle: RenderHandle) {
        self.inner.release(handle);
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl Metronome {
    pub fn new_test() -> (Self, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let metronome = Self::with_clock(clock.clone());
        (metronome, clock)
    }

    fn generation_for_test(&self) -> u64 {
        self.inner.lock_core().generation
    }

    fn has_poll_task_for_test(&self) -> bool {
        self.inner.lock_core().poll_task.is_some()
    }
}

#[tokio::test]
async fn test_start_bumps_generation_and_arms_poll_task() {
    let (metronome, _clock) = Metronome::new_test();
    assert_eq!(metronome.generation_for_test(), 0);
    assert!(!metronome.has_poll_task_for_test());

    metronome.start().await.unwrap();
    assert_eq!(metronome.generation_for_test(), 1);
    assert!(metronome.has_poll_task_for_test());

    metronome.stop();
    assert_eq!(metronome.generation_for_test(), 2);
    assert!(!metronome.has_poll_task_for_test());
}

#[tokio::test]
async fn test_second_start_is_noop() {
    let (metronome, clock) = Metronome::new_test();
    metronome.start().await.unwrap();
    metronome.start().await.unwrap();
    assert_eq!(metronome.generation_for_test(), 1);
    assert_eq!(clock.resume_count(), 1);
    assert_eq!(clock.scheduled_frequencies().len(), 1);
}

#[tokio::test]
async fn test_pass_is_busy_while_another_pass_runs() {
    let (metronome, clock) = Metronome::new_test();
    metronome.start().await.unwrap();
    clock.set_time(5.0);

    let _held = metronome.inner.pass_lock.lock().unwrap();
    assert_eq!(metronome.run_once(5.0), 0);
    assert_eq!(metronome.pulse(), 1, "Busy pass must not touch the transport");
}

#[tokio::test]
async fn test_stop_from_tick_observer_halts_pass() {
    let (metronome, clock) = Metronome::new_test();
    let metronome = Arc::new(metronome);
    metronome.start().await.unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let weak = Arc::downgrade(&metronome);
    let seen_in_cb = seen.clone();
    metronome.on_tick(move |_| {
        seen_in_cb.fetch_add(1, Ordering::SeqCst);
        if let Some(metronome) = weak.upgrade() {
            metronome.stop();
        }
    });

    // Several beats are due, but the first observer call stops the transport.
    clock.set_time(3.0);
    assert_eq!(metronome.run_once(3.0), 1);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(!metronome.is_playing());
    assert_eq!(clock.scheduled_frequencies().len(), 2);
}

#[tokio::test]
async fn test_bpm_set_by_observer_applies_to_committed_interval() {
    let (metronome, _clock) = Metronome::new_test();
    let metronome = Arc::new(metronome);
    metronome.set_bpm(60.0);

    let weak = Arc::downgrade(&metronome);
    metronome.on_tick(move |tick| {
        if tick.pulse == 1 {
            if let Some(metronome) = weak.upgrade() {
                metronome.set_bpm(120.0);
            }
        }
    });

    metronome.start().await.unwrap();
    assert!((metronome.state().next_tick_time - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_start_failure_publishes_telemetry() {
    let (metronome, clock) = Metronome::new_test();
    let mut telemetry = metronome.telemetry_receiver();
    clock.set_fail_resume(true);

    let err = metronome.start().await.unwrap_err();
    assert_eq!(err.code(), crate::error::ClockErrorCodes::RESUME_FAILED);

    let event = telemetry.try_recv().unwrap();
    assert_eq!(
        event.kind,
        TelemetryEventKind::StartFailed {
            code: crate::error::ClockErrorCodes::RESUME_FAILED
        }
    );
    assert_eq!(metronome.generation_for_test(), 0);
}

#[tokio::test]
async fn test_dropping_metronome_ends_poll_task() {
    let (metronome, clock) = Metronome::new_test();
    metronome.start().await.unwrap();
    let weak = Arc::downgrade(&metronome.inner);
    drop(metronome);
    assert!(weak.upgrade().is_none());

    clock.set_time(10.0);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(clock.scheduled_frequencies().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_arms_poll_task_when_stale_pass_holds_lock() {
    let (metronome, clock) = Metronome::new_test();

    // A pass from before the last stop is still running its observers.
    let stale_pass = metronome.inner.pass_lock.lock().unwrap();
    metronome.start().await.unwrap();
    assert!(metronome.is_playing());
    assert!(
        metronome.has_poll_task_for_test(),
        "A busy first pass must still leave a poll task behind"
    );
    assert!(clock.scheduled_frequencies().is_empty());

    clock.set_time(2.0);
    drop(stale_pass);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let times: Vec<f64> = clock.scheduled_frequencies().iter().map(|f| f.0).collect();
    assert!(times.len() >= 4, "Poll task caught up on every due beat: {:?}", times);
    assert_eq!(times[0], 0.0);
    metronome.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_while_old_pass_blocks_in_observer() {
    let (metronome, clock) = Metronome::new_test();
    let metronome = Arc::new(metronome);
    metronome.on_tick(|tick| {
        if tick.pulse == 2 {
            std::thread::sleep(Duration::from_millis(200));
        }
    });

    metronome.start().await.unwrap();
    // The poll task picks up pulse 2 and blocks inside the observer.
    clock.set_time(0.6);
    tokio::time::sleep(Duration::from_millis(60)).await;

    metronome.stop();
    metronome.start().await.unwrap();
    assert!(metronome.is_playing());

    tokio::time::sleep(Duration::from_millis(250)).await;
    let before = clock.scheduled_frequencies().len();
    clock.set_time(4.6);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        clock.scheduled_frequencies().len() > before,
        "Restarted transport keeps ticking"
    );
    metronome.stop();
}

#[tokio::test]
async fn test_dispose_during_pending_start_cancels_it() {
    let manual = Arc::new(ManualClock::new());
    let (open_gate, gated) = GatedClock::new(manual.clone());
    let metronome = Arc::new(Metronome::with_clock(Arc::new(gated)));

    let starting = tokio::spawn({
        let metronome = Arc::clone(&metronome);
        async move { metronome.start().await }
    });
    tokio::task::yield_now().await;

    metronome.dispose();
    let _ = open_gate.send(());
    let result = starting.await.unwrap();

    assert_eq!(result, Err(ClockError::Closed));
    assert!(!metronome.is_playing());
    assert!(manual.scheduled_frequencies().is_empty());
    assert!(manual.is_closed(), "Clock acquired late is released again");
}

#[tokio::test]
async fn test_stop_during_pending_start_cancels_it() {
    let manual = Arc::new(ManualClock::new());
    let (open_gate, gated) = GatedClock::new(manual.clone());
    let metronome = Arc::new(Metronome::with_clock(Arc::new(gated)));

    let starting = tokio::spawn({
        let metronome = Arc::clone(&metronome);
        async move { metronome.start().await }
    });
    tokio::task::yield_now().await;

    metronome.stop();
    let _ = open_gate.send(());
    assert_eq!(starting.await.unwrap(), Ok(()));

    assert!(!metronome.is_playing());
    assert_eq!(metronome.generation_for_test(), 0);
    assert!(manual.scheduled_frequencies().is_empty());

    // The next start goes through normally.
    metronome.start().await.unwrap();
    assert!(metronome.is_playing());
}
