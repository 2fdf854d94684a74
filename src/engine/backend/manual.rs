use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};

use crate::error::ClockError;

use super::{AudioClock, RenderHandle};

/// Every call the scheduler made against a [`ManualClock`], in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RenderRecord {
    ToneCreated(RenderHandle),
    EnvelopeCreated(RenderHandle),
    Frequency {
        handle: RenderHandle,
        frequency_hz: f64,
        at_time: f64,
    },
    Envelope {
        handle: RenderHandle,
        at_time: f64,
        attack_time: f64,
        decay_time: f64,
    },
    Released(RenderHandle),
}

/// Deterministic clock driven by the caller.
///
/// Time only moves through [`ManualClock::set_time`] / [`ManualClock::advance`],
/// and every render request is recorded instead of played. Used by tests and
/// the `simulate` command.
pub struct ManualClock {
    now_bits: AtomicU64,
    next_handle: AtomicU64,
    records: Mutex<Vec<RenderRecord>>,
    live: Mutex<HashSet<RenderHandle>>,
    fail_resume: AtomicBool,
    closed: AtomicBool,
    resume_count: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(0.0)
    }

    pub fn starting_at(time: f64) -> Self {
        Self {
            now_bits: AtomicU64::new(time.to_bits()),
            next_handle: AtomicU64::new(1),
            records: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
            fail_resume: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            resume_count: AtomicU64::new(0),
        }
    }

    pub fn set_time(&self, time: f64) {
        self.now_bits.store(time.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) -> f64 {
        let time = self.now() + seconds;
        self.set_time(time);
        time
    }

    /// Make every following `resume_if_suspended` fail (or succeed again).
    pub fn set_fail_resume(&self, fail: bool) {
        self.fail_resume.store(fail, Ordering::SeqCst);
    }

    pub fn resume_count(&self) -> u64 {
        self.resume_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<RenderRecord> {
        lock(&self.records).clone()
    }

    /// `(at_time, frequency_hz)` of every scheduled frequency change.
    pub fn scheduled_frequencies(&self) -> Vec<(f64, f64)> {
        lock(&self.records)
            .iter()
            .filter_map(|record| match record {
                RenderRecord::Frequency {
                    frequency_hz,
                    at_time,
                    ..
                } => Some((*at_time, *frequency_hz)),
                _ => None,
            })
            .collect()
    }

    pub fn live_handle_count(&self) -> usize {
        lock(&self.live).len()
    }

    fn allocate(&self, record: fn(RenderHandle) -> RenderRecord) -> Result<RenderHandle, ClockError> {
        self.ensure_open()?;
        let handle = RenderHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        lock(&self.live).insert(handle);
        lock(&self.records).push(record(handle));
        Ok(handle)
    }

    fn ensure_open(&self) -> Result<(), ClockError> {
        if self.is_closed() {
            return Err(ClockError::Closed);
        }
        Ok(())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.now_bits.load(Ordering::SeqCst))
    }

    fn resume_if_suspended(&self) -> BoxFuture<'_, Result<(), ClockError>> {
        let result = if self.fail_resume.load(Ordering::SeqCst) {
            Err(ClockError::ResumeFailed {
                reason: "manual clock configured to fail".to_string(),
            })
        } else {
            self.closed.store(false, Ordering::SeqCst);
            self.resume_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        Box::pin(future::ready(result))
    }

    fn create_tone_source(&self) -> Result<RenderHandle, ClockError> {
        self.allocate(RenderRecord::ToneCreated)
    }

    fn create_envelope_control(&self) -> Result<RenderHandle, ClockError> {
        self.allocate(RenderRecord::EnvelopeCreated)
    }

    fn schedule_frequency(
        &self,
        tone: RenderHandle,
        frequency_hz: f64,
        at_time: f64,
    ) -> Result<(), ClockError> {
        self.ensure_open()?;
        lock(&self.records).push(RenderRecord::Frequency {
            handle: tone,
            frequency_hz,
            at_time,
        });
        Ok(())
    }

    fn schedule_envelope(
        &self,
        envelope: RenderHandle,
        at_time: f64,
        attack_time: f64,
        decay_time: f64,
    ) -> Result<(), ClockError> {
        self.ensure_open()?;
        lock(&self.records).push(RenderRecord::Envelope {
            handle: envelope,
            at_time,
            attack_time,
            decay_time,
        });
        Ok(())
    }

    fn release(&self, handle: RenderHandle) {
        if lock(&self.live).remove(&handle) {
            lock(&self.records).push(RenderRecord::Released(handle));
        }
    }

    fn close(&self) {
        let handles: Vec<RenderHandle> = lock(&self.live).drain().collect();
        let mut records = lock(&self.records);
        records.extend(handles.into_iter().map(RenderRecord::Released));
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}
