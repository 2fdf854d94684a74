//! Transport state machine: Stopped / Running with phase continuity.
//!
//! Stopping records how far away the next beat was (`time_offset`); the
//! following start places the next beat that far from the new "now", so a
//! resume keeps its phase instead of snapping to beat 1 immediately.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportPhase {
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportState {
    phase: TransportPhase,
    /// 1-based beat most recently sounded, 0 until the first tick.
    pulse: u32,
    /// Exact clock time at which the next beat is due.
    next_tick_time: f64,
    /// Remaining phase captured on stop, consumed on start.
    time_offset: f64,
    /// Target time of the most recently scheduled tick.
    last_tick_time: f64,
}

impl TransportState {
    pub fn new() -> Self {
        Self {
            phase: TransportPhase::Stopped,
            pulse: 0,
            next_tick_time: 0.0,
            time_offset: 0.0,
            last_tick_time: 0.0,
        }
    }

    pub fn phase(&self) -> TransportPhase {
        self.phase
    }

    pub fn is_playing(&self) -> bool {
        self.phase == TransportPhase::Running
    }

    pub fn pulse(&self) -> u32 {
        self.pulse
    }

    pub fn next_tick_time(&self) -> f64 {
        self.next_tick_time
    }

    pub fn time_offset(&self) -> f64 {
        self.time_offset
    }

    pub fn last_tick_time(&self) -> f64 {
        self.last_tick_time
    }

    /// Stopped -> Running at clock time `now`. Returns `false` if already running.
    pub fn start_at(&mut self, now: f64) -> bool {
        if self.is_playing() {
            return false;
        }
        self.phase = TransportPhase::Running;
        self.pulse = 0;
        self.next_tick_time = now + self.time_offset;
        self.last_tick_time = now;
        true
    }

    /// Running -> Stopped at clock time `now`. Returns `false` if already stopped.
    pub fn stop_at(&mut self, now: f64) -> bool {
        if !self.is_playing() {
            return false;
        }
        self.time_offset = self.next_tick_time - now;
        self.phase = TransportPhase::Stopped;
        self.pulse = 0;
        true
    }

    /// Advance to the next beat of a `meter`-beat measure and return it.
    ///
    /// A pulse left beyond a freshly shrunk meter wraps to 1.
    pub fn advance_pulse(&mut self, meter: u32) -> u32 {
        self.pulse = if self.pulse >= meter { 1 } else { self.pulse + 1 };
        self.pulse
    }

    /// Move the due time one interval forward after scheduling `target_time`.
    pub fn commit_tick(&mut self, target_time: f64, interval: f64) {
        self.next_tick_time += interval;
        self.last_tick_time = target_time;
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}
