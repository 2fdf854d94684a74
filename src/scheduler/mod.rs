//! Scheduler - lookahead tick scheduling
//!
//! This module holds the synchronous core of the metronome:
//! - Tempo/meter/accent state ([`tempo`])
//! - Transport state machine with pause/resume phase continuity ([`transport`])
//! - The poll pass: every tick whose exact target time falls inside the
//!   schedule-ahead window is handed to the precise clock, each with its own
//!   timestamp, and the due time advances by the interval at the bpm that is
//!   live when the tick is committed
//!
//! Nothing here sleeps or spawns. The async [`crate::engine::Metronome`]
//! drives these steps from its poll task and dispatches observers between
//! them.

pub mod tempo;
pub mod transport;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{MetronomeConfig, SchedulingConfig, SoundConfig};
use crate::engine::backend::{AudioClock, RenderHandle, RenderRequest};
use crate::error::log_clock_error;

pub use tempo::TempoMeterState;
pub use transport::{TransportPhase, TransportState};

/// One scheduled beat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// 1-based beat within the measure
    pub pulse: u32,
    pub is_accented: bool,
    /// Exact clock time the beat sounds at
    pub time: f64,
}

/// Immutable snapshot handed to state-change observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetronomeState {
    pub is_playing: bool,
    pub pulse: u32,
    pub bpm: f64,
    pub meter: u32,
    pub accents: Vec<bool>,
    pub next_tick_time: f64,
    pub time_offset: f64,
}

/// Tone source and envelope pair, live from the first tick after a start
/// until the next stop.
#[derive(Debug, Clone, Copy)]
struct Voice {
    tone: RenderHandle,
    envelope: RenderHandle,
}

#[derive(Debug)]
pub struct Scheduler {
    tempo: TempoMeterState,
    transport: TransportState,
    scheduling: SchedulingConfig,
    sound: SoundConfig,
    voice: Option<Voice>,
}

impl Scheduler {
    pub fn new(config: &MetronomeConfig) -> Self {
        Self {
            tempo: TempoMeterState::new(&config.tempo),
            transport: TransportState::new(),
            scheduling: config.scheduling.clone(),
            sound: config.sound.clone(),
            voice: None,
        }
    }

    pub fn tempo(&self) -> &TempoMeterState {
        &self.tempo
    }

    pub fn tempo_mut(&mut self) -> &mut TempoMeterState {
        &mut self.tempo
    }

    pub fn transport(&self) -> &TransportState {
        &self.transport
    }

    pub fn is_playing(&self) -> bool {
        self.transport.is_playing()
    }

    pub fn has_voice(&self) -> bool {
        self.voice.is_some()
    }

    pub fn snapshot(&self) -> MetronomeState {
        MetronomeState {
            is_playing: self.transport.is_playing(),
            pulse: self.transport.pulse(),
            bpm: self.tempo.bpm(),
            meter: self.tempo.meter(),
            accents: self.tempo.accents().to_vec(),
            next_tick_time: self.transport.next_tick_time(),
            time_offset: self.transport.time_offset(),
        }
    }

    /// End of the schedule-ahead window for a poll at `now`.
    #[inline]
    pub fn horizon(&self, now: f64) -> f64 {
        now + self.scheduling.schedule_ahead_time
    }

    pub fn start_at(&mut self, now: f64) -> bool {
        self.transport.start_at(now)
    }

    /// Stop at `now`, capturing the phase and tearing down the voice.
    pub fn stop_at(&mut self, now: f64, clock: &dyn AudioClock) -> bool {
        if !self.transport.stop_at(now) {
            return false;
        }
        self.release_voice(clock);
        true
    }

    pub fn release_voice(&mut self, clock: &dyn AudioClock) {
        if let Some(voice) = self.voice.take() {
            clock.release(voice.tone);
            clock.release(voice.envelope);
        }
    }

    /// Schedule the next tick if it is due before `horizon`.
    ///
    /// Advances the pulse, resolves the accent and submits the render request
    /// stamped with the tick's exact time. The due time itself is left alone
    /// until [`Scheduler::commit`].
    pub fn next_due(&mut self, horizon: f64, clock: &dyn AudioClock) -> Option<Tick> {
        if !self.transport.is_playing() || self.transport.next_tick_time() >= horizon {
            return None;
        }

        let pulse = self.transport.advance_pulse(self.tempo.meter());
        let is_accented = self.tempo.is_accented(pulse);
        let time = self.transport.next_tick_time();

        self.render(
            RenderRequest {
                target_time: time,
                is_accented,
                frequency_hz: if is_accented {
                    self.sound.accent_frequency_hz
                } else {
                    self.sound.normal_frequency_hz
                },
            },
            clock,
        );

        Some(Tick {
            pulse,
            is_accented,
            time,
        })
    }

    /// Advance the due time by the interval at the current bpm.
    pub fn commit(&mut self, tick: &Tick) {
        let interval = self.tempo.interval();
        self.transport.commit_tick(tick.time, interval);
    }

    /// Run a whole poll pass at `now` without observers.
    #[cfg(test)]
    pub fn poll(&mut self, now: f64, clock: &dyn AudioClock) -> Vec<Tick> {
        let horizon = self.horizon(now);
        let mut ticks = Vec::new();
        while let Some(tick) = self.next_due(horizon, clock) {
            self.commit(&tick);
            ticks.push(tick);
        }
        ticks
    }

    /// Delay before the next poll.
    ///
    /// `lookahead − (now − last_tick_time)`, floored at the configured
    /// minimum poll interval, so a late pass re-checks sooner.
    pub fn rearm_delay(&self, now: f64) -> Duration {
        rearm_delay(
            self.scheduling.lookahead_ms,
            self.scheduling.min_poll_interval_ms,
            now,
            self.transport.last_tick_time(),
        )
    }

    fn render(&mut self, request: RenderRequest, clock: &dyn AudioClock) {
        let Some(voice) = self.ensure_voice(clock) else {
            return;
        };

        if let Err(err) =
            clock.schedule_frequency(voice.tone, request.frequency_hz, request.target_time)
        {
            log_clock_error(&err, "schedule_frequency");
        }
        if let Err(err) = clock.schedule_envelope(
            voice.envelope,
            request.target_time,
            self.sound.attack_time,
            self.sound.decay_time,
        ) {
            log_clock_error(&err, "schedule_envelope");
        }
    }

    fn ensure_voice(&mut self, clock: &dyn AudioClock) -> Option<Voice> {
        if let Some(voice) = self.voice {
            return Some(voice);
        }

        let tone = match clock.create_tone_source() {
            Ok(tone) => tone,
            Err(err) => {
                log_clock_error(&err, "create_tone_source");
                return None;
            }
        };
        let envelope = match clock.create_envelope_control() {
            Ok(envelope) => envelope,
            Err(err) => {
                log_clock_error(&err, "create_envelope_control");
                clock.release(tone);
                return None;
            }
        };

        let voice = Voice { tone, envelope };
        self.voice = Some(voice);
        Some(voice)
    }
}

/// `max(floor, lookahead − (now − last_tick_time) × 1000)` milliseconds.
pub fn rearm_delay(lookahead_ms: f64, min_poll_ms: f64, now: f64, last_tick_time: f64) -> Duration {
    let delay_ms = lookahead_ms - (now - last_tick_time) * 1000.0;
    let delay_ms = if delay_ms.is_nan() {
        lookahead_ms
    } else {
        delay_ms.max(min_poll_ms).max(0.0)
    };
    Duration::try_from_secs_f64(delay_ms / 1000.0)
        .unwrap_or_else(|_| Duration::from_secs_f64(lookahead_ms.max(0.0) / 1000.0))
}

#[cfg(test)]
mod tests;
