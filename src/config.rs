//! Configuration management for the metronome
//!
//! This module provides runtime configuration loading from JSON files.
//! Tempo bounds, the lookahead cadence and the beat rendering parameters
//! can be adjusted via the config file without recompilation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Complete metronome configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetronomeConfig {
    #[serde(default)]
    pub tempo: TempoConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub sound: SoundConfig,
}

/// Tempo and meter bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    /// Tempo used on construction
    pub default_bpm: f64,
    /// Lower clamp bound for every bpm write
    pub min_bpm: f64,
    /// Upper clamp bound for every bpm write
    pub max_bpm: f64,
    /// Beats per measure on construction
    pub default_meter: u32,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            default_bpm: 90.0,
            min_bpm: 30.0,
            max_bpm: 300.0,
            default_meter: 4,
        }
    }
}

/// Lookahead scheduling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Nominal cadence of the poll loop in milliseconds
    pub lookahead_ms: f64,
    /// Window (seconds) within which every due tick must already be submitted
    pub schedule_ahead_time: f64,
    /// Floor applied to the corrected re-arm delay
    pub min_poll_interval_ms: f64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            lookahead_ms: 25.0,
            schedule_ahead_time: 0.1,
            min_poll_interval_ms: 4.0,
        }
    }
}

/// Beat rendering parameters handed to the clock untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundConfig {
    pub accent_frequency_hz: f64,
    pub normal_frequency_hz: f64,
    /// Envelope attack in seconds
    pub attack_time: f64,
    /// Envelope decay in seconds
    pub decay_time: f64,
}

impl Default for SoundConfig {
    fn default() -> Self {
        Self {
            accent_frequency_hz: 1000.0,
            normal_frequency_hz: 800.0,
            attack_time: 0.001,
            decay_time: 0.05,
        }
    }
}

impl MetronomeConfig {
    /// Load configuration from JSON file
    ///
    /// Missing or malformed files fall back to the defaults with a warning.
    /// The result is always sanitized.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        let config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<Self>(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!(
                    "[Config] Failed to read config file {:?}: {}. Using defaults.",
                    path.as_ref(),
                    err
                );
                Self::default()
            }
        };
        config.sanitized()
    }

    /// Write configuration as pretty JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    /// Repair inconsistent values instead of rejecting them.
    ///
    /// Swaps inverted bpm bounds, forces a meter of at least 1, clamps the
    /// default bpm into range and keeps timing values non-negative.
    pub fn sanitized(mut self) -> Self {
        let tempo = &mut self.tempo;
        if tempo.min_bpm > tempo.max_bpm {
            std::mem::swap(&mut tempo.min_bpm, &mut tempo.max_bpm);
        }
        if !tempo.min_bpm.is_finite() || tempo.min_bpm <= 0.0 {
            tempo.min_bpm = TempoConfig::default().min_bpm.min(tempo.max_bpm);
        }
        if !tempo.max_bpm.is_finite() {
            tempo.max_bpm = TempoConfig::default().max_bpm.max(tempo.min_bpm);
        }
        tempo.default_bpm = if tempo.default_bpm.is_finite() {
            tempo.default_bpm.clamp(tempo.min_bpm, tempo.max_bpm)
        } else {
            tempo.min_bpm
        };
        tempo.default_meter = tempo.default_meter.max(1);

        let scheduling = &mut self.scheduling;
        scheduling.lookahead_ms = scheduling.lookahead_ms.max(0.0);
        scheduling.schedule_ahead_time = scheduling.schedule_ahead_time.max(0.0);
        scheduling.min_poll_interval_ms = scheduling
            .min_poll_interval_ms
            .clamp(0.0, scheduling.lookahead_ms);
        self
    }
}
