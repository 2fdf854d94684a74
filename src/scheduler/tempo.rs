//! Tempo, meter and accent state.
//!
//! Every bpm write is clamped into the configured bounds and the accent mask
//! always has exactly `meter` entries. The mask is a boxed slice replaced in
//! a single assignment whenever the meter changes, so an index computed from
//! the old meter can never observe a half-resized container.

use crate::config::TempoConfig;

/// Seconds per minute, used for the inter-beat interval.
const SECONDS_PER_MINUTE: f64 = 60.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TempoMeterState {
    bpm: f64,
    min_bpm: f64,
    max_bpm: f64,
    meter: u32,
    accents: Box<[bool]>,
}

impl TempoMeterState {
    pub fn new(config: &TempoConfig) -> Self {
        let meter = config.default_meter.max(1);
        let mut state = Self {
            bpm: config.default_bpm,
            min_bpm: config.min_bpm,
            max_bpm: config.max_bpm,
            meter,
            accents: default_accents(meter),
        };
        state.set_bpm(config.default_bpm);
        state
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn meter(&self) -> u32 {
        self.meter
    }

    pub fn accents(&self) -> &[bool] {
        &self.accents
    }

    /// Seconds between beat onsets at the current bpm.
    #[inline]
    pub fn interval(&self) -> f64 {
        SECONDS_PER_MINUTE / self.bpm
    }

    /// Clamp and store `bpm`, returning the stored value.
    ///
    /// NaN is treated as the lower bound.
    pub fn set_bpm(&mut self, bpm: f64) -> f64 {
        self.bpm = if bpm.is_nan() {
            self.min_bpm
        } else {
            bpm.clamp(self.min_bpm, self.max_bpm)
        };
        self.bpm
    }

    /// Replace the meter and re-derive the accent mask.
    ///
    /// Returns `false` (state untouched) when `meter` is zero. An explicit
    /// mask is fitted to the new meter: extra entries are dropped and
    /// missing ones are unaccented.
    pub fn set_meter(&mut self, meter: u32, accents: Option<&[bool]>) -> bool {
        if meter < 1 {
            return false;
        }
        let mask = match accents {
            Some(explicit) => fit_accents(explicit, meter),
            None => default_accents(meter),
        };
        self.meter = meter;
        self.accents = mask;
        true
    }

    /// Replace the mask, keeping the current meter.
    pub fn set_accents(&mut self, accents: &[bool]) {
        self.accents = fit_accents(accents, self.meter);
    }

    /// Flip the accent of beat `index` (0-based). Out of range is a no-op.
    pub fn toggle_accent(&mut self, index: usize) -> bool {
        match self.accents.get_mut(index) {
            Some(slot) => {
                *slot = !*slot;
                true
            }
            None => false,
        }
    }

    /// Set the accent of beat `index` (0-based). Out of range is a no-op.
    pub fn set_accent(&mut self, index: usize, accented: bool) -> bool {
        match self.accents.get_mut(index) {
            Some(slot) => {
                *slot = accented;
                true
            }
            None => false,
        }
    }

    /// Accent flag for a 1-based pulse; anything out of range is unaccented.
    #[inline]
    pub fn is_accented(&self, pulse: u32) -> bool {
        pulse
            .checked_sub(1)
            .and_then(|index| self.accents.get(index as usize))
            .copied()
            .unwrap_or(false)
    }
}

/// Beat 1 accented, the rest not.
pub fn default_accents(meter: u32) -> Box<[bool]> {
    (0..meter).map(|beat| beat == 0).collect()
}

fn fit_accents(accents: &[bool], meter: u32) -> Box<[bool]> {
    let meter = meter as usize;
    if accents.len() != meter {
        tracing::debug!(
            "[Tempo] Fitting accent mask of length {} to meter {}",
            accents.len(),
            meter
        );
    }
    accents
        .iter()
        .copied()
        .chain(std::iter::repeat(false))
        .take(meter)
        .collect()
}
