//! Engine module housing the metronome runtime.
//!
//! This module exposes the precise clock backends (`backend`) and the
//! `Metronome` handle (`core`) that drives the scheduler from a poll task.

pub mod backend;
pub mod core;

pub use backend::{AudioClock, CpalClock, ManualClock, RenderHandle, RenderRecord, RenderRequest};
pub use core::{Metronome, TelemetryEvent, TelemetryEventKind};
