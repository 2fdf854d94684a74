//! Backend abstractions for the precise clock.
//!
//! The scheduler never renders audio itself. It hands every tick to an
//! [`AudioClock`], a time-stamped event engine that fires each request at its
//! exact target time no matter how late the poll loop ran.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::ClockError;

/// Opaque handle to a render node owned by an [`AudioClock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderHandle(pub u64);

/// Payload of a single tick handed to the clock. Not retained afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub target_time: f64,
    pub is_accented: bool,
    pub frequency_hz: f64,
}

/// Trait implemented by precise clock engines.
///
/// Times are monotonic seconds on the clock's own timeline. Scheduling calls
/// must take effect at the given time, never at "now".
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;

    /// Make sure the clock is live, acquiring or resuming it if needed.
    ///
    /// The only asynchronous operation a clock exposes.
    fn resume_if_suspended(&self) -> BoxFuture<'_, Result<(), ClockError>>;

    fn create_tone_source(&self) -> Result<RenderHandle, ClockError>;
    fn create_envelope_control(&self) -> Result<RenderHandle, ClockError>;

    fn schedule_frequency(
        &self,
        tone: RenderHandle,
        frequency_hz: f64,
        at_time: f64,
    ) -> Result<(), ClockError>;

    fn schedule_envelope(
        &self,
        envelope: RenderHandle,
        at_time: f64,
        attack_time: f64,
        decay_time: f64,
    ) -> Result<(), ClockError>;

    fn release(&self, handle: RenderHandle);

    /// Release the clock resource entirely.
    fn close(&self);
}

mod cpal_clock;
pub use cpal_clock::CpalClock;

mod manual;
pub use manual::{ManualClock, RenderRecord};
