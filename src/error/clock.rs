// Clock error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Clock error code constants
///
/// Single source of truth for the numeric codes reported by [`ClockError`].
///
/// Error code range: 3001-3005
pub struct ClockErrorCodes {}

impl ClockErrorCodes {
    /// The clock resource refused to resume from a suspended state
    pub const RESUME_FAILED: i32 = 3001;

    /// No output device is available to drive the clock
    pub const DEVICE_UNAVAILABLE: i32 = 3002;

    /// Failed to open the output stream backing the clock
    pub const STREAM_OPEN_FAILED: i32 = 3003;

    /// The render queue towards the audio callback is full
    pub const QUEUE_FULL: i32 = 3004;

    /// The clock resource has been closed
    pub const CLOSED: i32 = 3005;
}

/// Log a clock error with structured context
///
/// This function logs clock errors with structured fields including:
/// - error_code: Numeric error code for programmatic handling
/// - component: The component where the error occurred
/// - message: Human-readable error message
/// - context: Additional contextual information
pub fn log_clock_error(err: &ClockError, context: &str) {
    error!(
        "Clock error in {}: code={}, component=AudioClock, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Precise clock errors
///
/// These errors cover acquisition and use of the precise clock resource.
/// Only acquisition/resume failures reach the caller of `start()`; the
/// remaining variants are reported by the render path and logged.
///
/// Error code range: 3001-3005
#[derive(Debug, Clone, PartialEq)]
pub enum ClockError {
    /// The clock could not be resumed
    ResumeFailed { reason: String },

    /// No output device available
    DeviceUnavailable { reason: String },

    /// Failed to open the backing stream
    StreamOpenFailed { reason: String },

    /// Render queue is full
    QueueFull,

    /// Clock resource already closed
    Closed,
}

impl ErrorCode for ClockError {
    fn code(&self) -> i32 {
        match self {
            ClockError::ResumeFailed { .. } => ClockErrorCodes::RESUME_FAILED,
            ClockError::DeviceUnavailable { .. } => ClockErrorCodes::DEVICE_UNAVAILABLE,
            ClockError::StreamOpenFailed { .. } => ClockErrorCodes::STREAM_OPEN_FAILED,
            ClockError::QueueFull => ClockErrorCodes::QUEUE_FULL,
            ClockError::Closed => ClockErrorCodes::CLOSED,
        }
    }

    fn message(&self) -> String {
        match self {
            ClockError::ResumeFailed { reason } => {
                format!("Failed to resume clock: {}", reason)
            }
            ClockError::DeviceUnavailable { reason } => {
                format!("Output device unavailable: {}", reason)
            }
            ClockError::StreamOpenFailed { reason } => {
                format!("Failed to open clock stream: {}", reason)
            }
            ClockError::QueueFull => "Render queue full, request dropped".to_string(),
            ClockError::Closed => "Clock resource closed. Call start() to reacquire.".to_string(),
        }
    }
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClockError::{:?} (code {}): {}",
            self,
            self.code(),
            self.message()
        )
    }
}

impl std::error::Error for ClockError {}
