// Error types for the precise metronome
//
// This module defines the error type surfaced by the precise clock resource,
// providing structured error handling with stable numeric codes.

mod clock;

pub use clock::{log_clock_error, ClockError, ClockErrorCodes};

/// Error codes for structured error reporting
///
/// This trait provides a standard way to get error codes and messages
/// from custom error types, enabling consistent error handling across
/// the library, the CLI and any binding layer.
pub trait ErrorCode {
    /// Get the numeric error code
    fn code(&self) -> i32;

    /// Get the human-readable error message
    fn message(&self) -> String;
}
