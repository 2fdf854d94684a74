// Precise Metronome - Rust Scheduling Core
// Lookahead tick scheduling against a sample-accurate audio clock

// Module declarations
pub mod config;
pub mod engine;
pub mod error;
pub mod managers;
pub mod scheduler;

// Re-exports for convenience
pub use config::MetronomeConfig;
pub use engine::{AudioClock, CpalClock, ManualClock, Metronome, TelemetryEvent, TelemetryEventKind};
pub use error::{ClockError, ErrorCode};
pub use managers::Subscription;
pub use scheduler::{MetronomeState, Tick};
