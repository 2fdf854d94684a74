// Managers Module
//
// Focused manager classes kept out of the Metronome handle.
//
// - ObserverRegistry: ordered tick/state-change callback registries

pub mod observer_manager;

pub use observer_manager::{Callback, ObserverRegistry, Subscription};
