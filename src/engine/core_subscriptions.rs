use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};

use super::{Metronome, TelemetryEvent};
use crate::managers::Subscription;
use crate::scheduler::{MetronomeState, Tick};

impl Metronome {
    // ========================================================================
    // OBSERVER REGISTRATION
    // ========================================================================

    /// Register a callback invoked once per scheduled tick, in order.
    ///
    /// Fires when the tick is scheduled, ahead of when it sounds; use
    /// [`Tick::time`] to align visuals with the audible beat.
    pub fn on_tick<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Tick) + Send + Sync + 'static,
    {
        self.inner.tick_observers.subscribe(Arc::new(callback))
    }

    /// Register a callback invoked after every observable state change.
    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MetronomeState) + Send + Sync + 'static,
    {
        self.inner.state_observers.subscribe(Arc::new(callback))
    }

    pub fn tick_observer_count(&self) -> usize {
        self.inner.tick_observers.len()
    }

    pub fn state_observer_count(&self) -> usize {
        self.inner.state_observers.len()
    }

    // ========================================================================
    // STREAM SUBSCRIPTIONS
    // ========================================================================

    /// Forward ticks into a channel. Unsubscribe to close the receiver.
    pub fn subscribe_ticks(&self) -> (Subscription, mpsc::UnboundedReceiver<Tick>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.on_tick(move |tick| {
            let _ = tx.send(*tick);
        });
        (subscription, rx)
    }

    pub fn telemetry_receiver(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.inner.telemetry_tx.subscribe()
    }

    // ========================================================================
    // ASYNC STREAM ADAPTERS
    // ========================================================================

    pub fn tick_stream(&self) -> (Subscription, impl Stream<Item = Tick> + Unpin) {
        let (subscription, rx) = self.subscribe_ticks();
        (subscription, UnboundedReceiverStream::new(rx))
    }

    /// Telemetry as a stream; events missed by a lagging reader are skipped.
    pub fn telemetry_stream(&self) -> impl Stream<Item = TelemetryEvent> + Unpin {
        BroadcastStream::new(self.telemetry_receiver())
            .filter_map(|event| futures::future::ready(event.ok()))
    }
}
