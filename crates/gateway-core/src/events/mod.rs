//! In-process event bus for circuit breaker lifecycle notifications.
//!
//! Generalizes the single hardcoded broadcast channel the teacher's
//! `config::hot_reload::ConfigWatcher` used for config updates into a
//! topic-keyed registry any component can publish or subscribe to.

use std::sync::Arc;

use log::warn;
use tokio::sync::broadcast;

/// Payload published on `circuit:state-change`.
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub service_id: String,
    pub from: crate::breaker::CircuitState,
    pub to: crate::breaker::CircuitState,
}

/// Payload published on `circuit:failure`.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub service_id: String,
    pub timestamp_ms: i64,
    pub error_message: String,
    pub error_kind: String,
    pub state_at_failure: crate::breaker::CircuitState,
}

/// Payload published on `circuit:reset`.
#[derive(Debug, Clone)]
pub struct ResetEvent {
    pub service_id: String,
}

const CHANNEL_CAPACITY: usize = 256;

/// A named-topic, in-process publish/subscribe bus. Delivery is synchronous
/// to whatever subscribers currently hold a receiver; a topic with no
/// subscribers simply drops its events (broadcast semantics).
pub struct EventBus {
    state_change: broadcast::Sender<StateChangeEvent>,
    failure: broadcast::Sender<FailureEvent>,
    reset: broadcast::Sender<ResetEvent>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (state_change, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (failure, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (reset, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self { state_change, failure, reset })
    }

    pub fn publish_state_change(&self, event: StateChangeEvent) {
        if self.state_change.send(event).is_err() {
            // No subscribers currently listening; not an error condition.
        }
    }

    pub fn publish_failure(&self, event: FailureEvent) {
        let _ = self.failure.send(event);
    }

    pub fn publish_reset(&self, event: ResetEvent) {
        let _ = self.reset.send(event);
    }

    pub fn subscribe_state_change(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.state_change.subscribe()
    }

    pub fn subscribe_failure(&self) -> broadcast::Receiver<FailureEvent> {
        self.failure.subscribe()
    }

    pub fn subscribe_reset(&self) -> broadcast::Receiver<ResetEvent> {
        self.reset.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        let (state_change, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (failure, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (reset, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { state_change, failure, reset }
    }
}

/// Runs a subscriber loop that logs delivery errors instead of panicking;
/// mirrors the teacher's pattern of warning on a failed broadcast send
/// rather than letting a lagging subscriber take down the publisher.
pub async fn log_state_changes(bus: Arc<EventBus>) {
    let mut rx = bus.subscribe_state_change();
    loop {
        match rx.recv().await {
            Ok(event) => {
                log::info!(
                    "circuit '{}' transitioned {:?} -> {:?}",
                    event.service_id, event.from, event.to
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("event bus subscriber lagged, skipped {} state-change events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Mirrors every `circuit:state-change` event into the metrics registry's
/// `circuit_breaker_state` gauge, per SPEC_FULL.md §4.5 ("set on every state
/// transition"). Run as a background task alongside [`log_state_changes`].
pub async fn record_state_changes_to_metrics(bus: Arc<EventBus>, metrics: Arc<crate::metrics::MetricsRegistry>) {
    let mut rx = bus.subscribe_state_change();
    loop {
        match rx.recv().await {
            Ok(event) => metrics.set_breaker_state(&event.service_id, event.to).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("metrics event subscriber lagged, skipped {} state-change events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
