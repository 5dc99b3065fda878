//! Circuit breaker: per-upstream failure isolation state machine, with
//! optional distributed mirroring through the Shared Store Client.
//!
//! Grounded on the teacher's `services::circuit_breaker` module (same
//! atomic-counter-plus-async-lock architecture, same `CircuitState` values),
//! extended with: a third admission-gate field for the single-probe HALF_OPEN
//! semantics, distributed hydrate/mirror, event bus notifications, and a
//! registry keyed by `service_id` instead of one breaker per call site.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{Mutex, RwLock};

use crate::events::{EventBus, FailureEvent, ResetEvent, StateChangeEvent};
use crate::logging::LogThrottle;
use crate::store::{with_deadline, StoreClient, StoreError, StoreWrite};

/// The three states an upstream's breaker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Static configuration for one breaker, set at registration time.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u64,
    /// Amount subtracted from the failure counter on a CLOSED-state success
    /// (see SPEC_FULL.md §9(b) — kept as a decrement, not a consecutive-count).
    pub successes_before_reset: u64,
    pub reset_timeout_ms: u64,
    pub distributed: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            successes_before_reset: 1,
            reset_timeout_ms: 30_000,
            distributed: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub service_id: String,
    pub state: CircuitState,
    pub failures: u64,
    pub last_failure_time_ms: i64,
    pub next_attempt_time_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Mutable fields serialized behind a single lock so a threshold-crossing
/// failure or a timeout-elapsed admission check is a single atomic step.
struct Inner {
    failures: u64,
    last_failure_time_ms: i64,
    next_attempt_time_ms: i64,
}

/// A single upstream's breaker. Cheap to read from (`AtomicU8` mirror of
/// state for the admission fast path); mutations go through `inner`.
pub struct CircuitBreaker {
    service_id: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    inner: Mutex<Inner>,
    /// Single-slot gate: true once a probe has been admitted for the
    /// current OPEN->HALF_OPEN transition, reset on the next state change.
    probe_claimed: AtomicBool,
    events: Arc<EventBus>,
    store: Option<Arc<dyn StoreClient>>,
    mirror_failure_throttle: LogThrottle,
}

impl CircuitBreaker {
    pub fn new(service_id: String, config: CircuitBreakerConfig, events: Arc<EventBus>, store: Option<Arc<dyn StoreClient>>) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            inner: Mutex::new(Inner { failures: 0, last_failure_time_ms: 0, next_attempt_time_ms: 0 }),
            probe_claimed: AtomicBool::new(false),
            events,
            store,
            mirror_failure_throttle: LogThrottle::per_minute(),
        })
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Hydrates local state from the shared store (distributed mode only).
    /// Called once at startup/registration; best-effort — a missing or
    /// unreachable store leaves the breaker at its fresh CLOSED default.
    pub async fn hydrate(&self) {
        if !self.config.distributed {
            return;
        }
        let Some(store) = &self.store else { return };
        let prefix = format!("circuit:{}", self.service_id);
        let state = with_deadline("breaker.hydrate.state", store.get(&format!("{prefix}:state"))).await;
        let failures = with_deadline("breaker.hydrate.failures", store.get(&format!("{prefix}:failures"))).await;
        let last_failure = with_deadline("breaker.hydrate.lastFailure", store.get(&format!("{prefix}:lastFailure"))).await;
        let next_attempt = with_deadline("breaker.hydrate.nextAttempt", store.get(&format!("{prefix}:nextAttempt"))).await;

        if let (Ok(Some(state)), Ok(failures), Ok(last_failure), Ok(next_attempt)) =
            (state, failures, last_failure, next_attempt)
        {
            let state_value: u8 = state.parse().unwrap_or(0);
            let mut inner = self.inner.lock().await;
            inner.failures = failures.and_then(|v| v.parse().ok()).unwrap_or(0);
            inner.last_failure_time_ms = last_failure.and_then(|v| v.parse().ok()).unwrap_or(0);
            inner.next_attempt_time_ms = next_attempt.and_then(|v| v.parse().ok()).unwrap_or(0);
            self.state.store(state_value, Ordering::Release);
            info!("circuit '{}' hydrated from shared store: state={:?}", self.service_id, CircuitState::from(state_value));
        }
    }

    async fn mirror(&self, state: CircuitState, failures: u64, last_failure_time_ms: i64, next_attempt_time_ms: i64) {
        if !self.config.distributed {
            return;
        }
        let Some(store) = &self.store else { return };
        let prefix = format!("circuit:{}", self.service_id);
        let ttl = (self.config.reset_timeout_ms / 1000).saturating_mul(2).max(30 * 60);
        let writes = vec![
            StoreWrite::Set { key: format!("{prefix}:state"), value: (state as u8).to_string(), expire_seconds: Some(ttl) },
            StoreWrite::Set { key: format!("{prefix}:failures"), value: failures.to_string(), expire_seconds: Some(ttl) },
            StoreWrite::Set { key: format!("{prefix}:lastFailure"), value: last_failure_time_ms.to_string(), expire_seconds: Some(ttl) },
            StoreWrite::Set { key: format!("{prefix}:nextAttempt"), value: next_attempt_time_ms.to_string(), expire_seconds: Some(ttl) },
        ];
        if let Err(e) = with_deadline("breaker.mirror", store.atomic_write(writes)).await {
            if self.mirror_failure_throttle.allow() {
                warn!("failed to mirror circuit '{}' state to shared store: {}", self.service_id, e);
            }
        }
    }

    /// Is this breaker currently allowing traffic? A side-effecting check:
    /// when OPEN and the reset timeout has elapsed, this call itself performs
    /// the OPEN->HALF_OPEN transition and claims the single probe slot for
    /// whichever caller observes it first.
    pub async fn is_allowed(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let mut inner = self.inner.lock().await;
                // Re-check under the lock: a concurrent caller may have
                // already performed the OPEN->HALF_OPEN transition while we
                // were waiting for it. If so, don't redo the transition or
                // re-publish the event — just contend for the probe slot.
                if self.state.load(Ordering::Acquire) != CircuitState::Open as u8 {
                    drop(inner);
                    return !self.probe_claimed.swap(true, Ordering::AcqRel);
                }
                if now_ms() >= inner.next_attempt_time_ms && inner.next_attempt_time_ms > 0 {
                    let from = CircuitState::Open;
                    self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
                    self.probe_claimed.store(false, Ordering::Release);
                    info!("circuit '{}' transitioned OPEN -> HALF_OPEN, admitting probe", self.service_id);
                    self.events.publish_state_change(StateChangeEvent {
                        service_id: self.service_id.clone(),
                        from,
                        to: CircuitState::HalfOpen,
                    });
                    let failures = inner.failures;
                    let last_failure = inner.last_failure_time_ms;
                    drop(inner);
                    self.mirror(CircuitState::HalfOpen, failures, last_failure, 0).await;
                    // The caller that triggered the transition claims the probe slot.
                    !self.probe_claimed.swap(true, Ordering::AcqRel)
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                let mut inner = self.inner.lock().await;
                if inner.failures > 0 {
                    inner.failures = inner.failures.saturating_sub(self.config.successes_before_reset);
                    let failures = inner.failures;
                    drop(inner);
                    self.mirror(CircuitState::Closed, failures, 0, 0).await;
                }
            }
            CircuitState::HalfOpen => {
                let from = CircuitState::HalfOpen;
                {
                    let mut inner = self.inner.lock().await;
                    inner.failures = 0;
                    inner.last_failure_time_ms = 0;
                    inner.next_attempt_time_ms = 0;
                }
                self.state.store(CircuitState::Closed as u8, Ordering::Release);
                self.probe_claimed.store(false, Ordering::Release);
                info!("circuit '{}' closed after successful probe", self.service_id);
                self.events.publish_state_change(StateChangeEvent { service_id: self.service_id.clone(), from, to: CircuitState::Closed });
                self.mirror(CircuitState::Closed, 0, 0, 0).await;
            }
            CircuitState::Open => {
                // A success reported against an OPEN breaker is stale (the
                // probe already resolved one way or another); ignore it.
            }
        }
    }

    pub async fn record_failure(&self, error_message: &str, error_kind: &str) {
        let state_at_failure = self.state();
        let now = now_ms();

        self.events.publish_failure(FailureEvent {
            service_id: self.service_id.clone(),
            timestamp_ms: now,
            error_message: error_message.to_string(),
            error_kind: error_kind.to_string(),
            state_at_failure,
        });

        match state_at_failure {
            CircuitState::Closed => {
                let mut inner = self.inner.lock().await;
                inner.failures += 1;
                inner.last_failure_time_ms = now;
                if inner.failures >= self.config.failure_threshold {
                    inner.next_attempt_time_ms = now + self.config.reset_timeout_ms as i64;
                    let failures = inner.failures;
                    let next_attempt = inner.next_attempt_time_ms;
                    drop(inner);
                    self.state.store(CircuitState::Open as u8, Ordering::Release);
                    warn!("circuit '{}' opened after {} failures", self.service_id, failures);
                    self.events.publish_state_change(StateChangeEvent { service_id: self.service_id.clone(), from: CircuitState::Closed, to: CircuitState::Open });
                    self.mirror(CircuitState::Open, failures, now, next_attempt).await;
                } else {
                    let failures = inner.failures;
                    drop(inner);
                    self.mirror(CircuitState::Closed, failures, now, 0).await;
                }
            }
            CircuitState::HalfOpen => {
                let next_attempt = now + self.config.reset_timeout_ms as i64;
                {
                    let mut inner = self.inner.lock().await;
                    inner.last_failure_time_ms = now;
                    inner.next_attempt_time_ms = next_attempt;
                }
                self.state.store(CircuitState::Open as u8, Ordering::Release);
                self.probe_claimed.store(false, Ordering::Release);
                warn!("circuit '{}' probe failed, reopening", self.service_id);
                self.events.publish_state_change(StateChangeEvent { service_id: self.service_id.clone(), from: CircuitState::HalfOpen, to: CircuitState::Open });
                let failures = self.inner.lock().await.failures;
                self.mirror(CircuitState::Open, failures, now, next_attempt).await;
            }
            CircuitState::Open => {
                let mut inner = self.inner.lock().await;
                inner.last_failure_time_ms = now;
            }
        }
    }

    pub async fn reset(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.failures = 0;
            inner.last_failure_time_ms = 0;
            inner.next_attempt_time_ms = 0;
        }
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.probe_claimed.store(false, Ordering::Release);
        self.events.publish_reset(ResetEvent { service_id: self.service_id.clone() });
        self.mirror(CircuitState::Closed, 0, 0, 0).await;
    }

    pub async fn health(&self) -> HealthSnapshot {
        let inner = self.inner.lock().await;
        HealthSnapshot {
            service_id: self.service_id.clone(),
            state: self.state(),
            failures: inner.failures,
            last_failure_time_ms: inner.last_failure_time_ms,
            next_attempt_time_ms: inner.next_attempt_time_ms,
        }
    }
}

/// Owns every breaker, keyed by `service_id`. `register` is the only entry
/// point that mutates the map itself; everything else operates on an
/// `Arc<CircuitBreaker>` already looked up, so breakers for different
/// services never contend on a shared lock.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: Arc<EventBus>,
    store: Option<Arc<dyn StoreClient>>,
    /// Service ids for which the "no breaker registered" warning has already
    /// fired once (SPEC_FULL.md §4.1 edge cases: "log once").
    warned_unregistered: RwLock<std::collections::HashSet<String>>,
}

impl CircuitBreakerRegistry {
    pub fn new(events: Arc<EventBus>, store: Option<Arc<dyn StoreClient>>) -> Arc<Self> {
        Arc::new(Self {
            breakers: RwLock::new(HashMap::new()),
            events,
            store,
            warned_unregistered: RwLock::new(std::collections::HashSet::new()),
        })
    }

    pub async fn register(&self, service_id: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = CircuitBreaker::new(service_id.to_string(), config, self.events.clone(), self.store.clone());
        breaker.hydrate().await;
        self.breakers.write().await.insert(service_id.to_string(), breaker.clone());
        breaker
    }

    pub async fn get(&self, service_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(service_id).cloned()
    }

    /// Admission check for a service with no registered breaker: always
    /// allowed, logged once per service id (SPEC_FULL.md §4.1 edge cases).
    pub async fn is_allowed(&self, service_id: &str) -> bool {
        match self.get(service_id).await {
            Some(breaker) => breaker.is_allowed().await,
            None => {
                let mut warned = self.warned_unregistered.write().await;
                if warned.insert(service_id.to_string()) {
                    warn!("no circuit breaker registered for '{}', treating as always-allowed", service_id);
                }
                true
            }
        }
    }

    pub async fn record_success(&self, service_id: &str) {
        if let Some(breaker) = self.get(service_id).await {
            breaker.record_success().await;
        }
    }

    pub async fn record_failure(&self, service_id: &str, error_message: &str, error_kind: &str) {
        if let Some(breaker) = self.get(service_id).await {
            breaker.record_failure(error_message, error_kind).await;
        }
    }

    pub async fn reset(&self, service_id: &str) {
        if let Some(breaker) = self.get(service_id).await {
            breaker.reset().await;
        }
    }

    pub async fn health(&self) -> Vec<HealthSnapshot> {
        let breakers = self.breakers.read().await;
        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            snapshots.push(breaker.health().await);
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStoreClient;

    fn config(threshold: u64, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold: threshold, successes_before_reset: 1, reset_timeout_ms: reset_ms, distributed: false }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let events = EventBus::new();
        let breaker = CircuitBreaker::new("svc".into(), config(3, 1000), events, None);
        for _ in 0..2 {
            assert!(breaker.is_allowed().await);
            breaker.record_failure("boom", "upstream_5xx").await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure("boom", "upstream_5xx").await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_allowed().await);
    }

    #[tokio::test]
    async fn half_open_admits_single_probe_then_closes_on_success() {
        let events = EventBus::new();
        let breaker = CircuitBreaker::new("svc".into(), config(1, 10), events, None);
        breaker.record_failure("boom", "upstream_5xx").await;
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(breaker.is_allowed().await);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let events = EventBus::new();
        let breaker = CircuitBreaker::new("svc".into(), config(1, 10), events, None);
        breaker.record_failure("boom", "upstream_5xx").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(breaker.is_allowed().await);
        breaker.record_failure("still broken", "upstream_5xx").await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn registry_missing_breaker_allows_by_default() {
        let events = EventBus::new();
        let registry = CircuitBreakerRegistry::new(events, None);
        assert!(registry.is_allowed("unknown-service").await);
    }

    #[tokio::test]
    async fn distributed_breaker_hydrates_open_state() {
        let events = EventBus::new();
        let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
        store.set("circuit:svc:state", "1", None).await.unwrap();
        store.set("circuit:svc:nextAttempt", &(now_ms() + 5000).to_string(), None).await.unwrap();
        store.set("circuit:svc:failures", "3", None).await.unwrap();
        store.set("circuit:svc:lastFailure", &now_ms().to_string(), None).await.unwrap();

        let config = CircuitBreakerConfig { distributed: true, ..config(3, 5000) };
        let breaker = CircuitBreaker::new("svc".into(), config, events, Some(store));
        breaker.hydrate().await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.is_allowed().await);
    }
}
