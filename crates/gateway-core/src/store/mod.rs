//! Shared Store Client — thin adapter over an external Redis-compatible
//! key/value store used by the rate limiter and the distributed circuit
//! breaker.
//!
//! Every call from the hot path is wrapped in a bounded deadline; a deadline
//! breach is treated identically to a connection failure so callers can
//! apply their own fail-open/fail-local policy (see [`StoreError`]).

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use thiserror::Error;
use tokio::time::timeout;

use crate::logging::LogThrottle;

mod redis_client;
mod memory;

pub use memory::InMemoryStoreClient;
pub use redis_client::{RedisSettings, RedisStoreClient};

/// Default per-call deadline for shared-store round trips on the hot path.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store connection error: {0}")]
    Connection(String),
    #[error("shared store protocol/serialization error: {0}")]
    Protocol(String),
    #[error("shared store call exceeded its deadline")]
    DeadlineExceeded,
}

/// A single write inside an atomic multi-op transaction.
#[derive(Debug, Clone)]
pub enum StoreWrite {
    Set { key: String, value: String, expire_seconds: Option<u64> },
    Delete { key: String },
}

/// Adapter over the external key/value store. Implementations must be cheap
/// to clone (an `Arc`-backed connection manager) since the pipeline and
/// breaker registry hold one per process.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, expire_seconds: Option<u64>) -> Result<(), StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;
    async fn expire(&self, key: &str, seconds: u64) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Apply every write atomically (a single pipelined transaction).
    async fn atomic_write(&self, writes: Vec<StoreWrite>) -> Result<(), StoreError>;
}

/// One [`LogThrottle`] per distinct call-site label, so a sustained deadline
/// breach on `rate_limit.incr` doesn't suppress a separate one on
/// `breaker.mirror` (SPEC_FULL.md §5: at most once per minute, per reason).
fn deadline_throttles() -> &'static Mutex<HashMap<String, LogThrottle>> {
    static THROTTLES: OnceLock<Mutex<HashMap<String, LogThrottle>>> = OnceLock::new();
    THROTTLES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Wraps any [`StoreClient`] call with [`DEFAULT_CALL_DEADLINE`], converting
/// a timeout into [`StoreError::DeadlineExceeded`] and logging at most the
/// caller's responsibility (callers decide fail-open vs fail-local).
pub async fn with_deadline<T, F>(label: &str, fut: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match timeout(DEFAULT_CALL_DEADLINE, fut).await {
        Ok(result) => result,
        Err(_) => {
            let should_log = {
                let mut throttles = deadline_throttles().lock().unwrap();
                throttles.entry(label.to_string()).or_insert_with(LogThrottle::per_minute).allow()
            };
            if should_log {
                warn!("shared store call '{}' exceeded {:?} deadline", label, DEFAULT_CALL_DEADLINE);
            }
            Err(StoreError::DeadlineExceeded)
        }
    }
}
