//! Rate limiting policy: fixed tumbling window backed by the Shared Store
//! Client.
//!
//! Grounded on the teacher's `middleware::rate_limit` shape (strategy enum,
//! configurable window/limit), but the counting backend is swapped from the
//! teacher's in-memory `RateLimitStore` to the external store per
//! SPEC_FULL.md §4.2 — only the fixed-window strategy is kept, since sliding
//! window and token bucket have no counterpart in this spec.

use std::sync::Arc;

use log::error;

use super::{Policy, PolicyOutcome};
use crate::logging::LogThrottle;
use crate::pipeline::{GatewayRequest, RequestContext};
use crate::store::{with_deadline, StoreClient};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub default_limit: u64,
    pub default_window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: std::env::var("DEFAULT_RATE_LIMIT").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
            default_window_seconds: std::env::var("DEFAULT_RATE_WINDOW").ok().and_then(|v| v.parse().ok()).unwrap_or(60),
        }
    }
}

/// A single registered instance serves every route: the policy engine keys
/// registrations by name, so the per-request route identity travels through
/// `context.annotations["route_name"]` (set by the pipeline before the
/// policy chain runs) rather than being baked into the policy itself.
pub struct RateLimitPolicy {
    config: RateLimitConfig,
    store: Arc<dyn StoreClient>,
    fail_open_throttle: LogThrottle,
    expire_failure_throttle: LogThrottle,
}

impl RateLimitPolicy {
    pub fn new(config: RateLimitConfig, store: Arc<dyn StoreClient>) -> Self {
        Self {
            config,
            store,
            fail_open_throttle: LogThrottle::per_minute(),
            expire_failure_throttle: LogThrottle::per_minute(),
        }
    }
}

#[async_trait::async_trait]
impl Policy for RateLimitPolicy {
    fn name(&self) -> &str {
        "rate-limiting"
    }

    async fn evaluate(&self, _request: &GatewayRequest, context: &mut RequestContext) -> Result<PolicyOutcome, String> {
        let (limit, window_seconds) = context
            .rate_limit_override
            .unwrap_or((self.config.default_limit, self.config.default_window_seconds));

        let route_name = context.annotations.get("route_name").map(String::as_str).unwrap_or("unknown");
        let key = format!("ratelimit:{}:{}", route_name, context.client_ip);

        let current = match with_deadline("rate_limit.incr", self.store.incr(&key)).await {
            Ok(count) => count,
            Err(e) => {
                // Fail-open: availability over strict enforcement (SPEC_FULL.md §5).
                if self.fail_open_throttle.allow() {
                    error!("shared store unavailable for rate limiting, failing open: {e}");
                }
                return Ok(PolicyOutcome::Allow);
            }
        };

        if current == 1 {
            if let Err(e) = with_deadline("rate_limit.expire", self.store.expire(&key, window_seconds)).await {
                if self.expire_failure_throttle.allow() {
                    error!("failed to set rate limit window expiry: {e}");
                }
            }
        }

        if current as u64 > limit {
            return Ok(PolicyOutcome::Deny {
                status_code: 429,
                error: "Too Many Requests".to_string(),
                reason: format!("rate limit of {limit} requests per {window_seconds}s exceeded"),
            });
        }

        Ok(PolicyOutcome::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStoreClient;

    fn ctx_for_route(client_ip: &str, route_name: &str) -> RequestContext {
        let mut ctx = RequestContext::new(client_ip.to_string());
        ctx.annotations.insert("route_name".to_string(), route_name.to_string());
        ctx
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
        let policy = RateLimitPolicy::new(RateLimitConfig { default_limit: 2, default_window_seconds: 60 }, store);
        let request = GatewayRequest::get("/a/1");
        let mut ctx = ctx_for_route("1.2.3.4", "svc");

        assert!(matches!(policy.evaluate(&request, &mut ctx).await.unwrap(), PolicyOutcome::Allow));
        assert!(matches!(policy.evaluate(&request, &mut ctx).await.unwrap(), PolicyOutcome::Allow));
        assert!(matches!(policy.evaluate(&request, &mut ctx).await.unwrap(), PolicyOutcome::Deny { status_code: 429, .. }));
    }

    #[tokio::test]
    async fn different_ips_have_independent_counters() {
        let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
        let policy = RateLimitPolicy::new(RateLimitConfig { default_limit: 1, default_window_seconds: 60 }, store);
        let request = GatewayRequest::get("/a/1");

        let mut ctx_a = ctx_for_route("1.1.1.1", "svc");
        let mut ctx_b = ctx_for_route("2.2.2.2", "svc");
        assert!(matches!(policy.evaluate(&request, &mut ctx_a).await.unwrap(), PolicyOutcome::Allow));
        assert!(matches!(policy.evaluate(&request, &mut ctx_b).await.unwrap(), PolicyOutcome::Allow));
    }

    #[tokio::test]
    async fn different_routes_have_independent_counters_for_same_ip() {
        let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
        let policy = RateLimitPolicy::new(RateLimitConfig { default_limit: 1, default_window_seconds: 60 }, store);
        let request = GatewayRequest::get("/a/1");

        let mut ctx_svc_a = ctx_for_route("1.2.3.4", "svc-a");
        let mut ctx_svc_b = ctx_for_route("1.2.3.4", "svc-b");
        assert!(matches!(policy.evaluate(&request, &mut ctx_svc_a).await.unwrap(), PolicyOutcome::Allow));
        assert!(matches!(policy.evaluate(&request, &mut ctx_svc_b).await.unwrap(), PolicyOutcome::Allow));
    }
}
