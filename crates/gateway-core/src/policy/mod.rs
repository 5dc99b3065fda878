//! Policy Engine: a registry of named policies evaluated as an ordered
//! chain against a request and its context.
//!
//! Grounded on the teacher's middleware pattern (`middleware::auth::JwtAuth`,
//! `middleware::rate_limit::AdvancedRateLimit`) generalized from Actix
//! `Transform`/`Service` pairs into a plain trait the pipeline drives
//! directly, since the HTTP server framing itself is out of scope here.

pub mod authentication;
pub mod ip_filter;
pub mod rate_limit;

use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use tokio::sync::RwLock;

use crate::pipeline::{GatewayRequest, RequestContext};

/// Outcome of evaluating a single policy.
#[derive(Debug, Clone)]
pub enum PolicyOutcome {
    Allow,
    Deny { status_code: u16, error: String, reason: String },
}

/// A named predicate over a request. Implementations must not block the
/// executor thread; any I/O goes through `await`.
#[async_trait::async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &str;
    async fn evaluate(&self, request: &GatewayRequest, context: &mut RequestContext) -> Result<PolicyOutcome, String>;
}

/// Denial result returned by [`PolicyEngine::apply`], with the offending
/// policy's name attached (SPEC_FULL.md §4.2).
#[derive(Debug, Clone)]
pub struct PolicyDenial {
    pub policy_name: String,
    pub status_code: u16,
    pub error: String,
    pub reason: String,
}

pub struct PolicyEngine {
    policies: RwLock<HashMap<String, Arc<dyn Policy>>>,
}

impl PolicyEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { policies: RwLock::new(HashMap::new()) })
    }

    /// Registers a policy, replacing any existing registration under the
    /// same name.
    pub async fn register(&self, policy: Arc<dyn Policy>) {
        self.policies.write().await.insert(policy.name().to_string(), policy);
    }

    /// Evaluates `policy_names` in order against `request`/`context`. A name
    /// with no registered policy is logged and skipped, not treated as a
    /// denial. The first denial short-circuits the chain.
    pub async fn apply(
        &self,
        policy_names: &[String],
        request: &GatewayRequest,
        context: &mut RequestContext,
    ) -> Result<(), PolicyDenial> {
        let policies = self.policies.read().await;
        for name in policy_names {
            let Some(policy) = policies.get(name) else {
                warn!("policy chain references unregistered policy '{}'; skipping", name);
                continue;
            };
            match policy.evaluate(request, context).await {
                Ok(PolicyOutcome::Allow) => continue,
                Ok(PolicyOutcome::Deny { status_code, error, reason }) => {
                    return Err(PolicyDenial { policy_name: name.clone(), status_code, error, reason });
                }
                Err(internal_error) => {
                    return Err(PolicyDenial {
                        policy_name: name.clone(),
                        status_code: 500,
                        error: "Internal Server Error".to_string(),
                        reason: format!("error evaluating policy: {internal_error}"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestContext;

    struct AlwaysDeny;

    #[async_trait::async_trait]
    impl Policy for AlwaysDeny {
        fn name(&self) -> &str {
            "always-deny"
        }
        async fn evaluate(&self, _request: &GatewayRequest, _context: &mut RequestContext) -> Result<PolicyOutcome, String> {
            Ok(PolicyOutcome::Deny { status_code: 403, error: "Forbidden".to_string(), reason: "nope".to_string() })
        }
    }

    struct AlwaysAllow;

    #[async_trait::async_trait]
    impl Policy for AlwaysAllow {
        fn name(&self) -> &str {
            "always-allow"
        }
        async fn evaluate(&self, _request: &GatewayRequest, _context: &mut RequestContext) -> Result<PolicyOutcome, String> {
            Ok(PolicyOutcome::Allow)
        }
    }

    #[tokio::test]
    async fn first_denial_short_circuits() {
        let engine = PolicyEngine::new();
        engine.register(Arc::new(AlwaysAllow)).await;
        engine.register(Arc::new(AlwaysDeny)).await;
        let request = GatewayRequest::get("/x");
        let mut context = RequestContext::new("1.2.3.4".to_string());
        let result = engine
            .apply(&["always-allow".to_string(), "always-deny".to_string()], &request, &mut context)
            .await;
        let denial = result.unwrap_err();
        assert_eq!(denial.policy_name, "always-deny");
        assert_eq!(denial.status_code, 403);
    }

    #[tokio::test]
    async fn missing_policy_name_is_skipped_not_denied() {
        let engine = PolicyEngine::new();
        let request = GatewayRequest::get("/x");
        let mut context = RequestContext::new("1.2.3.4".to_string());
        let result = engine.apply(&["does-not-exist".to_string()], &request, &mut context).await;
        assert!(result.is_ok());
    }
}
