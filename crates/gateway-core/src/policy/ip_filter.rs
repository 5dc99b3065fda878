//! IP filtering policy: allowlist takes precedence, then denylist.
//!
//! New module — the teacher has no direct equivalent, so this is grounded
//! on the environment-variable surface SPEC_FULL.md §6 names
//! (`IP_BLACKLIST`, `IP_WHITELIST`) and follows the same `Policy` shape as
//! [`super::authentication::AuthenticationPolicy`].

use std::collections::HashSet;

use super::{Policy, PolicyOutcome};
use crate::pipeline::{GatewayRequest, RequestContext};

#[derive(Clone)]
pub struct IpFilterConfig {
    pub allowlist: HashSet<String>,
    pub denylist: HashSet<String>,
}

impl IpFilterConfig {
    pub fn from_env() -> Self {
        Self {
            allowlist: parse_list(std::env::var("IP_WHITELIST").ok()),
            denylist: parse_list(std::env::var("IP_BLACKLIST").ok()),
        }
    }
}

fn parse_list(raw: Option<String>) -> HashSet<String> {
    raw.map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

pub struct IpFilterPolicy {
    config: IpFilterConfig,
}

impl IpFilterPolicy {
    pub fn new(config: IpFilterConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Policy for IpFilterPolicy {
    fn name(&self) -> &str {
        "ip-filtering"
    }

    async fn evaluate(&self, _request: &GatewayRequest, context: &mut RequestContext) -> Result<PolicyOutcome, String> {
        if !self.config.allowlist.is_empty() && !self.config.allowlist.contains(&context.client_ip) {
            return Ok(PolicyOutcome::Deny {
                status_code: 403,
                error: "Forbidden".to_string(),
                reason: "client IP is not on the allowlist".to_string(),
            });
        }

        if self.config.denylist.contains(&context.client_ip) {
            return Ok(PolicyOutcome::Deny {
                status_code: 403,
                error: "Forbidden".to_string(),
                reason: "client IP is on the denylist".to_string(),
            });
        }

        Ok(PolicyOutcome::Allow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denylisted_ip_is_denied() {
        let policy = IpFilterPolicy::new(IpFilterConfig { allowlist: HashSet::new(), denylist: ["6.6.6.6".to_string()].into() });
        let request = GatewayRequest::get("/x");
        let mut ctx = RequestContext::new("6.6.6.6".to_string());
        assert!(matches!(policy.evaluate(&request, &mut ctx).await.unwrap(), PolicyOutcome::Deny { status_code: 403, .. }));
    }

    #[tokio::test]
    async fn allowlist_present_excludes_unlisted_ips() {
        let policy = IpFilterPolicy::new(IpFilterConfig { allowlist: ["1.2.3.4".to_string()].into(), denylist: HashSet::new() });
        let request = GatewayRequest::get("/x");
        let mut ctx = RequestContext::new("9.9.9.9".to_string());
        assert!(matches!(policy.evaluate(&request, &mut ctx).await.unwrap(), PolicyOutcome::Deny { status_code: 403, .. }));
    }

    #[tokio::test]
    async fn allowlisted_ip_is_allowed() {
        let policy = IpFilterPolicy::new(IpFilterConfig { allowlist: ["1.2.3.4".to_string()].into(), denylist: HashSet::new() });
        let request = GatewayRequest::get("/x");
        let mut ctx = RequestContext::new("1.2.3.4".to_string());
        assert!(matches!(policy.evaluate(&request, &mut ctx).await.unwrap(), PolicyOutcome::Allow));
    }
}
