//! Gateway Pipeline: the composition point. Matches a route, runs the
//! policy chain, consults the circuit breaker, forwards upstream, and
//! records telemetry.
//!
//! Grounded on the teacher's `services::http::RouteHandler` (route lookup
//! then forward shape) and `models::error::GatewayError` for the
//! all-errors-become-JSON convergence rule at the pipeline boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::config::ConfigManager;
use crate::error::GatewayError;
use crate::metrics::MetricsRegistry;
use crate::policy::PolicyEngine;
use crate::routing::RouteMatcher;

/// Fixed backoff applied between retry attempts against transport errors and
/// 5xx responses (SPEC_FULL.md §4.1 step 5: "short fixed backoff").
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Transport-agnostic request the pipeline operates on. The HTTP server
/// framing (out of scope) is responsible for building one of these from a
/// wire request.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub client_ip: String,
}

impl GatewayRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.to_string(),
            query: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
            client_ip: "127.0.0.1".to_string(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl GatewayResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: ResponseBody::Bytes(body.to_string().into_bytes()),
        }
    }
}

/// Per-request scratch space threaded through route matching, the policy
/// chain, and forwarding. Policies annotate it (e.g. the authenticated
/// principal); the pipeline reads path params and the assigned request id.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_ip: String,
    pub params: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub rate_limit_override: Option<(u64, u64)>,
}

impl RequestContext {
    pub fn new(client_ip: String) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            client_ip,
            params: HashMap::new(),
            annotations: HashMap::new(),
            rate_limit_override: None,
        }
    }
}

/// Collaborators the pipeline needs; constructed once at startup and shared
/// (`Arc`) across every request-handling task.
pub struct Pipeline {
    config: Arc<ConfigManager>,
    policy_engine: Arc<PolicyEngine>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<MetricsRegistry>,
    http_client: reqwest::Client,
}

impl Pipeline {
    pub fn new(
        config: Arc<ConfigManager>,
        policy_engine: Arc<PolicyEngine>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            policy_engine,
            breakers,
            metrics,
            http_client: reqwest::Client::new(),
        })
    }

    /// Handles one request end to end. Never returns an error to the
    /// caller — every failure mode is folded into a `GatewayResponse`.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        self.metrics.request_started();
        let start = Instant::now();
        let response = self.handle_inner(&request).await;
        let elapsed = start.elapsed();
        self.metrics.request_finished();

        let route_label = response.1.clone().unwrap_or_else(|| "unmatched".to_string());
        self.metrics
            .record_request(&route_label, &request.method, response.0.status, elapsed.as_secs_f64())
            .await;

        response.0
    }

    async fn handle_inner(&self, request: &GatewayRequest) -> (GatewayResponse, Option<String>) {
        let matcher = match self.build_matcher().await {
            Ok(m) => m,
            Err(e) => {
                error!("failed to build route matcher: {e}");
                return (GatewayError::Internal("routing unavailable".to_string()).to_response(), None);
            }
        };

        let route_match = match matcher.find_match(&request.path) {
            Ok(m) => m,
            Err(_) => {
                let err = GatewayError::RouteNotFound { path: request.path.clone(), reason: "no route matches this path".to_string() };
                return (err.to_response(), None);
            }
        };

        let route = route_match.route;
        if !route.methods.is_empty() && !route.methods.iter().any(|m| m.eq_ignore_ascii_case(&request.method)) {
            let err = GatewayError::RouteNotFound { path: request.path.clone(), reason: "method not allowed for this route".to_string() };
            return (err.to_response(), Some(route.name.clone()));
        }

        let mut context = RequestContext::new(request.client_ip.clone());
        for (k, v) in route_match.params {
            context.params.insert(k, v);
        }
        context.annotations.insert("route_name".to_string(), route.name.clone());

        if let Err(denial) = self.policy_engine.apply(&route.policies, request, &mut context).await {
            warn!(
                "policy '{}' denied request {} {}: {}",
                denial.policy_name, request.method, request.path, denial.reason
            );
            let err = GatewayError::PolicyDenied {
                policy_name: denial.policy_name,
                status_code: denial.status_code,
                error: denial.error,
                reason: denial.reason,
            };
            return (err.to_response(), Some(route.name.clone()));
        }

        let service_id = route.service_id().to_string();
        if !self.breakers.is_allowed(&service_id).await {
            let err = GatewayError::BreakerOpen { service_id: service_id.clone() };
            return (err.to_response(), Some(route.name.clone()));
        }

        let response = self.forward(&route, request, &context).await;
        (response, Some(route.name.clone()))
    }

    async fn build_matcher(&self) -> Result<RouteMatcher, String> {
        let routes = self.config.get_routes().await;
        RouteMatcher::new(routes).map_err(|e| e.to_string())
    }

    /// Forwards the request to `route.target`, retrying transport errors and
    /// 5xx responses up to `route.retries` times, and recording the outcome
    /// against the route's circuit breaker.
    ///
    /// Only the final attempt's outcome is recorded against the breaker and
    /// metrics (SPEC_FULL.md §4.1 step 5: "the final outcome drives the
    /// breaker record") — intermediate retried-away failures are tracked
    /// locally but never reach `record_failure`/`record_breaker_failure`.
    async fn forward(&self, route: &crate::routing::Route, request: &GatewayRequest, context: &RequestContext) -> GatewayResponse {
        let service_id = route.service_id().to_string();
        let target_url = format!("{}{}", route.target.trim_end_matches('/'), request.path);
        let timeout = Duration::from_millis(route.timeout_ms);
        let max_attempts = route.retries + 1;

        let mut last_failure: Option<(String, &'static str, GatewayError)> = None;

        for attempt in 0..max_attempts {
            let mut req = self
                .http_client
                .request(method_from_str(&request.method), &target_url)
                .timeout(timeout)
                .header("x-request-id", &context.request_id)
                .header("x-forwarded-for", &context.client_ip);
            for (name, value) in &request.headers {
                if name.eq_ignore_ascii_case("host") {
                    continue;
                }
                req = req.header(name, value);
            }
            if !request.body.is_empty() {
                req = req.body(request.body.clone());
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if status >= 500 {
                        last_failure = Some((
                            format!("status {status}"),
                            "upstream_5xx",
                            GatewayError::UpstreamTransport { reason: "upstream returned an error status".to_string() },
                        ));
                        if attempt + 1 < max_attempts {
                            tokio::time::sleep(RETRY_BACKOFF).await;
                            continue;
                        }
                        break;
                    }
                    self.breakers.record_success(&service_id).await;
                    self.metrics.record_breaker_success(&service_id).await;
                    let body = resp.bytes().await.unwrap_or_default().to_vec();
                    return GatewayResponse {
                        status,
                        headers: vec![("content-type".to_string(), "application/octet-stream".to_string())],
                        body: ResponseBody::Bytes(body),
                    };
                }
                Err(e) if e.is_timeout() => {
                    last_failure = Some((
                        e.to_string(),
                        "timeout",
                        GatewayError::UpstreamTimeout { target: target_url.clone(), timeout_ms: route.timeout_ms },
                    ));
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_failure = Some((
                        e.to_string(),
                        "transport",
                        GatewayError::UpstreamTransport { reason: "failed to reach upstream".to_string() },
                    ));
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                    break;
                }
            }
        }

        match last_failure {
            Some((error_message, error_kind, gateway_error)) => {
                self.breakers.record_failure(&service_id, &error_message, error_kind).await;
                self.metrics.record_breaker_failure(&service_id, error_kind).await;
                gateway_error.to_response()
            }
            None => GatewayError::Internal("unknown forwarding failure".to_string()).to_response(),
        }
    }
}

fn method_from_str(method: &str) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET)
}
