//! Route model and route matcher.
//!
//! Grounded on the teacher's `models::router::Router` (validation shape) and
//! `utils::route_matcher::RouteMatcher` (static hash lookup + compiled
//! dynamic patterns), adapted to the spec's route shape (single `target`
//! instead of backend lists — load balancing is out of scope) and the
//! `:param` pattern token instead of `{param}`.

use std::sync::Arc;

use ahash::HashMap as AHashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::CircuitBreakerConfig;

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("route pattern '{pattern}' is invalid: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("route target '{target}' is not a valid absolute URL")]
    InvalidTarget { target: String },
    #[error("duplicate route name: {0}")]
    DuplicateName(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum RouteMatchError {
    #[error("regex compilation failed: {0}")]
    RegexError(String),
    #[error("no matching route found for path: {path}")]
    NoMatch { path: String },
    #[error("route matched but method {method} is not allowed")]
    MethodNotAllowed { method: String },
}

/// A single route definition (see SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub name: String,
    pub pattern: String,
    pub target: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub circuit_breaker: Option<RouteCircuitBreakerConfig>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// JSON-facing mirror of [`CircuitBreakerConfig`] (serde-friendly field
/// names); converted into the runtime config at registration time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteCircuitBreakerConfig {
    pub failure_threshold: u64,
    #[serde(default = "default_successes_before_reset")]
    pub successes_before_reset: u64,
    pub reset_timeout_ms: u64,
    #[serde(default)]
    pub distributed: bool,
}

fn default_successes_before_reset() -> u64 {
    1
}

impl From<RouteCircuitBreakerConfig> for CircuitBreakerConfig {
    fn from(r: RouteCircuitBreakerConfig) -> Self {
        CircuitBreakerConfig {
            failure_threshold: r.failure_threshold,
            successes_before_reset: r.successes_before_reset,
            reset_timeout_ms: r.reset_timeout_ms,
            distributed: r.distributed,
        }
    }
}

impl Route {
    /// `service_id` used to key the circuit breaker registry: equal to the
    /// route name (SPEC_FULL.md §4.3).
    pub fn service_id(&self) -> &str {
        &self.name
    }

    pub fn validate(&self) -> Result<(), RouteError> {
        if self.name.trim().is_empty() {
            return Err(RouteError::InvalidPattern { pattern: self.pattern.clone(), reason: "route name must not be empty".to_string() });
        }
        if !self.pattern.starts_with('/') {
            return Err(RouteError::InvalidPattern { pattern: self.pattern.clone(), reason: "pattern must start with '/'".to_string() });
        }
        for segment in self.pattern.split('/') {
            if let Some(param) = segment.strip_prefix(':') {
                if param.is_empty() || !param.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return Err(RouteError::InvalidPattern { pattern: self.pattern.clone(), reason: format!("invalid parameter name ':{}'", param) });
                }
            }
        }
        if !(self.target.starts_with("http://") || self.target.starts_with("https://")) {
            return Err(RouteError::InvalidTarget { target: self.target.clone() });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    route: Route,
    regex: Arc<Regex>,
    param_names: Vec<String>,
    literal_prefix_len: usize,
}

/// A route lookup result: the matched route plus extracted path parameters.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Route,
    pub params: Vec<(String, String)>,
}

/// Static routes are kept in a hash map for O(1) lookup; dynamic routes
/// (those containing a `:param` segment) are compiled to regex and ordered
/// by longest-literal-prefix-first, per SPEC_FULL.md §4.1 step 2.
pub struct RouteMatcher {
    static_routes: AHashMap<String, Route>,
    dynamic_routes: Vec<CompiledRoute>,
}

impl RouteMatcher {
    pub fn new(routes: Vec<Route>) -> Result<Self, RouteMatchError> {
        let mut static_routes = AHashMap::default();
        let mut dynamic_routes = Vec::new();

        for route in routes {
            if route.pattern.contains(':') {
                dynamic_routes.push(Self::compile(route)?);
            } else {
                static_routes.insert(route.pattern.clone(), route);
            }
        }

        dynamic_routes.sort_by(|a, b| b.literal_prefix_len.cmp(&a.literal_prefix_len));

        Ok(Self { static_routes, dynamic_routes })
    }

    fn compile(route: Route) -> Result<CompiledRoute, RouteMatchError> {
        let (regex_source, param_names, literal_prefix_len) = Self::pattern_to_regex(&route.pattern);
        let regex = Regex::new(&regex_source).map_err(|e| RouteMatchError::RegexError(e.to_string()))?;
        Ok(CompiledRoute { route, regex: Arc::new(regex), param_names, literal_prefix_len })
    }

    fn pattern_to_regex(pattern: &str) -> (String, Vec<String>, usize) {
        let mut regex = String::with_capacity(pattern.len() * 2);
        regex.push('^');
        let mut param_names = Vec::new();
        let mut literal_prefix_len = 0;
        let mut prefix_done = false;

        for segment in pattern.split('/') {
            if segment.is_empty() {
                continue;
            }
            regex.push('/');
            if let Some(param) = segment.strip_prefix(':') {
                param_names.push(param.to_string());
                regex.push_str("([^/]+)");
                prefix_done = true;
            } else {
                for ch in segment.chars() {
                    if matches!(ch, '.' | '?' | '*' | '+' | '^' | '$' | '[' | ']' | '(' | ')' | '|' | '\\') {
                        regex.push('\\');
                    }
                    regex.push(ch);
                }
                if !prefix_done {
                    literal_prefix_len += segment.len() + 1;
                }
            }
        }
        regex.push('$');
        (regex, param_names, literal_prefix_len)
    }

    /// Finds the route whose pattern matches `path`, longest-literal-prefix
    /// first among dynamic routes. Static routes always take precedence
    /// since they are the most specific match possible.
    pub fn find_match(&self, path: &str) -> Result<RouteMatch, RouteMatchError> {
        if let Some(route) = self.static_routes.get(path) {
            return Ok(RouteMatch { route: route.clone(), params: Vec::new() });
        }

        for compiled in &self.dynamic_routes {
            if let Some(captures) = compiled.regex.captures(path) {
                let params = compiled
                    .param_names
                    .iter()
                    .enumerate()
                    .filter_map(|(i, name)| captures.get(i + 1).map(|m| (name.clone(), m.as_str().to_string())))
                    .collect();
                return Ok(RouteMatch { route: compiled.route.clone(), params });
            }
        }

        Err(RouteMatchError::NoMatch { path: path.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, pattern: &str) -> Route {
        Route {
            name: name.to_string(),
            pattern: pattern.to_string(),
            target: "http://upstream:9000".to_string(),
            methods: vec![],
            policies: vec![],
            circuit_breaker: None,
            timeout_ms: 30_000,
            retries: 0,
        }
    }

    #[test]
    fn static_route_matches_exactly() {
        let matcher = RouteMatcher::new(vec![route("health", "/health")]).unwrap();
        let m = matcher.find_match("/health").unwrap();
        assert_eq!(m.route.name, "health");
        assert!(m.params.is_empty());
    }

    #[test]
    fn dynamic_route_extracts_param() {
        let matcher = RouteMatcher::new(vec![route("example", "/api/example/:id")]).unwrap();
        let m = matcher.find_match("/api/example/42").unwrap();
        assert_eq!(m.params, vec![("id".to_string(), "42".to_string())]);
    }

    #[test]
    fn longest_literal_prefix_wins_among_dynamic_routes() {
        let matcher = RouteMatcher::new(vec![
            route("generic", "/api/:any"),
            route("specific", "/api/example/:id"),
        ])
        .unwrap();
        let m = matcher.find_match("/api/example/42").unwrap();
        assert_eq!(m.route.name, "specific");
    }

    #[test]
    fn no_match_returns_error() {
        let matcher = RouteMatcher::new(vec![route("health", "/health")]).unwrap();
        assert!(matches!(matcher.find_match("/missing"), Err(RouteMatchError::NoMatch { .. })));
    }

    #[test]
    fn validate_rejects_relative_target() {
        let mut r = route("bad", "/x");
        r.target = "not-a-url".to_string();
        assert!(matches!(r.validate(), Err(RouteError::InvalidTarget { .. })));
    }

    #[test]
    fn validate_rejects_empty_param_name() {
        let r = route("bad", "/x/:");
        assert!(r.validate().is_err());
    }
}
