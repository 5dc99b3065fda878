//! Gateway-wide error type and its conversion into JSON responses.
//!
//! Every fallible path in the gateway core converges on [`GatewayError`] at
//! the pipeline boundary, where it is turned into a [`GatewayResponse`]
//! (status code + `{error, reason}` body) rather than crossing the process
//! boundary in raw form.

use serde_json::json;

use crate::pipeline::{GatewayResponse, ResponseBody};

/// All error conditions the gateway core can produce. Variants carry the
/// user-facing `reason` text directly so `to_response()` is a pure
/// status/label lookup with no reconstruction of the message.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no route matches {path}: {reason}")]
    RouteNotFound { path: String, reason: String },

    #[error("policy {policy_name} denied the request: {reason}")]
    PolicyDenied {
        policy_name: String,
        status_code: u16,
        error: String,
        reason: String,
    },

    #[error("policy {policy_name} raised an internal error: {reason}")]
    PolicyInternal { policy_name: String, reason: String },

    #[error("circuit open for {service_id}")]
    BreakerOpen { service_id: String },

    #[error("upstream transport error: {reason}")]
    UpstreamTransport { reason: String },

    #[error("upstream request to {target} timed out after {timeout_ms}ms")]
    UpstreamTimeout { target: String, timeout_ms: u64 },

    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid route configuration: {0}")]
    ConfigInvalid(String),

    #[error("config file I/O error: {0}")]
    FileIo(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Renders this error as the JSON response the pipeline returns to the client.
    pub fn to_response(&self) -> GatewayResponse {
        let (status, error_label, reason) = match self {
            GatewayError::RouteNotFound { reason, .. } => (404, "Not Found".to_string(), reason.clone()),
            GatewayError::PolicyDenied { status_code, error, reason, .. } => (*status_code, error.clone(), reason.clone()),
            GatewayError::PolicyInternal { reason, .. } => (500, "Internal Server Error".to_string(), reason.clone()),
            GatewayError::BreakerOpen { .. } => (503, "Service Unavailable".to_string(), "circuit open".to_string()),
            GatewayError::UpstreamTransport { reason } => (502, "Bad Gateway".to_string(), reason.clone()),
            GatewayError::UpstreamTimeout { .. } => (504, "Gateway Timeout".to_string(), "upstream did not respond in time".to_string()),
            GatewayError::StoreUnavailable(_) => (503, "Service Unavailable".to_string(), self.to_string()),
            GatewayError::ConfigInvalid(_) => (500, "Internal Server Error".to_string(), self.to_string()),
            GatewayError::FileIo(_) => (500, "Internal Server Error".to_string(), self.to_string()),
            GatewayError::Internal(reason) => (500, "Internal Server Error".to_string(), reason.clone()),
        };

        let body = json!({ "error": error_label, "reason": reason }).to_string();

        GatewayResponse {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: ResponseBody::Bytes(body.into_bytes()),
        }
    }
}
