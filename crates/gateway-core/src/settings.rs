//! Process-wide configuration, read once at startup from the environment
//! (SPEC_FULL.md §6 "Configuration (environment)") into an immutable value
//! threaded through component constructors. No component reads
//! `std::env` at request time — this is the one place that does.

use crate::breaker::CircuitBreakerConfig;
use crate::policy::authentication::AuthenticationConfig;
use crate::policy::ip_filter::IpFilterConfig;
use crate::policy::rate_limit::RateLimitConfig;
use crate::store::RedisSettings;

#[derive(Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub log_level: String,
    pub config_dir: std::path::PathBuf,
    pub redis: RedisSettings,
    pub authentication: AuthenticationConfig,
    pub rate_limit: RateLimitConfig,
    pub ip_filter: IpFilterConfig,
    pub default_breaker: CircuitBreakerConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            config_dir: std::env::var("GATEWAY_CONFIG_DIR").map(std::path::PathBuf::from).unwrap_or_else(|_| std::path::PathBuf::from("./gateway-config")),
            redis: RedisSettings {
                host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: std::env::var("REDIS_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(6379),
                password: std::env::var("REDIS_PASSWORD").ok(),
                db: std::env::var("REDIS_DB").ok().and_then(|v| v.parse().ok()).unwrap_or(0),
            },
            authentication: AuthenticationConfig::from_env(),
            rate_limit: RateLimitConfig::default(),
            ip_filter: IpFilterConfig::from_env(),
            default_breaker: CircuitBreakerConfig {
                failure_threshold: std::env::var("DEFAULT_FAILURE_THRESHOLD").ok().and_then(|v| v.parse().ok()).unwrap_or(5),
                successes_before_reset: 1,
                reset_timeout_ms: std::env::var("DEFAULT_RESET_TIMEOUT").ok().and_then(|v| v.parse().ok()).unwrap_or(30_000),
                distributed: false,
            },
        }
    }
}
