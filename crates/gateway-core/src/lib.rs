//! Gateway core: routing, policy evaluation, circuit breaking, and config
//! management for a lightweight API gateway.
//!
//! ## Architecture
//!
//! Requests flow through [`pipeline::Pipeline`]: a route is matched
//! ([`routing`]), the route's policy chain is evaluated ([`policy`]), the
//! upstream's [`breaker::CircuitBreaker`] is consulted for admission, and the
//! request is forwarded with retry. [`config::ConfigManager`] owns the
//! active route set and hot-reloads it from the shared store or disk.
//! [`metrics::MetricsRegistry`] and [`events::EventBus`] observe the pipeline
//! without participating in its control flow.
//!
//! ## Environment
//!
//! See [`settings::GatewayConfig`] for the full set of environment variables
//! read once at process startup.

pub mod breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod policy;
pub mod routing;
pub mod settings;
pub mod store;

pub use error::GatewayError;
pub use pipeline::Pipeline;
pub use settings::GatewayConfig;
