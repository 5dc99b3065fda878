//! API Gateway server binary.
//!
//! Wires the gateway-core collaborators (config manager, policy engine,
//! circuit breaker registry, metrics registry, event bus, pipeline) behind
//! a small Actix Web surface: the proxy catch-all, `/metrics`, `/health` and
//! `/health/ready`.

use std::sync::Arc;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use gateway_core::breaker::CircuitBreakerRegistry;
use gateway_core::config::ConfigManager;
use gateway_core::events::{log_state_changes, record_state_changes_to_metrics, EventBus};
use gateway_core::logging::configure_logger;
use gateway_core::metrics::MetricsRegistry;
use gateway_core::pipeline::{GatewayRequest, Pipeline, ResponseBody};
use gateway_core::policy::authentication::AuthenticationPolicy;
use gateway_core::policy::ip_filter::IpFilterPolicy;
use gateway_core::policy::rate_limit::RateLimitPolicy;
use gateway_core::policy::PolicyEngine;
use gateway_core::store::{RedisStoreClient, StoreClient};
use gateway_core::GatewayConfig;
use log::{info, warn};

struct AppState {
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    store: Option<Arc<dyn StoreClient>>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let config = GatewayConfig::from_env();
    info!("starting gateway on port {}", config.port);

    let store: Option<Arc<dyn StoreClient>> = match RedisStoreClient::connect(&config.redis).await {
        Ok(client) => {
            info!("connected to shared store at {}:{}", config.redis.host, config.redis.port);
            Some(Arc::new(client))
        }
        Err(e) => {
            warn!("shared store unavailable, continuing without it: {e}");
            None
        }
    };

    let events = EventBus::new();
    tokio::spawn(log_state_changes(events.clone()));
    let metrics = MetricsRegistry::new();
    tokio::spawn(record_state_changes_to_metrics(events.clone(), metrics.clone()));

    let config_manager = ConfigManager::initialize(config.config_dir.clone(), store.clone())
        .await
        .expect("failed to initialize route configuration");

    let policy_engine = PolicyEngine::new();
    policy_engine.register(Arc::new(AuthenticationPolicy::new(config.authentication.clone()))).await;
    policy_engine.register(Arc::new(IpFilterPolicy::new(config.ip_filter.clone()))).await;
    if let Some(store) = &store {
        policy_engine
            .register(Arc::new(RateLimitPolicy::new(config.rate_limit.clone(), store.clone())))
            .await;
    }

    let breakers = CircuitBreakerRegistry::new(events.clone(), store.clone());
    for route in config_manager.get_routes().await {
        let breaker_config = route
            .circuit_breaker
            .clone()
            .map(Into::into)
            .unwrap_or_else(|| config.default_breaker.clone());
        breakers.register(route.service_id(), breaker_config).await;
    }

    let pipeline = Pipeline::new(config_manager, policy_engine, breakers.clone(), metrics.clone());

    let state = web::Data::new(AppState { pipeline, metrics, breakers, store: store.clone() });
    let bind_port = config.port;

    info!("gateway listening on 0.0.0.0:{bind_port}");
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health))
            .route("/health/ready", web::get().to(readiness))
            .route("/metrics", web::get().to(metrics_endpoint))
            .default_service(web::route().to(proxy))
    })
    .bind(("0.0.0.0", bind_port))?
    .run()
    .await
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Ready iff the config manager has initialized (always true once this
/// handler is reachable, since startup blocks on it) and the shared store,
/// if configured, is reachable (SPEC_FULL.md §6 "Health endpoints").
async fn readiness(state: web::Data<AppState>) -> HttpResponse {
    let store_ready = match &state.store {
        Some(store) => store.get("health:ready-check").await.is_ok(),
        None => true,
    };
    if store_ready {
        HttpResponse::Ok().json(serde_json::json!({"status": "ready"}))
    } else {
        HttpResponse::ServiceUnavailable().json(serde_json::json!({"status": "degraded", "reason": "shared store unreachable"}))
    }
}

async fn metrics_endpoint(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(state.metrics.snapshot_text().await)
}

async fn proxy(state: web::Data<AppState>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    let client_ip = req.peer_addr().map(|a| a.ip().to_string()).unwrap_or_else(|| "unknown".to_string());
    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect();

    let gateway_request = GatewayRequest {
        method: req.method().to_string(),
        path: req.path().to_string(),
        query: req.query_string().to_string(),
        headers,
        body: body.to_vec(),
        client_ip,
    };

    let response = state.pipeline.handle(gateway_request).await;
    let mut builder = HttpResponse::build(
        actix_web::http::StatusCode::from_u16(response.status).unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &response.headers {
        builder.insert_header((name.as_str(), value.as_str()));
    }
    let ResponseBody::Bytes(bytes) = response.body;
    builder.body(bytes)
}
