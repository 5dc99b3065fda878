//! End-to-end pipeline scenarios exercised against in-process fakes: an
//! in-memory shared store instead of Redis, and a raw-TCP mock upstream
//! instead of a live backend.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use gateway_core::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use gateway_core::config::ConfigManager;
use gateway_core::events::EventBus;
use gateway_core::metrics::MetricsRegistry;
use gateway_core::pipeline::{GatewayRequest, Pipeline};
use gateway_core::policy::authentication::{AuthenticationConfig, AuthenticationPolicy};
use gateway_core::policy::rate_limit::{RateLimitConfig, RateLimitPolicy};
use gateway_core::policy::PolicyEngine;
use gateway_core::routing::Route;
use gateway_core::store::{InMemoryStoreClient, StoreClient};

fn route(name: &str, pattern: &str, target: &str, policies: &[&str]) -> Route {
    Route {
        name: name.to_string(),
        pattern: pattern.to_string(),
        target: target.to_string(),
        methods: vec!["GET".to_string()],
        policies: policies.iter().map(|s| s.to_string()).collect(),
        circuit_breaker: None,
        timeout_ms: 2_000,
        retries: 0,
    }
}

async fn build_pipeline(routes: Vec<Route>, store: Arc<dyn StoreClient>) -> (Arc<Pipeline>, Arc<CircuitBreakerRegistry>, Arc<MetricsRegistry>) {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigManager::initialize(dir.path().to_path_buf(), Some(store.clone())).await.unwrap();
    for r in routes {
        config.add_route(r).await.unwrap();
    }
    // Remove the seeded default health route so it doesn't interfere with matching.
    config.delete_route("default").await.unwrap();

    let policy_engine = PolicyEngine::new();
    policy_engine.register(Arc::new(AuthenticationPolicy::new(AuthenticationConfig { api_key: None, ..AuthenticationConfig::from_env() }))).await;
    policy_engine
        .register(Arc::new(RateLimitPolicy::new(RateLimitConfig { default_limit: 2, default_window_seconds: 60 }, store.clone())))
        .await;

    let events = EventBus::new();
    let breakers = CircuitBreakerRegistry::new(events, Some(store));
    for r in config.get_routes().await {
        breakers.register(r.service_id(), CircuitBreakerConfig { failure_threshold: 3, successes_before_reset: 1, reset_timeout_ms: 1000, distributed: false }).await;
    }

    let metrics = MetricsRegistry::new();
    let pipeline = Pipeline::new(config, policy_engine, breakers.clone(), metrics.clone());
    (pipeline, breakers, metrics)
}

#[tokio::test]
async fn s1_happy_path_records_metrics() {
    let (base_url, hits) = common::spawn_mock_upstream(200, r#"{"ok":true}"#).await;
    let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
    let (pipeline, _breakers, metrics) = build_pipeline(vec![route("svc", "/a/:id", &base_url, &[])], store).await;

    let response = pipeline.handle(GatewayRequest::get("/a/42")).await;
    assert_eq!(response.status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let snapshot = metrics.snapshot_text().await;
    assert!(snapshot.contains("api_requests_total{route=\"svc\",method=\"GET\",status_code=\"200\"} 1"));
}

#[tokio::test]
async fn s2_missing_auth_header_denies_without_calling_upstream() {
    let (base_url, hits) = common::spawn_mock_upstream(200, "{}").await;
    let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
    let (pipeline, _breakers, _metrics) = build_pipeline(vec![route("svc", "/a/:id", &base_url, &["authentication"])], store).await;

    let response = pipeline.handle(GatewayRequest::get("/a/1")).await;
    assert_eq!(response.status, 401);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn s3_rate_limit_denies_after_window_exhausted() {
    let (base_url, _hits) = common::spawn_mock_upstream(200, "{}").await;
    let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
    let (pipeline, _breakers, _metrics) = build_pipeline(vec![route("svc", "/a/:id", &base_url, &["rate-limiting"])], store).await;

    assert_eq!(pipeline.handle(GatewayRequest::get("/a/1")).await.status, 200);
    assert_eq!(pipeline.handle(GatewayRequest::get("/a/1")).await.status, 200);
    assert_eq!(pipeline.handle(GatewayRequest::get("/a/1")).await.status, 429);
}

#[tokio::test]
async fn s4_breaker_opens_after_repeated_upstream_failures_then_probes() {
    let (base_url, _hits) = common::spawn_mock_upstream(500, "{}").await;
    let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
    let (pipeline, breakers, _metrics) = build_pipeline(vec![route("svc", "/a/:id", &base_url, &[])], store).await;

    for _ in 0..3 {
        assert_eq!(pipeline.handle(GatewayRequest::get("/a/1")).await.status, 502);
    }

    let response = pipeline.handle(GatewayRequest::get("/a/1")).await;
    assert_eq!(response.status, 503);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(breakers.is_allowed("svc").await);
}

#[tokio::test]
async fn s6_route_crud_survives_restart() {
    let store: Arc<dyn StoreClient> = Arc::new(InMemoryStoreClient::new());
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigManager::initialize(dir.path().to_path_buf(), Some(store.clone())).await.unwrap();

    config.add_route(route("x", "/x", "http://upstream", &[])).await.unwrap();

    let reloaded = ConfigManager::initialize(dir.path().to_path_buf(), Some(store)).await.unwrap();
    assert!(reloaded.get_routes().await.iter().any(|r| r.name == "x"));

    assert!(reloaded.delete_route("x").await.unwrap());
    assert!(!reloaded.delete_route("x").await.unwrap());
}
