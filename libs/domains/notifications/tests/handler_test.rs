//! Handler tests for the admin router
//!
//! These exercise routing, status codes and JSON bodies against an engine
//! backed by the in-memory store.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use domain_notifications::providers::{MockProvider, ProviderSet};
use domain_notifications::*;
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt; // For oneshot()

// Helper to parse JSON response body
async fn json_body<T: serde::de::DeserializeOwned>(body: Body) -> T {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn setup() -> (Router, Arc<DeliveryEngine>, Arc<MockProvider>) {
    let provider = Arc::new(MockProvider::new("sendgrid", Channel::Email));
    let engine = Arc::new(DeliveryEngine::new(
        Arc::new(InMemoryNotificationRepository::new()),
        Arc::new(LoggingPublisher),
        ProviderSet::new().with(provider.clone()),
        DeliveryConfig::default(),
    ));
    let app = admin_router(AdminState::new(engine.clone(), 100, 50));
    (app, engine, provider)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_health_returns_200() {
    let (app, _, _) = setup();

    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["in_flight"], 0);
}

#[tokio::test]
async fn test_metrics_returns_text() {
    let (app, _, _) = setup();

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_list_breakers_shows_configured_providers() {
    let (app, _, _) = setup();

    let response = app.oneshot(get("/admin/breakers")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let breakers: Vec<Value> = json_body(response.into_body()).await;
    assert_eq!(breakers.len(), 1);
    assert_eq!(breakers[0]["name"], "sendgrid");
    assert_eq!(breakers[0]["state"], "closed");
    assert_eq!(breakers[0]["counts"]["consecutive_failures"], 0);
}

#[tokio::test]
async fn test_reset_breaker_closes_an_open_breaker() {
    let (app, engine, provider) = setup();
    provider.set_failure(Some(providers::ProviderError::transient("down")));

    for i in 0..6 {
        engine
            .submit(CreateNotification::new(
                "tenant-a",
                Channel::Email,
                format!("u{i}@example.com"),
                "hi",
            ))
            .await
            .unwrap();
        engine.wait_idle().await;
    }
    assert_eq!(engine.breakers().get("sendgrid").state(), resilience::CircuitState::Open);

    let response = app
        .oneshot(post("/admin/breakers/sendgrid/reset"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["reset"], "sendgrid");
    assert_eq!(engine.breakers().get("sendgrid").state(), resilience::CircuitState::Closed);
}

#[tokio::test]
async fn test_reset_unknown_breaker_returns_404() {
    let (app, _, _) = setup();

    let response = app
        .oneshot(post("/admin/breakers/carrier-pigeon/reset"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reset_all_breakers_reports_count() {
    let (app, _, _) = setup();

    let response = app.oneshot(post("/admin/breakers/reset")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["reset"], 1);
}

#[tokio::test]
async fn test_list_limiters_has_one_per_channel() {
    let (app, _, _) = setup();

    let response = app.oneshot(get("/admin/limiters")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let limiters: Vec<Value> = json_body(response.into_body()).await;
    let names: Vec<&str> = limiters.iter().map(|l| l["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["email", "in_app", "push", "sms", "webhook"]);
    assert_eq!(limiters[3]["capacity"], 10);
}

#[tokio::test]
async fn test_stats_filters_by_tenant() {
    let (app, engine, _) = setup();
    engine
        .submit(CreateNotification::new("tenant-a", Channel::Email, "a@example.com", "hi"))
        .await
        .unwrap();
    engine
        .submit(CreateNotification::new("tenant-b", Channel::Email, "b@example.com", "hi"))
        .await
        .unwrap();
    engine.wait_idle().await;

    let response = app
        .clone()
        .oneshot(get("/admin/stats?tenant_id=tenant-a"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats: NotificationStats = json_body(response.into_body()).await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.sent, 1);

    let response = app.oneshot(get("/admin/stats")).await.unwrap();
    let stats: NotificationStats = json_body(response.into_body()).await;
    assert_eq!(stats.total, 2);
}

#[tokio::test]
async fn test_sweep_endpoints_return_reports() {
    let (app, _, _) = setup();

    let response = app.clone().oneshot(post("/admin/sweeps/pending")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let report: Value = json_body(response.into_body()).await;
    assert_eq!(report["selected"], 0);

    let response = app.oneshot(post("/admin/sweeps/retry?limit=10")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_sweep_rejects_zero_limit() {
    let (app, _, _) = setup();

    let response = app
        .oneshot(post("/admin/sweeps/pending?limit=0"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = json_body(response.into_body()).await;
    assert_eq!(body["code"], "validation_error");
}
