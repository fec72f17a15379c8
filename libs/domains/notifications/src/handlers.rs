//! Admin HTTP surface: health, metrics, breaker and limiter inspection,
//! manual breaker reset and on-demand sweeps.

use crate::engine::{DeliveryEngine, SweepReport};
use crate::error::{NotificationError, NotificationResult};
use crate::models::NotificationStats;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use resilience::{BreakerSnapshot, LimiterStats};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<DeliveryEngine>,
    pub pending_batch: u64,
    pub retry_batch: u64,
}

impl AdminState {
    pub fn new(engine: Arc<DeliveryEngine>, pending_batch: u64, retry_batch: u64) -> Self {
        Self {
            engine,
            pending_batch,
            retry_batch,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    pub limit: Option<u64>,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/admin/breakers", get(list_breakers))
        .route("/admin/breakers/reset", post(reset_all_breakers))
        .route("/admin/breakers/{provider}/reset", post(reset_breaker))
        .route("/admin/limiters", get(list_limiters))
        .route("/admin/stats", get(stats))
        .route("/admin/sweeps/pending", post(sweep_pending))
        .route("/admin/sweeps/retry", post(sweep_retry))
        .with_state(state)
}

async fn health(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "in_flight": state.engine.in_flight(),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        resilience::metrics::render_metrics(),
    )
}

async fn list_breakers(State(state): State<AdminState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.engine.breaker_snapshot())
}

async fn reset_breaker(
    State(state): State<AdminState>,
    Path(provider): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if state.engine.reset_breaker(&provider) {
        tracing::info!(provider = %provider, "Breaker reset via admin API");
        Ok(Json(json!({ "reset": provider })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("No breaker for provider '{}'", provider) })),
        ))
    }
}

async fn reset_all_breakers(State(state): State<AdminState>) -> Json<Value> {
    let count = state.engine.reset_breakers();
    tracing::info!(count, "All breakers reset via admin API");
    Json(json!({ "reset": count }))
}

async fn list_limiters(State(state): State<AdminState>) -> Json<Vec<LimiterStats>> {
    Json(state.engine.limiter_stats())
}

async fn stats(
    State(state): State<AdminState>,
    Query(query): Query<StatsQuery>,
) -> NotificationResult<Json<NotificationStats>> {
    let stats = state.engine.stats(query.tenant_id.as_deref()).await?;
    Ok(Json(stats))
}

async fn sweep_pending(
    State(state): State<AdminState>,
    Query(query): Query<SweepQuery>,
) -> NotificationResult<Json<SweepReport>> {
    let limit = sweep_limit(query.limit, state.pending_batch)?;
    Ok(Json(state.engine.sweep_pending(limit).await?))
}

async fn sweep_retry(
    State(state): State<AdminState>,
    Query(query): Query<SweepQuery>,
) -> NotificationResult<Json<SweepReport>> {
    let limit = sweep_limit(query.limit, state.retry_batch)?;
    Ok(Json(state.engine.sweep_retries(limit).await?))
}

fn sweep_limit(requested: Option<u64>, default: u64) -> NotificationResult<u64> {
    match requested {
        Some(0) => Err(NotificationError::Validation("limit must be positive".into())),
        Some(limit) => Ok(limit),
        None => Ok(default),
    }
}
