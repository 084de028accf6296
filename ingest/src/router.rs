use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use serde_json::json;
use sqlx::postgres::PgPool;
use tower_http::trace::TraceLayer;

use leadgen_common::metrics::setup_metrics_routes;

use crate::config::Config;
use crate::ingest;
use crate::monitoring;
use crate::policy::PolicyCache;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub policy_cache: Arc<PolicyCache>,
    pub request_timeout: Duration,
    pub delivery_max_attempts: i32,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        Self {
            pool,
            policy_cache: Arc::new(PolicyCache::new(config.policy_cache_ttl.0)),
            request_timeout: config.request_timeout.0,
            delivery_max_attempts: config.delivery_max_attempts,
        }
    }
}

async fn index() -> &'static str {
    "leadgen ingest"
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({"status": "healthy", "database": "up"})),
        ),
        Err(e) => {
            tracing::warn!("health check failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "unhealthy", "database": "down"})),
            )
        }
    }
}

pub fn router(state: AppState, metrics: bool) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/leads", post(ingest::post_lead))
        .route(
            "/api/monitoring/deliveries/stuck",
            get(monitoring::stuck_deliveries),
        )
        .route(
            "/api/monitoring/deliveries/replay",
            post(monitoring::replay_stuck_deliveries),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Installing a global recorder when the crate is used as a library
    // (tests) does not work well, so only do it when asked to.
    if metrics {
        setup_metrics_routes(router)
    } else {
        router
    }
}
