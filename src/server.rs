use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;

use crate::filter::{with_admission_control, AdmissionFilter};

#[derive(Clone)]
pub struct AppState {
    pub filter: Arc<AdmissionFilter>,
}

/// Assemble the service: operational routes plus `api`, all behind the
/// admission filter.
pub fn build_router(state: AppState, api: Router) -> Router {
    let filter = state.filter.clone();
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(api)
        .fallback(not_found);

    with_admission_control(app, filter)
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "rateLimiting": state.filter.is_enabled(),
        "buckets": state.filter.limiter().registry().len(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .filter
        .metrics()
        .encode()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "status": "error",
            "errorCode": "NOT_FOUND",
            "message": "Resource not found."
        })),
    )
}
