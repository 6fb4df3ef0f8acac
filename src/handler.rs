use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tracing::info;

use crate::auth;
use crate::bim;
use crate::config::Config;
use crate::db::PoolManager;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<PoolManager>,
    pub acquire_timeout: Duration,
    pub owner_token: Option<String>,
}

impl AppState {
    pub fn new(db: Arc<PoolManager>, cfg: &Config) -> Self {
        AppState {
            db,
            acquire_timeout: Duration::from_millis(cfg.app.acquire_timeout_ms),
            owner_token: cfg.app.owner_token.clone(),
        }
    }
}

pub async fn healthcheck() -> impl IntoResponse {
    info!("got healthcheck request");
    Json(json!({ "status": "ok" }))
}

/// Cheap readiness probe reflecting the pool state, for orchestrators.
pub async fn ready(State(state): State<AppState>) -> Response {
    match state.db.state_name().await {
        "ready" => (StatusCode::OK, "ok").into_response(),
        other => (StatusCode::SERVICE_UNAVAILABLE, other).into_response(),
    }
}

/// Full application router. CORS and process-level layers are added by
/// the caller.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(healthcheck))
        .route("/health/ready", get(ready))
        .merge(bim::routes())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_owner,
        ))
        .with_state(state)
}
