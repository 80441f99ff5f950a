use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{app_state::AppState, error::ApiResult};
use crate::scanner::ShardState;

pub fn app(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/status", get(status));

    Router::new()
        .nest("/api", routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    healthy: bool,
    scanner_age_ms: u64,
    workers_age_ms: u64,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let scanner = state.scanner.age();
    let workers = state.workers.age();
    let healthy = scanner <= state.stall_timeout && workers <= state.stall_timeout;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            healthy,
            scanner_age_ms: scanner.as_millis() as u64,
            workers_age_ms: workers.as_millis() as u64,
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    head: Option<u32>,
    cycles: u64,
    blocks: u64,
    matched: u64,
    last_error: Option<String>,
    shards: Vec<ShardState>,

    /// Pending tasks per priority class
    queue: BTreeMap<String, i64>,
}

async fn status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let queue = state
        .broker
        .depth()
        .await?
        .into_iter()
        .map(|(priority, n)| (priority.to_string(), n))
        .collect();

    let scan = state.status.read().await.clone();

    Ok(Json(StatusResponse {
        head: scan.head,
        cycles: scan.cycles,
        blocks: scan.blocks,
        matched: scan.matched,
        last_error: scan.last_error,
        shards: scan.shards,
        queue,
    }))
}
