use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::api::latency::{LatencySummary, RunLatency};
use crate::config::HISTORY_LIMIT;
use crate::db::ResultStore;
use crate::error::{error_response, AppError};
use crate::scheduler::Scheduler;
use crate::types::{ScrapeRun, Trigger};

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn ResultStore>,
    pub latency: Arc<RunLatency>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(get_health))
        .route("/scrape", get(get_scrape))
        .route("/history", get(get_history))
        .route("/status", get(get_status))
        .fallback(not_found)
        .layer(middleware::map_response(add_cors_headers))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub status: &'static str,
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct ScrapeResponse {
    pub success: bool,
    pub data: ScrapeRun,
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub data: Vec<ScrapeRun>,
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub success: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
    pub update_interval_hours: f64,
    pub running: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub run_duration_ms: LatencySummary,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let status = state.scheduler.status();
    Json(HealthResponse {
        success: true,
        status: "Server is running",
        last_update: status.last_update,
        next_update: status.next_update,
    })
}

async fn get_scrape(State(state): State<ApiState>) -> Response {
    info!("Starting scraping process...");
    match state.scheduler.trigger(Trigger::OnDemand).await {
        Ok(run) => {
            let status = state.scheduler.status();
            Json(ScrapeResponse {
                success: true,
                data: run,
                last_update: status.last_update,
                next_update: status.next_update,
            })
            .into_response()
        }
        Err(e) => {
            error!("Error in /scrape endpoint: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn get_history(State(state): State<ApiState>) -> Result<Json<HistoryResponse>, AppError> {
    let runs = state.store.list_recent(HISTORY_LIMIT).await?;
    let status = state.scheduler.status();
    Ok(Json(HistoryResponse {
        success: true,
        data: runs,
        last_update: status.last_update,
        next_update: status.next_update,
    }))
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let status = state.scheduler.status();
    Json(StatusResponse {
        success: true,
        last_update: status.last_update,
        next_update: status.next_update,
        update_interval_hours: status.update_interval_hours,
        running: status.running,
        consecutive_failures: status.consecutive_failures,
        last_error: status.last_error,
        run_duration_ms: state.latency.summary(),
    })
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Route not found")
}

async fn add_cors_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Origin, X-Requested-With, Content-Type, Accept"),
    );
    response
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
