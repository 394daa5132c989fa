#![cfg(feature = "web-api")]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use plug_core::{Action, Error, Service};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::module::{Module, ModuleCtx};

/// Longest delay the control plane accepts, in minutes (24h).
const MAX_MINUTES: i64 = 1440;

#[derive(Clone)]
pub struct AppState {
    service: Service,
    api_key: Option<String>,
    started: Instant,
}

impl AppState {
    pub fn new(service: Service, api_key: Option<String>) -> Self {
        Self { service, api_key, started: Instant::now() }
    }

    fn authorized(&self, given: Option<&str>) -> bool {
        matches!((self.api_key.as_deref(), given), (Some(k), Some(g)) if k == g)
    }
}

#[derive(Deserialize)]
struct TimerBody {
    device_name: Option<String>,
    minutes: Option<Minutes>,
    action: Option<String>,
    api_key: Option<String>,
}

/// `minutes` arrives either as a JSON number or as a numeric string.
#[derive(Deserialize)]
#[serde(untagged)]
enum Minutes {
    Number(i64),
    Text(String),
}

impl Minutes {
    fn value(&self) -> Option<i64> {
        match self {
            Minutes::Number(n) => Some(*n),
            Minutes::Text(t) => t.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct CancelBody {
    job_id: Option<String>,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct KeyBody {
    api_key: Option<String>,
}

pub struct WebServer {
    addr: SocketAddr,
    api_key: Option<String>,
}

impl WebServer {
    pub fn new(addr: SocketAddr, api_key: Option<String>) -> Self { Self { addr, api_key } }
}

impl Module for WebServer {
    fn name(&self) -> &'static str { "web" }

    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(async move {
            if self.api_key.is_none() {
                warn!("no api_key configured; mutating routes will reject every request");
            }
            let app = router(AppState::new(ctx.service.clone(), self.api_key.clone()));

            let listener = tokio::net::TcpListener::bind(self.addr).await?;
            info!("web listening on http://{}", self.addr);

            let mut shutdown = ctx.shutdown.clone();
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await?;
            Ok(())
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/status", get(status))
        .route("/jobs", get(jobs_list))
        .route("/timer", post(timer))
        .route("/cancel-job", post(cancel_job))
        .route("/clear-cache", post(clear_cache))
        .route("/test-connection", post(test_connection))
        .with_state(state)
}

fn fail(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(json!({ "status": "error", "message": message.into() }))).into_response()
}

/// Unwrap a JSON body, turning any extractor rejection into the error envelope.
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    payload.map(|Json(b)| b).map_err(|rejection| {
        debug!(status = %rejection.status(), error = %rejection.body_text(), "rejected request body");
        fail(StatusCode::BAD_REQUEST, "request body must be a JSON object")
    })
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let s = state.service.status();
    Json(json!({
        "scheduler_available": true,
        "active_jobs": s.active_jobs,
        "timestamp": s.now,
        "uptime_ms": state.started.elapsed().as_millis() as u64,
    }))
}

async fn jobs_list(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.service.list_jobs();
    Json(json!({
        "status": "success",
        "active_jobs": jobs.len(),
        "jobs": jobs,
        "timestamp": Utc::now(),
    }))
}

async fn timer(State(state): State<AppState>, payload: Result<Json<TimerBody>, JsonRejection>) -> Response {
    let body = match json_body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let (Some(device_name), Some(api_key)) = (body.device_name.filter(|d| !d.trim().is_empty()), body.api_key) else {
        return fail(StatusCode::BAD_REQUEST, "device_name and api_key are required");
    };
    if !state.authorized(Some(&api_key)) {
        return fail(StatusCode::UNAUTHORIZED, "invalid api key");
    }
    let minutes = match body.minutes.as_ref().map_or(Some(1), Minutes::value) {
        Some(m) => m,
        None => return fail(StatusCode::BAD_REQUEST, "minutes must be an integer"),
    };
    if !(0..=MAX_MINUTES).contains(&minutes) {
        return fail(StatusCode::BAD_REQUEST, format!("minutes must be between 0 and {MAX_MINUTES}"));
    }
    let action = match body.action.as_deref().unwrap_or("off").parse::<Action>() {
        Ok(a) => a,
        Err(e) => return fail(StatusCode::BAD_REQUEST, e),
    };

    let delay = Duration::from_secs(minutes as u64 * 60);
    let job_id = state.service.schedule_job(&device_name, action, delay);
    let execution_time = state.service.job(&job_id).ok().map(|j| j.scheduled_for);
    Json(json!({
        "status": "success",
        "message": format!("scheduled {action} on {device_name} in {minutes} minute(s)"),
        "job_id": job_id,
        "execution_time": execution_time,
    }))
    .into_response()
}

async fn cancel_job(State(state): State<AppState>, payload: Result<Json<CancelBody>, JsonRejection>) -> Response {
    let body = match json_body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let (Some(job_id), Some(api_key)) = (body.job_id, body.api_key) else {
        return fail(StatusCode::BAD_REQUEST, "job_id and api_key are required");
    };
    if !state.authorized(Some(&api_key)) {
        return fail(StatusCode::UNAUTHORIZED, "invalid api key");
    }
    match state.service.cancel_job(&job_id) {
        Ok(()) => Json(json!({ "status": "success", "message": format!("job {job_id} cancelled") })).into_response(),
        Err(e @ Error::JobNotFound(_)) => fail(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => fail(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn clear_cache(State(state): State<AppState>, payload: Result<Json<KeyBody>, JsonRejection>) -> Response {
    let body = match json_body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if !state.authorized(body.api_key.as_deref()) {
        return fail(StatusCode::UNAUTHORIZED, "invalid api key");
    }
    state.service.clear_session_cache();
    Json(json!({ "status": "success", "message": "session cache cleared" })).into_response()
}

async fn test_connection(State(state): State<AppState>, payload: Result<Json<KeyBody>, JsonRejection>) -> Response {
    let body = match json_body(payload) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    if !state.authorized(body.api_key.as_deref()) {
        return fail(StatusCode::UNAUTHORIZED, "invalid api key");
    }
    match state.service.test_connection().await {
        Ok(devices) => Json(json!({
            "status": "success",
            "devices_found": devices.len(),
            "devices": devices,
        }))
        .into_response(),
        Err(e) => fail(StatusCode::BAD_GATEWAY, format!("connection test failed: {e}")),
    }
}
