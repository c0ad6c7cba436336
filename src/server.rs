//! HTTP API.
//!
//! | Method | Path                  | Operation                     |
//! |--------|-----------------------|-------------------------------|
//! | POST   | `/api/jupyter`        | start a session               |
//! | DELETE | `/api/jupyter/{port}` | stop a session                |
//! | GET    | `/api/jupyter`        | list sessions                 |
//! | GET    | `/api/capacity`       | free memory and admissibility |
//! | GET    | `/health`             | liveness of the service       |
//!
//! Errors are returned as `{"detail": "<message>"}`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{KeeperError, KeeperResult};
use crate::instance::format_timestamp;
use crate::instance::manager::{CapacityReport, InstanceView, StartedInstance};
use crate::instance::{InstanceManager, StartRequest};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    /// Host placed in session URLs.
    pub public_host: String,
}

impl AppState {
    pub fn new(manager: Arc<InstanceManager>, public_host: impl Into<String>) -> Self {
        Self {
            manager,
            public_host: public_host.into(),
        }
    }

    fn url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.public_host)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jupyter", get(list_sessions).post(start_session))
        .route("/api/jupyter/{port}", delete(stop_session))
        .route("/api/capacity", get(capacity))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub fn status_for(err: &KeeperError) -> StatusCode {
    match err {
        KeeperError::CapacityExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        KeeperError::NotFound(_) => StatusCode::NOT_FOUND,
        KeeperError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        KeeperError::PortInUse(_) => StatusCode::CONFLICT,
        KeeperError::LauncherTimeout(_)
        | KeeperError::LauncherFailure(_)
        | KeeperError::LauncherOutputMalformed(_)
        | KeeperError::CorruptState { .. }
        | KeeperError::Io { .. }
        | KeeperError::Hash(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for KeeperError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self, "request failed");
        } else {
            warn!(%status, error = %self, "request rejected");
        }
        let body = serde_json::json!({ "detail": self.to_string() });
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct StartParams {
    pub session_minutes: Option<u32>,
    pub user_port: Option<u32>,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub disable_timer: bool,
}

impl StartParams {
    fn into_request(self) -> KeeperResult<StartRequest> {
        let port = self
            .user_port
            .map(|p| {
                u16::try_from(p)
                    .map_err(|_| KeeperError::InvalidRequest(format!("user_port {p} is not a port")))
            })
            .transpose()?;
        Ok(StartRequest {
            session_minutes: self.session_minutes,
            port,
            password: Some(self.password),
            disable_timer: self.disable_timer,
        })
    }
}

#[derive(Debug, Serialize)]
struct StartedBody {
    status: &'static str,
    port: u16,
    pid: i32,
    url: String,
    password: String,
    expires_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct StoppedBody {
    status: &'static str,
    port: u16,
}

#[derive(Debug, Serialize)]
struct InstanceBody {
    port: u16,
    pid: Option<i32>,
    started_at: Option<String>,
    expires_at: Option<String>,
    password: Option<String>,
    running: bool,
    url: String,
    estimated_memory_mb: u64,
}

#[derive(Debug, Serialize)]
struct CapacityBody {
    free_mb: u64,
    tracked_mb: u64,
    in_flight: u64,
    min_reserved_mb: u64,
    per_instance_budget_mb: u64,
    admissible: bool,
}

impl StartedBody {
    fn new(state: &AppState, started: StartedInstance) -> Self {
        Self {
            status: "started",
            port: started.port,
            pid: started.pid,
            url: state.url(started.port),
            password: started.password,
            expires_at: started.expires_at.as_ref().map(format_timestamp),
        }
    }
}

impl InstanceBody {
    fn new(state: &AppState, view: InstanceView) -> Self {
        Self {
            port: view.port,
            pid: view.pid,
            started_at: view.started_at.as_ref().map(format_timestamp),
            expires_at: view.expires_at.as_ref().map(format_timestamp),
            password: view.password,
            running: view.running,
            url: state.url(view.port),
            estimated_memory_mb: view.estimated_memory_mb,
        }
    }
}

impl From<CapacityReport> for CapacityBody {
    fn from(report: CapacityReport) -> Self {
        Self {
            free_mb: report.free_mb,
            tracked_mb: report.tracked_mb,
            in_flight: report.in_flight,
            min_reserved_mb: report.policy.min_reserved_mb,
            per_instance_budget_mb: report.policy.per_instance_budget_mb,
            admissible: report.admissible,
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn start_session(
    State(state): State<AppState>,
    Query(params): Query<StartParams>,
) -> Result<Json<StartedBody>, KeeperError> {
    let request = params.into_request()?;
    let started = state.manager.start(request).await?;
    Ok(Json(StartedBody::new(&state, started)))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<StoppedBody>, KeeperError> {
    state.manager.blocking(move |manager| manager.stop(port)).await?;
    Ok(Json(StoppedBody {
        status: "stopped",
        port,
    }))
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<Vec<InstanceBody>>, KeeperError> {
    let views = state.manager.blocking(|manager| manager.list()).await?;
    Ok(Json(
        views
            .into_iter()
            .map(|view| InstanceBody::new(&state, view))
            .collect(),
    ))
}

async fn capacity(State(state): State<AppState>) -> Result<Json<CapacityBody>, KeeperError> {
    let report = state.manager.blocking(|manager| manager.capacity()).await?;
    Ok(Json(report.into()))
}
