//! Status and command HTTP server.
//!
//! The boundary the external dashboard talks to: pull-based snapshot
//! queries plus the start/stop/restart commands. Unknown job ids map to
//! 404; idempotent no-op commands return the current snapshot.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::health::current_timestamp_ms;
use crate::job::JobSnapshot;
use crate::monitor::{ResourceSnapshot, ResourceWatch};
use crate::state::JobState;
use crate::status::StatusColor;
use crate::supervisor::{Supervisor, SupervisorError};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ServerState {
    pub supervisor: Arc<Supervisor>,
    pub resources: ResourceWatch,
}

/// Full fleet snapshot returned by GET /status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub timestamp_ms: i64,
    pub fleet_color: StatusColor,
    pub jobs: Vec<JobSnapshot>,
    pub resources: ResourceSnapshot,
}

/// Result of a job command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub job_id: String,
    pub state: JobState,
    pub color: StatusColor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn map_error(err: SupervisorError) -> HandlerError {
    let status = match err {
        SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

/// Handler for GET /status
async fn get_status(State(state): State<ServerState>) -> Json<StatusResponse> {
    let jobs = state.supervisor.list_status().await;
    Json(StatusResponse {
        timestamp_ms: current_timestamp_ms(),
        fleet_color: state.supervisor.fleet_color(),
        jobs,
        resources: state.resources.borrow().clone(),
    })
}

/// Handler for GET /jobs/{id}
async fn get_job(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, HandlerError> {
    state
        .supervisor
        .job_status(&id)
        .await
        .map(Json)
        .map_err(map_error)
}

async fn command_response(
    state: &ServerState,
    id: &str,
) -> Result<Json<CommandResponse>, HandlerError> {
    let snapshot = state.supervisor.job_status(id).await.map_err(map_error)?;
    Ok(Json(CommandResponse {
        job_id: snapshot.id,
        state: snapshot.state,
        color: snapshot.color,
    }))
}

/// Handler for POST /jobs/{id}/start
async fn post_start(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, HandlerError> {
    state.supervisor.start(&id).await.map_err(map_error)?;
    command_response(&state, &id).await
}

/// Handler for POST /jobs/{id}/stop
async fn post_stop(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, HandlerError> {
    state.supervisor.stop(&id).await.map_err(map_error)?;
    command_response(&state, &id).await
}

/// Handler for POST /jobs/{id}/restart
async fn post_restart(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, HandlerError> {
    state.supervisor.restart(&id).await.map_err(map_error)?;
    command_response(&state, &id).await
}

/// Creates the axum Router with status and command endpoints
pub fn create_status_router(state: ServerState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/start", post(post_start))
        .route("/jobs/:id/stop", post(post_stop))
        .route("/jobs/:id/restart", post(post_restart))
        .with_state(state)
}

/// Runs the status HTTP server on the configured bind address.
pub async fn run_status_server(state: ServerState, bind_addr: &str) -> Result<(), ServerError> {
    let app = create_status_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "status server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
