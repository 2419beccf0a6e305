//! Supplemental instances held for the lifetime of a build.
//!
//! `POST` provisions the whole request as one batch and hands back a session
//! id with the build's environment variables; `DELETE` tears the batch down,
//! each node with its own disposal.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
    Json, Router,
};
use cloudfleet_id::SessionId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::error::ApiError;
use super::ApiState;
use crate::ledger::TerminationReport;
use crate::session::InstancesToRun;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/", post(create_session))
        .route("/{session_id}", delete(tear_down_session))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub instances: Vec<InstancesToRun>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct SessionNode {
    pub cloud: String,
    pub template: String,
    pub node_id: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct SessionResponse {
    pub session_id: SessionId,
    pub nodes: Vec<SessionNode>,
    /// Variables to add to the build's environment.
    pub env: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct TearDownResponse {
    pub session_id: SessionId,
    pub suspended: Vec<String>,
    pub destroyed: Vec<String>,
    pub already_gone: Vec<String>,
    /// Node ids that could not be terminated.
    pub failed: Vec<String>,
}

impl TearDownResponse {
    fn new(session_id: SessionId, report: TerminationReport) -> Self {
        Self {
            session_id,
            failed: report.failures.iter().map(|f| f.node_id.clone()).collect(),
            suspended: report.suspended,
            destroyed: report.destroyed,
            already_gone: report.already_gone,
        }
    }
}

async fn create_session(
    State(state): State<ApiState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.instances.iter().all(|i| i.count == 0) {
        return Err(ApiError::bad_request(
            "invalid_request",
            "at least one instance must be requested",
        ));
    }

    let env = state.supplemental.set_up(&req.instances).await?;
    let nodes = env
        .nodes()
        .iter()
        .map(|n| SessionNode {
            cloud: n.cloud_name.clone(),
            template: n.template_name.clone(),
            node_id: n.node_id().to_string(),
            name: n.node.name.clone(),
        })
        .collect();
    let vars = env.env_vars();
    let session_id = state.sessions.insert(env);
    info!(session_id = %session_id, "Build session ready");

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id,
            nodes,
            env: vars,
        }),
    ))
}

async fn tear_down_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id: SessionId = session_id
        .parse()
        .map_err(|e| ApiError::bad_request("invalid_session_id", format!("{e}")))?;
    let env = state.sessions.take(&session_id).ok_or_else(|| {
        ApiError::not_found("unknown_session", format!("no session {session_id}"))
    })?;

    let report = env.tear_down().await;
    let status = if report.is_clean() {
        StatusCode::OK
    } else {
        warn!(session_id = %session_id, failed = report.failures.len(), "Session teardown incomplete");
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(TearDownResponse::new(session_id, report))))
}
