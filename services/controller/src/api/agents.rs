//! Managed agent endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use super::ApiState;
use crate::agent::ManagedAgent;
use crate::sweeper::DeleteOutcome;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/", get(list_agents).post(launch_agent))
        .route("/{name}", delete(delete_agent))
}

#[derive(Debug, Deserialize)]
pub struct LaunchAgentRequest {
    pub cloud: String,
    pub template: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct AgentResponse {
    pub name: String,
    pub cloud: String,
    pub template: String,
    pub node_id: String,
    pub online: bool,
    pub executors: u32,
    pub pending_delete: bool,
}

impl From<&ManagedAgent> for AgentResponse {
    fn from(agent: &ManagedAgent) -> Self {
        let state = agent.snapshot();
        Self {
            name: agent.name().to_string(),
            cloud: agent.node().cloud_name.clone(),
            template: agent.node().template_name.clone(),
            node_id: agent.node().node_id().to_string(),
            online: state.online,
            executors: state.executors,
            pending_delete: state.pending_delete,
        }
    }
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct DeleteResponse {
    pub agent: String,
    pub outcome: DeleteOutcome,
}

async fn list_agents(State(state): State<ApiState>) -> impl IntoResponse {
    let agents: Vec<AgentResponse> = state
        .inventory
        .list()
        .iter()
        .map(|a| AgentResponse::from(a.as_ref()))
        .collect();
    Json(agents)
}

/// Provision one agent. Returns once it is online, which includes the
/// phone-home wait if its template asks for one.
async fn launch_agent(
    State(state): State<ApiState>,
    Json(req): Json<LaunchAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.cloud.is_empty() || req.template.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_request",
            "cloud and template are required",
        ));
    }

    let agent = state.launcher.launch(&req.cloud, &req.template).await?;
    info!(agent = %agent.name(), "Agent launched on request");
    Ok((StatusCode::CREATED, Json(AgentResponse::from(agent.as_ref()))))
}

async fn delete_agent(State(state): State<ApiState>, Path(name): Path<String>) -> impl IntoResponse {
    let outcome = state.sweeper.request_delete(&name).await;
    let status = match outcome {
        DeleteOutcome::UnknownAgent => StatusCode::NOT_FOUND,
        DeleteOutcome::Deleted => StatusCode::OK,
        DeleteOutcome::Flagged | DeleteOutcome::Postponed => StatusCode::ACCEPTED,
        DeleteOutcome::Failed => StatusCode::BAD_GATEWAY,
    };
    (status, Json(DeleteResponse { agent: name, outcome }))
}
