//! HTTP surface: agent callbacks, agent and session management, health.

mod agents;
mod error;
mod phone_home;
mod sessions;

use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;

pub use agents::{AgentResponse, DeleteResponse, LaunchAgentRequest};
pub use error::{ApiError, ProblemDetails};
pub use phone_home::{PhoneHomeQuery, PhoneHomeResponse};
pub use sessions::{CreateSessionRequest, SessionNode, SessionResponse, TearDownResponse};

use crate::agent::AgentInventory;
use crate::launcher::AgentLauncher;
use crate::phone_home::PhoneHomeRegistry;
use crate::session::{BuildSessions, SupplementalInstances};
use crate::sweeper::CleanupSweeper;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub phone_home: Arc<PhoneHomeRegistry>,
    pub inventory: Arc<AgentInventory>,
    pub launcher: Arc<AgentLauncher>,
    pub sweeper: Arc<CleanupSweeper>,
    pub supplemental: Arc<SupplementalInstances>,
    pub sessions: Arc<BuildSessions>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    /// ISO 8601.
    pub timestamp: String,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/phone-home", phone_home::routes())
        .nest("/agents", agents::routes())
        .nest("/sessions", sessions::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "cloudfleet-controller".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}
