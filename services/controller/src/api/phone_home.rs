//! Bootstrap callbacks from freshly created nodes.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::ApiError;
use super::ApiState;

pub fn routes() -> Router<ApiState> {
    Router::new().route("/", post(phone_home))
}

#[derive(Debug, Deserialize)]
pub struct PhoneHomeQuery {
    pub instance_id: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct PhoneHomeResponse {
    pub instance_id: String,
    /// Monitors that were waiting for this instance.
    pub matched: usize,
}

/// Rings every registered monitor; an instance nobody waits for is not an
/// error.
async fn phone_home(
    State(state): State<ApiState>,
    Query(query): Query<PhoneHomeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let instance_id = query.instance_id.trim().to_string();
    if instance_id.is_empty() {
        return Err(ApiError::bad_request(
            "invalid_request",
            "instance_id is required",
        ));
    }

    let matched = state.phone_home.ring(&instance_id);
    if matched == 0 {
        debug!(instance_id = %instance_id, "Phone home from instance no active wait expects");
    } else {
        info!(instance_id = %instance_id, matched, "Instance phoned home");
    }
    Ok(Json(PhoneHomeResponse {
        instance_id,
        matched,
    }))
}
