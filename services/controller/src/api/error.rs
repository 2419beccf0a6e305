use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::clouds::CapacityError;
use crate::launcher::LaunchError;
use crate::phone_home::PhoneHomeError;
use crate::session::SessionError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ProblemDetails {
    pub title: String,
    pub status: u16,
    pub code: String,
    pub detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            status,
            problem: Box::new(ProblemDetails {
                title,
                status: status.as_u16(),
                code: code.into(),
                detail: detail.into(),
            }),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<CapacityError> for ApiError {
    fn from(e: CapacityError) -> Self {
        match e {
            CapacityError::UnknownCloud(_) => Self::not_found("unknown_cloud", e.to_string()),
            CapacityError::CapReached { .. } => {
                Self::conflict("instance_cap_reached", e.to_string())
            }
            CapacityError::Driver { .. } => Self::bad_gateway("cloud_error", e.to_string()),
        }
    }
}

fn phone_home_error(e: &PhoneHomeError, message: String) -> ApiError {
    match e {
        PhoneHomeError::Timeout { .. } => ApiError::gateway_timeout("phone_home_timeout", message),
        _ => ApiError::bad_gateway("phone_home_failed", message),
    }
}

impl From<LaunchError> for ApiError {
    fn from(e: LaunchError) -> Self {
        match e {
            LaunchError::UnknownTemplate { .. } => Self::not_found("unknown_template", e.to_string()),
            LaunchError::Capacity(e) => e.into(),
            LaunchError::Provision(_) => Self::bad_gateway("provisioning_failed", e.to_string()),
            LaunchError::PhoneHome { ref source, .. } => phone_home_error(source, e.to_string()),
            LaunchError::NoAddress { .. } => Self::bad_gateway("no_address", e.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::UnknownTemplate { .. } => {
                Self::not_found("unknown_template", e.to_string())
            }
            SessionError::Capacity(e) => e.into(),
            SessionError::Provision(_) => Self::bad_gateway("provisioning_failed", e.to_string()),
            SessionError::PhoneHome(ref source) => phone_home_error(source, e.to_string()),
        }
    }
}
