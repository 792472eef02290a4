use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

/// Errors surfaced by the registries, the agent ledger and the provisioning flow.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("identity mismatch: {0}")]
    Mismatch(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("render failure: {0}")]
    Render(String),

    #[error("exhausted: {0}")]
    Exhausted(String),

    #[error("upload rejected: {0}")]
    Upload(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error("container start failed: {0}")]
    ContainerStart(String),

    #[error("agent {0} did not become ready in time")]
    ReadinessTimeout(String),

    #[error("route registration failed: {0}")]
    RouteRegistration(String),

    #[error("agent {0} was not reported by its container")]
    AgentNotFound(String),

    #[error("container operation failed: {0}")]
    ContainerOp(String),

    #[error("external service failure: {0}")]
    ExternalService(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Validation(vec![reason.into()])
    }

    /// Wrap an `anyhow` chain from the file store.
    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{:#}", err))
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Mismatch(_) => "mismatch",
            Self::Persistence(_) => "persistence_error",
            Self::Render(_) => "render_error",
            Self::Exhausted(_) => "exhausted",
            Self::Upload(_) => "upload_error",
            Self::ImagePull(_) => "image_pull_error",
            Self::PortAllocation(_) => "port_allocation_error",
            Self::ContainerStart(_) => "container_start_error",
            Self::ReadinessTimeout(_) => "readiness_timeout",
            Self::RouteRegistration(_) => "route_registration_error",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::ContainerOp(_) => "container_op_error",
            Self::ExternalService(_) => "external_service_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upload(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Mismatch(_) => StatusCode::CONFLICT,
            Self::Exhausted(_) | Self::PortAllocation(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ExternalService(_) | Self::AgentNotFound(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence(_)
            | Self::Render(_)
            | Self::ImagePull(_)
            | Self::ContainerStart(_)
            | Self::ReadinessTimeout(_)
            | Self::RouteRegistration(_)
            | Self::ContainerOp(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_code: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Caller mistakes are reported verbatim; server-side causes only reach the log.
        let body = if status.is_server_error() {
            error!(error_code = self.error_code(), "Request failed: {}", self);
            ErrorBody {
                error: "Server error, try again later or contact the node operator".to_string(),
                error_code: self.error_code(),
                details: Vec::new(),
            }
        } else {
            let details = match &self {
                Self::Validation(reasons) => reasons.clone(),
                _ => Vec::new(),
            };
            ErrorBody {
                error: self.to_string(),
                error_code: self.error_code(),
                details,
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_lists_every_reason() {
        let err = GatewayError::Validation(vec![
            "name field is required".to_string(),
            "address field is required".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: name field is required; address field is required"
        );
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_server_errors_map_to_5xx() {
        assert!(GatewayError::Render("bad".into()).status_code().is_server_error());
        assert!(GatewayError::ContainerOp("stop".into()).status_code().is_server_error());
        assert_eq!(
            GatewayError::NotFound("client x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
