//! Request-level failure kinds and their client-facing HTTP mapping.
use std::time::Duration;

use axum::{
    body::Body as AxumBody,
    http::{StatusCode, header},
    response::Response,
};
use thiserror::Error;

use crate::ports::{auth::AuthError, discovery::DiscoveryError};

/// Every way the gateway can refuse or fail a request.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("No route matches path '{path}'")]
    BadRoute { path: String },

    #[error("Rate limit exceeded for route '{route}'")]
    RateLimitExceeded { route: String },

    #[error("Circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Service discovery failed for '{service}': {source}")]
    Discovery {
        service: String,
        #[source]
        source: DiscoveryError,
    },

    #[error("No healthy instance available for service '{service}'")]
    NoHealthyInstance { service: String },

    #[error("Upstream {instance} timed out after {timeout:?}")]
    UpstreamTimeout { instance: String, timeout: Duration },

    #[error("Upstream {instance} connection failed: {reason}")]
    UpstreamConnection { instance: String, reason: String },

    #[error("Upstream {instance} answered with status {status}")]
    UpstreamStatus { instance: String, status: StatusCode },

    #[error("All {attempts} attempts against service '{service}' failed: {last_error}")]
    BadGateway {
        service: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
}

impl GatewayError {
    /// Status code written to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRoute { .. } => StatusCode::NOT_FOUND,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. }
            | GatewayError::Discovery { .. }
            | GatewayError::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamTimeout { .. }
            | GatewayError::UpstreamConnection { .. }
            | GatewayError::UpstreamStatus { .. }
            | GatewayError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Stable machine-readable name used in error bodies and logs
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadRoute { .. } => "bad_route",
            GatewayError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Discovery { .. } => "discovery_error",
            GatewayError::NoHealthyInstance { .. } => "no_healthy_instance",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::UpstreamConnection { .. } => "upstream_connection_error",
            GatewayError::UpstreamStatus { .. } => "upstream_error_status",
            GatewayError::BadGateway { .. } => "bad_gateway",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::PayloadTooLarge { .. } => "payload_too_large",
        }
    }

    /// Build the JSON error response, tagging it with correlation fields.
    pub fn to_response(
        &self,
        request_id: &str,
        route: Option<&str>,
        service: Option<&str>,
    ) -> Response<AxumBody> {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
            "request_id": request_id,
            "route": route,
            "service": service,
        });

        let mut response = Response::new(AxumBody::from(body.to_string()));
        *response.status_mut() = self.status_code();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let GatewayError::Unauthorized(_) = self {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}
