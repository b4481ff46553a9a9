//! Ingress middleware shared by every gateway request.
//!
//! Ordering is fixed by [`crate::adapters::HttpHandler`]: request ID
//! assignment runs outermost so the timing log and every later stage see the
//! same correlation ID, then request logging, then deadline extraction.
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::time::Instant;
use tracing::Instrument;

use crate::{
    config::parse_duration,
    core::{GatewayError, proxy_manager::{Deadline, X_REQUEST_ID}},
    metrics,
};

/// Client supplied overall deadline for a request, as a humantime duration
pub const X_REQUEST_TIMEOUT: HeaderName = HeaderName::from_static("x-request-timeout");

const MAX_REQUEST_ID_LEN: usize = 128;

/// Correlation ID assigned to the inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Assign a request ID, reusing a well-formed inbound `X-Request-ID`, and run
/// the rest of the chain inside a span carrying it. The ID is echoed back in
/// the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(request_id.clone()));

    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID, header_value);
    }

    response
}

/// Log start/end of a request including latency, and record request metrics.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let version = req.version();

    tracing::debug!("Started processing {} {} {:?}", method, uri, version);

    let response = next.run(req).await;
    let duration = start.elapsed();

    tracing::info!(
        "Completed {} {} {:?} - {} in {:?}",
        method,
        uri,
        version,
        response.status(),
        duration
    );
    metrics::record_request(method.as_str(), response.status().as_u16(), duration);

    response
}

/// Turn an `X-Request-Timeout` header into a [`Deadline`] extension.
///
/// Malformed values, and durations too large to form a deadline, are
/// rejected with 400 rather than silently ignored.
pub async fn deadline_middleware(mut req: Request, next: Next) -> Response {
    let Some(value) = req.headers().get(X_REQUEST_TIMEOUT) else {
        return next.run(req).await;
    };

    let deadline = value
        .to_str()
        .ok()
        .and_then(|v| parse_duration(v.trim()).ok())
        .and_then(|timeout| Instant::now().checked_add(timeout));
    match deadline {
        Some(deadline) => {
            req.extensions_mut().insert(Deadline(deadline));
            next.run(req).await
        }
        None => {
            let request_id = req
                .extensions()
                .get::<RequestId>()
                .map(|id| id.0.clone())
                .unwrap_or_default();
            let err = GatewayError::InvalidRequest(format!(
                "invalid {X_REQUEST_TIMEOUT} header"
            ));
            tracing::warn!(request_id = %request_id, error = %err, "Rejected request");
            err.to_response(&request_id, None, None).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        Extension, Router,
        body::Body,
        http::{HeaderValue, StatusCode},
        middleware,
        routing::get,
    };
    use tower::ServiceExt; // for oneshot

    use super::*;

    fn echo_id_app() -> Router {
        Router::new()
            .route(
                "/",
                get(|Extension(id): Extension<RequestId>| async move { id.0 }),
            )
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_request_id_generated() {
        let response = echo_id_app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let request_id = response.headers().get("X-Request-ID").unwrap().to_str().unwrap();
        assert!(uuid::Uuid::parse_str(request_id).is_ok());
    }

    #[tokio::test]
    async fn test_request_id_reused_from_client() {
        let response = echo_id_app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Request-ID", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response.headers().get("X-Request-ID").unwrap(),
            HeaderValue::from_static("abc-123")
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"abc-123");
    }

    #[tokio::test]
    async fn test_oversized_request_id_replaced() {
        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        let response = echo_id_app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Request-ID", long.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(response.headers().get("X-Request-ID").unwrap(), long.as_str());
    }

    fn deadline_app() -> Router {
        Router::new()
            .route(
                "/",
                get(|req: Request| async move {
                    match req.extensions().get::<Deadline>() {
                        Some(Deadline(at)) => {
                            let left = at.saturating_duration_since(Instant::now());
                            format!("{}", left <= Duration::from_secs(2))
                        }
                        None => "none".to_string(),
                    }
                }),
            )
            .layer(middleware::from_fn(deadline_middleware))
    }

    async fn body_of(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_deadline_from_header() {
        let response = deadline_app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Request-Timeout", "2s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "true");

        let response = deadline_app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "none");
    }

    #[tokio::test]
    async fn test_invalid_deadline_rejected() {
        let response = deadline_app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Request-Timeout", "soon")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_rejected() {
        let response = deadline_app()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("X-Request-Timeout", "18000000000000000000s")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
