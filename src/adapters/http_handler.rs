use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{HeaderName, HeaderValue, StatusCode, header},
    middleware,
    response::Response,
};
use tower_http::catch_panic::CatchPanicLayer;

use crate::{
    adapters::middleware::{
        RequestId, deadline_middleware, request_id_middleware, request_timing_middleware,
    },
    core::{GatewayError, GatewayService, ForwardContext, Route},
    metrics,
    ports::auth::AuthError,
};

/// Identity of an authenticated caller, forwarded to the upstream
pub const X_AUTH_IDENTITY: HeaderName = HeaderName::from_static("x-auth-identity");

/// HTTP handler for the Switchyard gateway
#[derive(Clone)]
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>) -> Self {
        Self { gateway }
    }

    /// Axum router serving every path through [`Self::handle_request`] behind
    /// the ingress middleware chain.
    pub fn into_router(self) -> Router {
        let handler = Arc::new(self);
        Router::new()
            .fallback(move |req: Request| {
                let handler = handler.clone();
                async move { handler.handle_request(req).await }
            })
            .layer(CatchPanicLayer::new())
            .layer(middleware::from_fn(deadline_middleware))
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(middleware::from_fn(request_id_middleware))
    }

    /// Main request handler that routes requests appropriately
    pub async fn handle_request(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        match req.uri().path() {
            "/health" => self.handle_health_check(),
            "/ready" => self.handle_ready().await,
            "/gateway/admin/routes" => self.handle_admin_routes(),
            "/gateway/admin/services" => self.handle_admin_services().await,
            _ => self.handle_proxy_request(req).await,
        }
    }

    /// Liveness: the process is up and serving
    fn handle_health_check(&self) -> Response<AxumBody> {
        json_response(
            StatusCode::OK,
            serde_json::json!({
                "status": "ok",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        )
    }

    /// Readiness: every routed service has at least one healthy instance in
    /// its cached snapshot.
    async fn handle_ready(&self) -> Response<AxumBody> {
        let mut services = serde_json::Map::new();
        let mut ready = true;
        for service in self.gateway.services() {
            let healthy = match self.gateway.registry().cached(service).await {
                Some(snapshot) => snapshot.len(),
                None => 0,
            };
            ready &= healthy > 0;
            services.insert(
                service.clone(),
                serde_json::json!({ "healthy_instances": healthy }),
            );
        }

        let status = if ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        json_response(
            status,
            serde_json::json!({
                "status": if ready { "ready" } else { "not_ready" },
                "services": services,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        )
    }

    fn handle_admin_routes(&self) -> Response<AxumBody> {
        let routes: Vec<_> = self
            .gateway
            .router()
            .routes()
            .iter()
            .map(|route| {
                serde_json::json!({
                    "path_prefix": route.prefix,
                    "service_name": route.service,
                    "auth_required": route.auth_required,
                    "timeout": humantime::format_duration(route.timeout).to_string(),
                    "retry_attempts": route.retry_attempts,
                    "load_balancer": route.strategy.to_string(),
                    "strip_prefix": route.strip_prefix,
                    "rate_limited": route.rate_limiter.is_some(),
                })
            })
            .collect();
        json_response(StatusCode::OK, serde_json::json!({ "routes": routes }))
    }

    async fn handle_admin_services(&self) -> Response<AxumBody> {
        let circuits = self.gateway.proxy().breakers().statuses().await;
        let mut services = serde_json::Map::new();
        for service in self.gateway.services() {
            let snapshot = self.gateway.registry().cached(service).await;
            let circuit = circuits
                .iter()
                .find(|(name, _)| name == service)
                .map(|(_, status)| status);
            services.insert(
                service.clone(),
                serde_json::json!({
                    "instances": snapshot.as_ref().map(|s| s.instances.to_vec()),
                    "stale": snapshot.as_ref().is_some_and(|s| s.stale),
                    "circuit": circuit,
                }),
            );
        }
        json_response(StatusCode::OK, serde_json::json!({ "services": services }))
    }

    /// Run the admission chain for a proxied request and forward it.
    ///
    /// Order: route match, rate limit, circuit pre-check, authentication,
    /// then the proxy manager.
    async fn handle_proxy_request(&self, mut req: Request<AxumBody>) -> Response<AxumBody> {
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let path = req.uri().path().to_string();

        let Some(route) = self.gateway.router().match_route(&path) else {
            return reject(GatewayError::BadRoute { path }, &request_id, None);
        };

        if let Some(limiter) = &route.rate_limiter {
            let client = limiter.client_key(&req);
            if !limiter.check_client(client).await.is_allowed() {
                metrics::record_rate_limited(&route.prefix);
                let err = GatewayError::RateLimitExceeded {
                    route: route.prefix.clone(),
                };
                return reject(err, &request_id, Some(&route));
            }
        }

        let permit = match self.gateway.proxy().admit(&route.service).await {
            Ok(permit) => permit,
            Err(err) => return reject(err, &request_id, Some(&route)),
        };

        // Never trust an identity asserted by the client
        req.headers_mut().remove(X_AUTH_IDENTITY);
        match self.gateway.authenticate(&route, req.headers()).await {
            Ok(Some(identity)) => match HeaderValue::from_str(&identity.subject) {
                Ok(value) => {
                    req.headers_mut().insert(X_AUTH_IDENTITY, value);
                }
                Err(_) => {
                    let err = GatewayError::Unauthorized(AuthError::InvalidToken);
                    return reject(err, &request_id, Some(&route));
                }
            },
            Ok(None) => {}
            Err(err) => return reject(err.into(), &request_id, Some(&route)),
        }

        let ctx = ForwardContext {
            request_id: request_id.clone(),
            client_ip: req
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|connect_info| connect_info.0.ip()),
        };

        match self.gateway.proxy().forward(&route, permit, req, &ctx).await {
            Ok(response) => response,
            Err(err) => reject(err, &request_id, Some(&route)),
        }
    }
}

fn reject(err: GatewayError, request_id: &str, route: Option<&Route>) -> Response<AxumBody> {
    let prefix = route.map(|r| r.prefix.as_str());
    let service = route.map(|r| r.service.as_str());
    if err.status_code().is_server_error() {
        tracing::warn!(
            request_id,
            route = prefix,
            service,
            error = %err,
            kind = err.kind(),
            "Request failed"
        );
    } else {
        tracing::info!(
            request_id,
            route = prefix,
            service,
            error = %err,
            kind = err.kind(),
            "Request rejected"
        );
    }
    err.to_response(request_id, prefix, service)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
