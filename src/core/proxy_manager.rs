//! Forward-with-retry orchestration for one matched route.
//!
//! Per request the manager admits the call through the service's circuit
//! breaker, takes one registry snapshot, buffers the body once and then walks
//! up to `retry_attempts` instances picked by the route's balancer. Instances
//! that already failed are excluded while untried ones remain. Any upstream
//! answer below 500 ends the loop and is returned verbatim; transport errors,
//! timeouts and 5xx count as breaker failures and move on to the next attempt.
use std::{collections::HashSet, net::IpAddr, sync::Arc};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, header, request::Parts};
use scc::{HashMap, hash_map::Entry};
use tokio::{task::JoinHandle, time::Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        circuit_breaker::{CircuitBreakerRegistry, CircuitPermit, CircuitState},
        errors::GatewayError,
        instance::{InstanceSnapshot, ServiceInstance},
        load_balancer::InFlightGuard,
        registry::ServiceRegistry,
        router::Route,
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_FORWARDED_TIMESTAMP: HeaderName = HeaderName::from_static("x-forwarded-timestamp");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Largest inbound body buffered for retries
pub const MAX_BUFFERED_BODY: usize = 16 * 1024 * 1024;

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Latest instant by which the client expects an answer.
///
/// Inserted into request extensions by the ingress layer when the client
/// announced a deadline; every attempt is bounded by it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(pub Instant);

/// Per-request values that travel with every attempt
#[derive(Debug, Clone, Default)]
pub struct ForwardContext {
    pub request_id: String,
    pub client_ip: Option<IpAddr>,
}

/// Cached per-instance forwarding state. Holds connection-reuse data only;
/// which instance serves a request is decided fresh every time.
#[derive(Debug)]
pub struct ProxyTarget {
    pub service: String,
    pub instance_id: String,
    pub base_url: String,
    pub created_at: Instant,
}

pub struct ProxyManager {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    client: Arc<dyn HttpClient>,
    targets: HashMap<(String, String), Arc<ProxyTarget>>,
}

impl ProxyManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            registry,
            breakers,
            client,
            targets: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Circuit pre-check. Fails with `CircuitOpen` without touching upstream.
    pub async fn admit(&self, service: &str) -> Result<CircuitPermit, GatewayError> {
        let breaker = self.breakers.get(service).await;
        breaker.try_acquire().ok_or_else(|| {
            metrics::record_circuit_rejection(service);
            GatewayError::CircuitOpen {
                service: service.to_string(),
            }
        })
    }

    /// Admit and forward in one step.
    pub async fn handle(
        &self,
        route: &Route,
        request: Request<AxumBody>,
        ctx: &ForwardContext,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let permit = self.admit(&route.service).await?;
        self.forward(route, permit, request, ctx).await
    }

    /// Forward an admitted request following the route's retry policy.
    ///
    /// Wall-clock time is bounded by `attempts × route.timeout` and by the
    /// client's [`Deadline`] when one is present.
    ///
    /// Retries stop early with `CircuitOpen` once the service's breaker has
    /// left the closed state, including when this request's own failures
    /// tripped it; the remaining attempts are not sent.
    pub async fn forward(
        &self,
        route: &Route,
        permit: CircuitPermit,
        request: Request<AxumBody>,
        ctx: &ForwardContext,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let service = route.service.as_str();
        let snapshot = self
            .registry
            .get_instances(service)
            .await
            .map_err(|source| GatewayError::Discovery {
                service: service.to_string(),
                source,
            })?;
        if snapshot.is_empty() {
            return Err(GatewayError::NoHealthyInstance {
                service: service.to_string(),
            });
        }

        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_BUFFERED_BODY)
            .await
            .map_err(|e| {
                if is_length_limit(&e) {
                    GatewayError::PayloadTooLarge {
                        limit: MAX_BUFFERED_BODY,
                    }
                } else {
                    GatewayError::InvalidRequest(format!("Failed to read request body: {e}"))
                }
            })?;

        let attempts = route.attempts();
        // Unrepresentable budgets leave only the per-attempt timeout in force
        let overall_deadline = route
            .timeout
            .checked_mul(attempts)
            .and_then(|budget| Instant::now().checked_add(budget));
        let client_deadline = parts.extensions.get::<Deadline>().map(|d| d.0);
        let deadline = match (overall_deadline, client_deadline) {
            (Some(overall), Some(client)) => Some(overall.min(client)),
            (overall, client) => overall.or(client),
        };
        let breaker = permit.breaker().clone();

        let mut tried: HashSet<String> = HashSet::new();
        let mut last_error: Option<GatewayError> = None;
        let mut made = 0;

        for attempt in 1..=attempts {
            if attempt > 1 && breaker.state() != CircuitState::Closed {
                tracing::warn!(service, attempt, "Circuit left closed state during retries");
                return Err(GatewayError::CircuitOpen {
                    service: service.to_string(),
                });
            }

            let attempt_timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        tracing::debug!(service, attempt, "Request deadline reached");
                        break;
                    }
                    route.timeout.min(remaining)
                }
                None => route.timeout,
            };

            let Some(instance) = select_instance(route, &snapshot, &mut tried, ctx.client_ip)
            else {
                return Err(GatewayError::NoHealthyInstance {
                    service: service.to_string(),
                });
            };
            if attempt > 1 {
                metrics::record_retry(service);
            }
            made = attempt;

            let target = self.target_for(&instance).await;
            let upstream = build_upstream_request(route, &parts, body.clone(), &target, ctx)?;

            tracing::debug!(
                service,
                instance = %instance.id,
                attempt,
                timeout = ?attempt_timeout,
                request_id = %ctx.request_id,
                "Forwarding request"
            );
            let attempt_started = Instant::now();
            let in_flight = InFlightGuard::new(&route.balancer, &instance.id);
            let outcome =
                tokio::time::timeout(attempt_timeout, self.client.send_request(upstream)).await;
            drop(in_flight);
            let elapsed = attempt_started.elapsed();

            let error = match outcome {
                Ok(Ok(response)) if !response.status().is_server_error() => {
                    permit.record_success();
                    metrics::record_upstream_attempt(service, "success", elapsed);
                    return Ok(response);
                }
                Ok(Ok(response)) => GatewayError::UpstreamStatus {
                    instance: instance.to_string(),
                    status: response.status(),
                },
                Ok(Err(HttpClientError::Timeout(timeout))) => GatewayError::UpstreamTimeout {
                    instance: instance.to_string(),
                    timeout,
                },
                Ok(Err(e)) => GatewayError::UpstreamConnection {
                    instance: instance.to_string(),
                    reason: e.to_string(),
                },
                Err(_) => GatewayError::UpstreamTimeout {
                    instance: instance.to_string(),
                    timeout: attempt_timeout,
                },
            };

            permit.record_failure();
            metrics::record_upstream_attempt(service, error.kind(), elapsed);
            tracing::warn!(
                service,
                instance = %instance.id,
                attempt,
                attempts,
                error = %error,
                request_id = %ctx.request_id,
                "Upstream attempt failed"
            );
            tried.insert(instance.id.clone());
            last_error = Some(error);
        }

        drop(permit);
        Err(GatewayError::BadGateway {
            service: service.to_string(),
            attempts: made,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "request deadline exceeded".to_string()),
        })
    }

    async fn target_for(&self, instance: &ServiceInstance) -> Arc<ProxyTarget> {
        let key = (instance.name.clone(), instance.id.clone());
        let base_url = instance.base_url();
        if let Some(existing) = self.targets.read_async(&key, |_, t| t.clone()).await {
            // Same ID re-registered at a new address gets a new target
            if existing.base_url == base_url {
                return existing;
            }
        }

        let target = Arc::new(ProxyTarget {
            service: instance.name.clone(),
            instance_id: instance.id.clone(),
            base_url,
            created_at: Instant::now(),
        });
        match self.targets.entry_async(key).await {
            Entry::Occupied(mut entry) => {
                *entry.get_mut() = target.clone();
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(target.clone());
            }
        }
        target
    }

    /// Drop cached targets for instances missing from `snapshot`.
    pub async fn on_snapshot(&self, snapshot: &InstanceSnapshot) -> usize {
        let mut removed = 0;
        self.targets
            .retain_async(|key, _| {
                let keep = key.0 != snapshot.service || snapshot.contains(&key.1);
                if !keep {
                    removed += 1;
                }
                keep
            })
            .await;
        if removed > 0 {
            tracing::info!(
                service = %snapshot.service,
                removed,
                instances = snapshot.len(),
                "Purged proxy targets for removed instances"
            );
        }
        removed
    }

    /// Instance IDs with a cached target for `service`
    pub async fn cached_targets(&self, service: &str) -> Vec<String> {
        let mut ids = Vec::new();
        self.targets
            .retain_async(|key, _| {
                if key.0 == service {
                    ids.push(key.1.clone());
                }
                true
            })
            .await;
        ids.sort();
        ids
    }

    /// One registry watch per service feeding [`Self::on_snapshot`].
    pub fn spawn_watchers(
        self: &Arc<Self>,
        services: &[String],
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        services
            .iter()
            .map(|service| {
                let manager = self.clone();
                let mut updates = self.registry.watch(service, shutdown.clone());
                let service = service.clone();
                tokio::spawn(async move {
                    while let Some(snapshot) = updates.next().await {
                        tracing::debug!(
                            service = %service,
                            instances = snapshot.len(),
                            "Membership changed"
                        );
                        manager.on_snapshot(&snapshot).await;
                    }
                })
            })
            .collect()
    }
}

/// Pick the next instance, skipping ones that failed earlier in this request
/// until every instance has been tried.
fn select_instance(
    route: &Route,
    snapshot: &InstanceSnapshot,
    tried: &mut HashSet<String>,
    client: Option<IpAddr>,
) -> Option<ServiceInstance> {
    if tried.is_empty() {
        return route.balancer.select(&snapshot.instances, client).cloned();
    }
    let untried: Vec<ServiceInstance> = snapshot
        .instances
        .iter()
        .filter(|i| !tried.contains(&i.id))
        .cloned()
        .collect();
    if untried.is_empty() {
        tried.clear();
        return route.balancer.select(&snapshot.instances, client).cloned();
    }
    route.balancer.select(&untried, client).cloned()
}

/// Whether a body read failed because it exceeded the buffering limit
fn is_length_limit(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = source {
        if err.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = err.source();
    }
    false
}

fn build_upstream_request(
    route: &Route,
    parts: &Parts,
    body: Bytes,
    target: &ProxyTarget,
    ctx: &ForwardContext,
) -> Result<Request<AxumBody>, GatewayError> {
    let path = route.forward_path(parts.uri.path());
    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let uri: Uri = format!("{}{path_and_query}", target.base_url)
        .parse()
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid upstream URI: {e}")))?;

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);

    let header_value = |value: &str| {
        HeaderValue::from_str(value)
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid header value: {e}")))
    };
    headers.insert(X_REQUEST_ID, header_value(&ctx.request_id)?);
    headers.insert(
        X_FORWARDED_TIMESTAMP,
        header_value(&chrono::Utc::now().to_rfc3339())?,
    );
    if let Some(ip) = ctx.client_ip {
        let forwarded_for = match parts
            .headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip.to_string(),
        };
        headers.insert(X_FORWARDED_FOR, header_value(&forwarded_for)?);
    }
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    headers
        .entry(X_FORWARDED_PROTO)
        .or_insert(HeaderValue::from_static("http"));

    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(AxumBody::from(body))
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = headers;
    Ok(request)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in `Connection` are connection-scoped too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}
