//! Core gateway orchestration service.
//!
//! The `GatewayService` aggregates the runtime state built from a
//! `ServerConfig`: the route table, the service registry, the circuit
//! breakers and the proxy manager. It provides:
//! * Longest‑prefix route lookup (through [`Router`])
//! * Bearer token authentication against the injected validator
//! * Background tasks: registry watches feeding the proxy cache and the
//!   periodic rate limit sweep
//!
//! I/O happens only through the injected ports, so the whole aggregate can
//! be driven in tests with in-memory backends and clients.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr, eyre};
use http::{HeaderMap, header};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ServerConfig, parse_duration},
    core::{
        circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerSettings},
        proxy_manager::ProxyManager,
        registry::{RegistrySettings, ServiceRegistry},
        router::{Route, Router},
    },
    ports::{
        auth::{AuthError, Identity, TokenValidator},
        discovery::DiscoveryBackend,
        http_client::HttpClient,
    },
};

/// Central orchestrator for routing, proxying and admission control.
///
/// Construct with [`GatewayService::new`]; share behind an `Arc`.
pub struct GatewayService {
    router: Router,
    registry: Arc<ServiceRegistry>,
    proxy: Arc<ProxyManager>,
    validator: Option<Arc<dyn TokenValidator>>,
    services: Vec<String>,
    sweep_interval: Duration,
}

impl GatewayService {
    /// Build the runtime state from configuration and the injected ports.
    pub fn new(
        config: &ServerConfig,
        backend: Arc<dyn DiscoveryBackend>,
        client: Arc<dyn HttpClient>,
        validator: Option<Arc<dyn TokenValidator>>,
    ) -> Result<Self> {
        let registry_settings =
            RegistrySettings::try_from(&config.registry).map_err(|e| eyre!(e))?;
        let breaker_settings =
            CircuitBreakerSettings::try_from(&config.circuit_breaker).map_err(|e| eyre!(e))?;
        let sweep_interval = parse_duration(&config.rate_limit_sweep_interval)
            .wrap_err("Invalid rate_limit_sweep_interval")?;
        let router = Router::new(&config.routes)
            .map_err(|e| eyre!(e))
            .wrap_err("Failed to build route table")?;

        let registry = Arc::new(ServiceRegistry::new(backend, registry_settings));
        let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_settings));
        let proxy = Arc::new(ProxyManager::new(registry.clone(), breakers, client));

        if validator.is_none() && config.routes.iter().any(|r| r.auth_required) {
            tracing::warn!("Routes require auth but no token validator is configured");
        }

        Ok(Self {
            router,
            registry,
            proxy,
            validator,
            services: config.routed_services(),
            sweep_interval,
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn proxy(&self) -> &Arc<ProxyManager> {
        &self.proxy
    }

    /// Services referenced by at least one route
    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Validate the bearer token of a request for `route`.
    ///
    /// Routes without `auth_required` never consult the validator.
    pub async fn authenticate(
        &self,
        route: &Route,
        headers: &HeaderMap,
    ) -> Result<Option<Identity>, AuthError> {
        if !route.auth_required {
            return Ok(None);
        }
        let validator = self
            .validator
            .as_ref()
            .ok_or_else(|| AuthError::Unavailable("no token validator configured".to_string()))?;
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        validator.validate(token).await.map(Some)
    }

    /// Remove idle rate limit state from every route
    pub async fn sweep_rate_limits(&self) -> usize {
        let mut removed = 0;
        for limiter in self.router.rate_limiters() {
            removed += limiter.sweep().await;
        }
        removed
    }

    /// Start registry watches for all routed services and the rate limit
    /// sweeper. Every task stops when `shutdown` is cancelled.
    pub fn start_background_tasks(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = self.proxy.spawn_watchers(&self.services, shutdown.clone());

        let gateway = self.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gateway.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = gateway.sweep_rate_limits().await;
                        if removed > 0 {
                            tracing::debug!(removed, "Swept idle rate limit windows");
                        }
                    }
                }
            }
        }));

        tracing::info!(
            services = self.services.len(),
            "Started registry watches and rate limit sweeper"
        );
        handles
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty())
}
