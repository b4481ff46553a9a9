//! Configuration data structures for Switchyard.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde‑friendly and carry defaults so that minimal configs remain concise.
//! Durations are humantime strings (`"250ms"`, `"5s"`, `"1m"`) and are parsed once
//! when the gateway builds its runtime state.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_sweep_interval() -> String {
    "60s".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub discovery: DiscoveryBackendConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    /// How often idle rate-limit windows are garbage collected
    #[serde(default = "default_sweep_interval")]
    pub rate_limit_sweep_interval: String,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Distinct service names referenced by the configured routes, in route order.
    pub fn routed_services(&self) -> Vec<String> {
        let mut services: Vec<String> = Vec::new();
        for route in &self.routes {
            if !services.contains(&route.service_name) {
                services.push(route.service_name.clone());
            }
        }
        services
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            logging: LoggingConfig::default(),
            discovery: DiscoveryBackendConfig::default(),
            registry: RegistryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckConfig::default(),
            auth: AuthConfig::default(),
            rate_limit_sweep_interval: default_sweep_interval(),
            routes: Vec::new(),
        }
    }
}

/// Builder for ServerConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ServerConfigBuilder {
    listen_addr: Option<String>,
    discovery: Option<DiscoveryBackendConfig>,
    registry: Option<RegistryConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    health_check: Option<HealthCheckConfig>,
    auth: Option<AuthConfig>,
    routes: Vec<RouteConfig>,
}

impl ServerConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Set the discovery backend
    pub fn discovery(mut self, discovery: DiscoveryBackendConfig) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Set registry caching / retry tunables
    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set circuit breaker thresholds
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Set active health check configuration
    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    /// Set the static token table used by the auth validator
    pub fn auth(mut self, config: AuthConfig) -> Self {
        self.auth = Some(config);
        self
    }

    /// Add a route
    pub fn route(mut self, route: RouteConfig) -> Self {
        self.routes.push(route);
        self
    }

    /// Build the final ServerConfig
    pub fn build(self) -> Result<ServerConfig, String> {
        if self.routes.is_empty() {
            return Err("At least one route must be configured".to_string());
        }

        Ok(ServerConfig {
            listen_addr: self.listen_addr.unwrap_or_else(default_listen_addr),
            logging: LoggingConfig::default(),
            discovery: self.discovery.unwrap_or_default(),
            registry: self.registry.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            health_check: self.health_check.unwrap_or_default(),
            auth: self.auth.unwrap_or_default(),
            rate_limit_sweep_interval: default_sweep_interval(),
            routes: self.routes,
        })
    }
}

/// Output format of the tracing subscriber.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// One statically configured service replica.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StaticInstanceConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub healthy: bool,
}

fn default_true() -> bool {
    true
}

/// Which discovery backend the registry sits on.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryBackendConfig {
    Static {
        #[serde(default)]
        services: HashMap<String, Vec<StaticInstanceConfig>>,
    },
    Consul {
        /// Consul HTTP API base address, e.g. `http://127.0.0.1:8500`
        address: String,
        #[serde(default)]
        datacenter: Option<String>,
        /// ACL token sent as `X-Consul-Token`
        #[serde(default)]
        token: Option<String>,
    },
}

impl Default for DiscoveryBackendConfig {
    fn default() -> Self {
        Self::Static {
            services: HashMap::new(),
        }
    }
}

/// Caching and retry behaviour of the service registry.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    /// Snapshots younger than this are served without contacting the backend
    pub cache_ttl: String,
    /// Poll interval of the per-service watch task
    pub refresh_interval: String,
    /// Backend lookup attempts before surfacing a discovery error
    pub max_attempts: u32,
    pub initial_backoff: String,
    pub max_backoff: String,
    /// Capacity of each watch channel
    pub watch_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: "5s".to_string(),
            refresh_interval: "10s".to_string(),
            max_attempts: 3,
            initial_backoff: "50ms".to_string(),
            max_backoff: "1s".to_string(),
            watch_buffer: 16,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Time spent open before a probe is allowed
    pub cooldown: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: "30s".to_string(),
        }
    }
}

/// Active probing of statically registered instances.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: String,
    pub timeout: String,
    pub path: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: "10s".to_string(),
            timeout: "2s".to_string(),
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token -> identity
    pub tokens: HashMap<String, String>,
}

/// Rate limiting discriminator for how client keys are derived.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBy {
    #[default]
    Ip,
    Header,
    Route,
}

/// Algorithm used to enforce the quota semantics.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    FixedWindow,
    TokenBucket,
}

/// Behaviour when a key could not be extracted (missing IP/header etc.).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    #[default]
    Allow,
    Deny,
}

/// Per‑route rate limit configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub requests: u64,
    pub window: String, // Parsed by humantime, e.g., "1s", "5m", "1h"
    #[serde(default)]
    pub by: RateLimitBy,
    #[serde(default)]
    pub header_name: Option<String>, // Should be Some if by == Header
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default)]
    pub on_missing_key: MissingKeyPolicy,
    /// Key `by: ip` on `X-Forwarded-For` / `X-Real-IP` instead of the
    /// socket peer. Only set behind a proxy that overwrites those headers.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    /// Sticky selection keyed by client IP
    IpHash,
    /// Fewest in-flight requests through the gateway
    LeastConnections,
}

impl std::fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalanceStrategy::RoundRobin => write!(f, "round_robin"),
            LoadBalanceStrategy::Random => write!(f, "random"),
            LoadBalanceStrategy::IpHash => write!(f, "ip_hash"),
            LoadBalanceStrategy::LeastConnections => write!(f, "least_connections"),
        }
    }
}

fn default_route_timeout() -> String {
    "30s".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

/// A single routing rule mapping a path prefix onto a discovered service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouteConfig {
    pub service_name: String,
    pub path_prefix: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-attempt upstream timeout
    #[serde(default = "default_route_timeout")]
    pub timeout: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default)]
    pub load_balancer: LoadBalanceStrategy,
    /// Remove `path_prefix` from the forwarded path
    #[serde(default)]
    pub strip_prefix: bool,
}

impl RouteConfig {
    /// Route with default behaviour for the given prefix and service.
    pub fn new(path_prefix: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            path_prefix: path_prefix.into(),
            auth_required: false,
            rate_limit: None,
            timeout: default_route_timeout(),
            retry_attempts: default_retry_attempts(),
            load_balancer: LoadBalanceStrategy::default(),
            strip_prefix: false,
        }
    }
}

/// Parse a humantime duration string.
pub fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value)
}
