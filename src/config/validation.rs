use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{
    CircuitBreakerConfig, DiscoveryBackendConfig, HealthCheckConfig, RateLimitBy,
    RateLimitConfig, RegistryConfig, RouteConfig, ServerConfig, parse_duration,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Server configuration validator.
///
/// Every check runs; all problems are reported together.
pub struct ServerConfigValidator;

impl ServerConfigValidator {
    /// Validate the entire server configuration
    pub fn validate(config: &ServerConfig) -> ValidationResult<()> {
        let errors = Self::collect_errors(config);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            })
        }
    }

    /// Every problem found in `config`
    pub fn collect_errors(config: &ServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }
        for route in &config.routes {
            errors.extend(Self::validate_single_route(route));
        }
        errors.extend(Self::check_route_conflicts(&config.routes));

        errors.extend(Self::validate_discovery(config));
        errors.extend(Self::validate_registry(&config.registry));
        errors.extend(Self::validate_circuit_breaker(&config.circuit_breaker));
        errors.extend(Self::validate_health_check_config(&config.health_check));
        Self::check_duration(
            &mut errors,
            "rate_limit_sweep_interval",
            &config.rate_limit_sweep_interval,
        );

        if config.routes.iter().any(|r| r.auth_required) && config.auth.tokens.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "auth.tokens".to_string(),
                message: "Routes require auth but no tokens are configured".to_string(),
            });
        }

        errors
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_single_route(route: &RouteConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let path = &route.path_prefix;

        if !path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route path: {path}"),
                message: "Route paths must start with '/'".to_string(),
            });
        }
        if route.service_name.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{path}' service_name"),
            });
        }

        match parse_duration(&route.timeout) {
            Ok(timeout) if timeout.is_zero() => errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' timeout"),
                message: "Timeout must be greater than 0".to_string(),
            }),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' timeout"),
                message: format!("Invalid duration '{}': {e}", route.timeout),
            }),
        }

        if let Some(rate_limit) = &route.rate_limit {
            errors.extend(Self::validate_rate_limit(path, rate_limit));
        }

        errors
    }

    /// Validate rate limit configuration
    fn validate_rate_limit(path: &str, config: &RateLimitConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.requests == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' rate_limit.requests"),
                message: "Rate limit requests must be greater than 0".to_string(),
            });
        }

        match parse_duration(&config.window) {
            Ok(window) if window.is_zero() => errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' rate_limit.window"),
                message: "Window must be greater than 0".to_string(),
            }),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' rate_limit.window"),
                message: format!("Window must be a duration like '1s', '1m' or '1h': {e}"),
            }),
        }

        if config.by == RateLimitBy::Header
            && config
                .header_name
                .as_deref()
                .is_none_or(|name| name.trim().is_empty())
        {
            errors.push(ValidationError::MissingField {
                field: format!("route '{path}' rate_limit.header_name"),
            });
        }

        errors
    }

    /// Equal prefixes are ambiguous for longest-prefix matching
    fn check_route_conflicts(routes: &[RouteConfig]) -> Vec<ValidationError> {
        let mut seen = HashSet::new();
        routes
            .iter()
            .filter(|route| !seen.insert(normalize_prefix(&route.path_prefix)))
            .map(|route| ValidationError::RouteConflict {
                message: format!(
                    "Duplicate route configuration for path '{}'",
                    route.path_prefix
                ),
            })
            .collect()
    }

    fn validate_discovery(config: &ServerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        match &config.discovery {
            DiscoveryBackendConfig::Static { services } => {
                for service in config.routed_services() {
                    if !services.contains_key(&service) {
                        errors.push(ValidationError::InvalidField {
                            field: format!("discovery.services.{service}"),
                            message: "Service is routed but not declared in static discovery"
                                .to_string(),
                        });
                    }
                }
                for (service, instances) in services {
                    let mut ids = HashSet::new();
                    for instance in instances {
                        if instance.id.trim().is_empty() || instance.address.trim().is_empty() {
                            errors.push(ValidationError::InvalidField {
                                field: format!("discovery.services.{service}"),
                                message: "Instances need an id and an address".to_string(),
                            });
                        }
                        if !ids.insert(instance.id.as_str()) {
                            errors.push(ValidationError::InvalidField {
                                field: format!("discovery.services.{service}"),
                                message: format!("Duplicate instance id '{}'", instance.id),
                            });
                        }
                    }
                }
            }
            DiscoveryBackendConfig::Consul { address, .. } => match url::Url::parse(address) {
                Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                Ok(url) => errors.push(ValidationError::InvalidField {
                    field: "discovery.address".to_string(),
                    message: format!(
                        "URL scheme must be 'http' or 'https', got '{}'",
                        url.scheme()
                    ),
                }),
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: "discovery.address".to_string(),
                    message: format!("Invalid URL format: {e}"),
                }),
            },
        }
        errors
    }

    fn validate_registry(config: &RegistryConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        Self::check_duration(&mut errors, "registry.cache_ttl", &config.cache_ttl);
        Self::check_duration(&mut errors, "registry.refresh_interval", &config.refresh_interval);
        Self::check_duration(&mut errors, "registry.initial_backoff", &config.initial_backoff);
        Self::check_duration(&mut errors, "registry.max_backoff", &config.max_backoff);
        if config.max_attempts == 0 {
            errors.push(ValidationError::InvalidField {
                field: "registry.max_attempts".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.watch_buffer == 0 {
            errors.push(ValidationError::InvalidField {
                field: "registry.watch_buffer".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_circuit_breaker(config: &CircuitBreakerConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        Self::check_duration(&mut errors, "circuit_breaker.cooldown", &config.cooldown);
        if config.failure_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.failure_threshold".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        if config.success_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "circuit_breaker.success_threshold".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_health_check_config(config: &HealthCheckConfig) -> Vec<ValidationError> {
        if !config.enabled {
            return Vec::new();
        }

        let mut errors = Vec::new();
        Self::check_duration(&mut errors, "health_check.interval", &config.interval);
        Self::check_duration(&mut errors, "health_check.timeout", &config.timeout);

        if config.unhealthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.unhealthy_threshold".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.healthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.healthy_threshold".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.path.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Cannot be empty when health checks are enabled".to_string(),
            });
        } else if !config.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Must start with '/' when health checks are enabled".to_string(),
            });
        }

        errors
    }

    /// Non-zero humantime duration
    fn check_duration(errors: &mut Vec<ValidationError>, field: &str, value: &str) {
        match parse_duration(value) {
            Ok(duration) if duration.is_zero() => errors.push(ValidationError::InvalidField {
                field: field.to_string(),
                message: "Must be greater than 0".to_string(),
            }),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("Invalid duration '{value}': {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

/// `/api` and `/api/` route the same requests
fn normalize_prefix(prefix: &str) -> &str {
    match prefix.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::models::StaticInstanceConfig;

    fn instance(id: &str) -> StaticInstanceConfig {
        StaticInstanceConfig {
            id: id.to_string(),
            address: "127.0.0.1".to_string(),
            port: 9000,
            tags: vec![],
            metadata: HashMap::new(),
            healthy: true,
        }
    }

    fn minimal_valid_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:8080".to_string(),
            discovery: DiscoveryBackendConfig::Static {
                services: HashMap::from([("users".to_string(), vec![instance("u1")])]),
            },
            routes: vec![RouteConfig::new("/api", "users")],
            ..ServerConfig::default()
        }
    }

    fn rate_limit(requests: u64, by: RateLimitBy) -> RateLimitConfig {
        RateLimitConfig {
            requests,
            window: "1s".to_string(),
            by,
            header_name: None,
            algorithm: Default::default(),
            on_missing_key: Default::default(),
            trust_forwarded_headers: false,
        }
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(ServerConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_prefixes() {
        let mut config = minimal_valid_config();
        config.routes.push(RouteConfig::new("/api/", "users"));

        let errors = ServerConfigValidator::collect_errors(&config);
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::RouteConflict { .. }))
        );
    }

    #[test]
    fn validate_allows_nested_prefixes() {
        let mut config = minimal_valid_config();
        config.routes.push(RouteConfig::new("/api/users", "users"));
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_bad_listen_address() {
        let mut config = minimal_valid_config();
        config.listen_addr = "localhost".to_string();

        let errors = ServerConfigValidator::collect_errors(&config);
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::InvalidListenAddress { .. }]
        ));
    }

    #[test]
    fn validate_rejects_zero_quota_and_missing_header() {
        let mut config = minimal_valid_config();
        config.routes[0].rate_limit = Some(rate_limit(0, RateLimitBy::Header));

        let errors = ServerConfigValidator::collect_errors(&config);
        assert_eq!(errors.len(), 2);
        let message = ServerConfigValidator::validate(&config)
            .unwrap_err()
            .to_string();
        assert!(message.contains("Found 2 validation errors"));
    }

    #[test]
    fn validate_rejects_unknown_static_service() {
        let mut config = minimal_valid_config();
        config.routes.push(RouteConfig::new("/orders", "orders"));

        let errors = ServerConfigValidator::collect_errors(&config);
        assert!(errors.iter().any(|e| e.to_string().contains("orders")));
    }

    #[test]
    fn validate_rejects_invalid_durations() {
        let mut config = minimal_valid_config();
        config.routes[0].timeout = "forever".to_string();
        config.circuit_breaker.cooldown = "0s".to_string();

        assert_eq!(ServerConfigValidator::collect_errors(&config).len(), 2);
    }

    #[test]
    fn validate_rejects_invalid_health_check_path_when_enabled() {
        let mut config = minimal_valid_config();
        config.health_check.enabled = true;
        config.health_check.path = "health".to_string();

        assert!(ServerConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_auth_without_tokens() {
        let mut config = minimal_valid_config();
        config.routes[0].auth_required = true;
        assert!(ServerConfigValidator::validate(&config).is_err());

        config
            .auth
            .tokens
            .insert("t".to_string(), "svc".to_string());
        assert!(ServerConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn validate_checks_consul_address() {
        let mut config = minimal_valid_config();
        config.discovery = DiscoveryBackendConfig::Consul {
            address: "consul:8500".to_string(),
            datacenter: None,
            token: None,
        };
        assert!(ServerConfigValidator::validate(&config).is_err());
    }
}
