//! Route table and longest-prefix matching.
//!
//! The table is built once from configuration and never changes afterwards.
//! Prefixes match on whole path segments: `/api` matches `/api` and
//! `/api/users` but not `/apiv2`.
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    config::{LoadBalanceStrategy, RouteConfig, parse_duration},
    core::{
        load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
        rate_limiter::RouteRateLimiter,
    },
};

/// A configured route with its runtime collaborators attached.
pub struct Route {
    pub prefix: String,
    pub service: String,
    pub auth_required: bool,
    /// Per-attempt upstream timeout
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub strip_prefix: bool,
    pub strategy: LoadBalanceStrategy,
    pub balancer: Arc<dyn LoadBalancingStrategy>,
    pub rate_limiter: Option<Arc<RouteRateLimiter>>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("prefix", &self.prefix)
            .field("service", &self.service)
            .field("auth_required", &self.auth_required)
            .field("timeout", &self.timeout)
            .field("retry_attempts", &self.retry_attempts)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl Route {
    /// Always at least one attempt
    pub fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    pub fn matches(&self, path: &str) -> bool {
        prefix_matches(&self.prefix, path)
    }

    /// Path sent upstream for an inbound `path` matched by this route.
    pub fn forward_path(&self, path: &str) -> String {
        if !self.strip_prefix {
            return path.to_string();
        }
        let prefix = self.prefix.trim_end_matches('/');
        let rest = path.strip_prefix(prefix).unwrap_or(path);
        if rest.is_empty() {
            "/".to_string()
        } else if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        }
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.ends_with('/') {
        return path.starts_with(prefix) || path == prefix.trim_end_matches('/');
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Immutable, longest-prefix-first route table
#[derive(Debug)]
pub struct Router {
    routes: Vec<Arc<Route>>,
}

impl Router {
    /// Build the table. Routes for the same service and strategy share one
    /// balancer so round-robin cycles across all of them.
    pub fn new(configs: &[RouteConfig]) -> Result<Self, String> {
        let mut balancers: HashMap<(String, LoadBalanceStrategy), Arc<dyn LoadBalancingStrategy>> =
            HashMap::new();
        let mut routes: Vec<Arc<Route>> = Vec::with_capacity(configs.len());

        for config in configs {
            if !config.path_prefix.starts_with('/') {
                return Err(format!(
                    "Route prefix '{}' must start with '/'",
                    config.path_prefix
                ));
            }
            if routes.iter().any(|r| r.prefix == config.path_prefix) {
                return Err(format!("Duplicate route prefix '{}'", config.path_prefix));
            }

            let timeout = parse_duration(&config.timeout).map_err(|e| {
                format!(
                    "Invalid timeout '{}' for route '{}': {e}",
                    config.timeout, config.path_prefix
                )
            })?;
            let rate_limiter = config
                .rate_limit
                .as_ref()
                .map(|rl| RouteRateLimiter::new(&config.path_prefix, rl).map(Arc::new))
                .transpose()
                .map_err(|e| format!("Route '{}': {e}", config.path_prefix))?;
            let balancer = balancers
                .entry((config.service_name.clone(), config.load_balancer))
                .or_insert_with(|| LoadBalancerFactory::create_strategy(config.load_balancer))
                .clone();

            routes.push(Arc::new(Route {
                prefix: config.path_prefix.clone(),
                service: config.service_name.clone(),
                auth_required: config.auth_required,
                timeout,
                retry_attempts: config.retry_attempts,
                strip_prefix: config.strip_prefix,
                strategy: config.load_balancer,
                balancer,
                rate_limiter,
            }));
        }

        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        tracing::info!(routes = routes.len(), "Route table built");
        Ok(Self { routes })
    }

    /// The most specific route for `path`
    pub fn match_route(&self, path: &str) -> Option<Arc<Route>> {
        self.routes.iter().find(|route| route.matches(path)).cloned()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn rate_limiters(&self) -> impl Iterator<Item = &Arc<RouteRateLimiter>> {
        self.routes.iter().filter_map(|r| r.rate_limiter.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;

    fn table(prefixes: &[(&str, &str)]) -> Router {
        let configs: Vec<RouteConfig> = prefixes
            .iter()
            .map(|(prefix, service)| RouteConfig::new(*prefix, *service))
            .collect();
        Router::new(&configs).unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = table(&[("/api", "general"), ("/api/users", "users"), ("/", "root")]);

        assert_eq!(router.match_route("/api/users/42").unwrap().service, "users");
        assert_eq!(router.match_route("/api/users").unwrap().service, "users");
        assert_eq!(router.match_route("/api/orders").unwrap().service, "general");
        assert_eq!(router.match_route("/static/app.js").unwrap().service, "root");
    }

    #[test]
    fn test_prefix_matches_whole_segments() {
        let router = table(&[("/api", "general")]);
        assert!(router.match_route("/apiv2").is_none());
        assert!(router.match_route("/api").is_some());
        assert!(router.match_route("/other").is_none());
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let configs = vec![RouteConfig::new("/api", "a"), RouteConfig::new("/api", "b")];
        let err = Router::new(&configs).unwrap_err();
        assert!(err.contains("Duplicate"));
    }

    #[test]
    fn test_forward_path_with_strip_prefix() {
        let mut config = RouteConfig::new("/api/users", "users");
        config.strip_prefix = true;
        let router = Router::new(&[config]).unwrap();
        let route = router.match_route("/api/users/42").unwrap();

        assert_eq!(route.forward_path("/api/users/42"), "/42");
        assert_eq!(route.forward_path("/api/users"), "/");

        let plain = table(&[("/api", "general")]);
        let route = plain.match_route("/api/x").unwrap();
        assert_eq!(route.forward_path("/api/x"), "/api/x");
    }

    #[test]
    fn test_routes_share_balancer_per_service() {
        let router = table(&[("/a", "svc"), ("/b", "svc"), ("/c", "other")]);
        let a = router.match_route("/a").unwrap();
        let b = router.match_route("/b").unwrap();
        let c = router.match_route("/c").unwrap();
        assert!(Arc::ptr_eq(&a.balancer, &b.balancer));
        assert!(!Arc::ptr_eq(&a.balancer, &c.balancer));
    }

    #[test]
    fn test_invalid_rate_limit_rejected() {
        let mut config = RouteConfig::new("/api", "svc");
        config.rate_limit = Some(RateLimitConfig {
            requests: 0,
            window: "1s".to_string(),
            by: Default::default(),
            header_name: None,
            algorithm: Default::default(),
            on_missing_key: Default::default(),
            trust_forwarded_headers: false,
        });
        assert!(Router::new(&[config]).is_err());
    }

    #[test]
    fn test_attempts_floor() {
        let mut config = RouteConfig::new("/api", "svc");
        config.retry_attempts = 0;
        let router = Router::new(&[config]).unwrap();
        assert_eq!(router.match_route("/api").unwrap().attempts(), 1);
    }
}
