//! Route‑scoped rate limiting.
//!
//! Every route with a `rate_limit` block owns one [`RouteRateLimiter`]. The
//! limiter derives a client key from the request (peer IP, a header value, or
//! the route itself) and counts requests per key. Forwarding headers only
//! feed the IP key when `trust_forwarded_headers` is set, since any client
//! can write them. Two algorithms are offered:
//!
//! * `fixed_window` (default): a window of duration `W` opens on the first
//!   request for a key; at most `requests` calls pass until it expires, and the
//!   first call after expiry resets the count to one.
//! * `token_bucket`: `governor`'s GCRA limiter with a burst of `requests`
//!   replenished evenly over `W`.
//!
//! Window state lives in an `scc::HashMap`, so updates for one key only lock
//! that key's bucket.
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    time::Duration,
};

use axum::extract::ConnectInfo;
use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use http::{HeaderMap, HeaderName, Request};
use scc::{HashMap, hash_map::Entry};
use tokio::time::Instant;

use crate::config::models::{
    MissingKeyPolicy, RateLimitAlgorithm, RateLimitBy, RateLimitConfig, parse_duration,
};

pub type KeyedRateLimiterImpl<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
    /// No client key could be derived and the route denies such requests
    MissingKey,
}

impl RateLimitDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    count: u64,
}

/// Fixed-window counter keyed by client
pub struct FixedWindowLimiter {
    limit: u64,
    window: Duration,
    windows: HashMap<String, WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: HashMap::new(),
        }
    }

    /// Count one request for `key` and report whether it fits in the window.
    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.windows.entry_async(key.to_string()).await {
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if now.duration_since(state.window_start) >= self.window {
                    state.window_start = now;
                    state.count = 1;
                    true
                } else if state.count < self.limit {
                    state.count += 1;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(WindowState {
                    window_start: now,
                    count: 1,
                });
                true
            }
        }
    }

    /// Drop keys whose window has elapsed. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.windows
            .retain_async(|_, state| {
                let keep = now.duration_since(state.window_start) < self.window;
                if !keep {
                    removed += 1;
                }
                keep
            })
            .await;
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

enum LimiterImpl {
    FixedWindow(FixedWindowLimiter),
    TokenBucket(KeyedRateLimiterImpl<String>),
}

/// Rate limiter attached to one route.
pub struct RouteRateLimiter {
    route: String,
    by: RateLimitBy,
    header_name: Option<HeaderName>,
    on_missing_key: MissingKeyPolicy,
    trust_forwarded_headers: bool,
    limiter: LimiterImpl,
}

impl RouteRateLimiter {
    /// Build a limiter for `route` from its `RateLimitConfig` definition.
    pub fn new(route: &str, config: &RateLimitConfig) -> Result<Self, String> {
        let window = parse_duration(&config.window)
            .map_err(|e| format!("Invalid window string '{}': {e}", config.window))?;
        if window.is_zero() {
            return Err("Rate limit 'window' must be greater than 0".to_string());
        }
        if config.requests == 0 {
            return Err("Rate limit 'requests' must be greater than 0".to_string());
        }

        let header_name = match config.by {
            RateLimitBy::Header => {
                let name = config
                    .header_name
                    .as_ref()
                    .ok_or_else(|| "header_name is required for RateLimitBy::Header".to_string())?;
                Some(
                    HeaderName::from_bytes(name.as_bytes())
                        .map_err(|e| format!("Invalid header_name '{name}': {e}"))?,
                )
            }
            _ => None,
        };

        let limiter = match config.algorithm {
            RateLimitAlgorithm::FixedWindow => {
                LimiterImpl::FixedWindow(FixedWindowLimiter::new(config.requests, window))
            }
            RateLimitAlgorithm::TokenBucket => {
                let burst = u32::try_from(config.requests)
                    .ok()
                    .and_then(NonZeroU32::new)
                    .ok_or_else(|| {
                        format!("Token bucket burst {} does not fit in u32", config.requests)
                    })?;
                let replenish = window / burst.get();
                let quota = Quota::with_period(replenish)
                    .ok_or_else(|| format!("Invalid replenish period {replenish:?}"))?
                    .allow_burst(burst);
                LimiterImpl::TokenBucket(RateLimiter::keyed(quota))
            }
        };

        tracing::info!(
            route,
            by = ?config.by,
            algorithm = ?config.algorithm,
            requests = config.requests,
            window = %config.window,
            on_missing_key = ?config.on_missing_key,
            trust_forwarded_headers = config.trust_forwarded_headers,
            "Creating rate limiter"
        );

        Ok(Self {
            route: route.to_string(),
            by: config.by,
            header_name,
            on_missing_key: config.on_missing_key,
            trust_forwarded_headers: config.trust_forwarded_headers,
            limiter,
        })
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Client identifier for this request, or `None` when it is unavailable.
    pub fn client_key<T>(&self, req: &Request<T>) -> Option<String> {
        match self.by {
            RateLimitBy::Route => Some("*".to_string()),
            RateLimitBy::Ip => {
                client_ip(req, self.trust_forwarded_headers).map(|ip| ip.to_string())
            }
            RateLimitBy::Header => self
                .header_name
                .as_ref()
                .and_then(|name| req.headers().get(name))
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        }
    }

    /// Enforce this limiter for a key taken from [`Self::client_key`],
    /// applying the missing key policy when there is none.
    ///
    /// Takes the key by value so callers never hold the request across the
    /// await.
    pub async fn check_client(&self, client: Option<String>) -> RateLimitDecision {
        let Some(client) = client else {
            return match self.on_missing_key {
                MissingKeyPolicy::Allow => RateLimitDecision::Allowed,
                MissingKeyPolicy::Deny => RateLimitDecision::MissingKey,
            };
        };
        self.check_key(&client).await
    }

    /// Count one request for an already derived client key.
    pub async fn check_key(&self, client: &str) -> RateLimitDecision {
        let key = format!("{}|{client}", self.route);
        let allowed = match &self.limiter {
            LimiterImpl::FixedWindow(limiter) => limiter.allow(&key).await,
            LimiterImpl::TokenBucket(limiter) => limiter.check_key(&key).is_ok(),
        };
        if allowed {
            RateLimitDecision::Allowed
        } else {
            tracing::debug!(route = %self.route, client, "Rate limit exceeded");
            RateLimitDecision::Limited
        }
    }

    /// Garbage collect idle client state
    pub async fn sweep(&self) -> usize {
        match &self.limiter {
            LimiterImpl::FixedWindow(limiter) => limiter.sweep().await,
            LimiterImpl::TokenBucket(limiter) => {
                let before = limiter.len();
                limiter.retain_recent();
                limiter.shrink_to_fit();
                before.saturating_sub(limiter.len())
            }
        }
    }
}

/// Client address: the socket peer recorded by the listener. With
/// `trust_forwarded` the first `X-Forwarded-For` hop, then `X-Real-IP`, take
/// precedence over it.
pub fn client_ip<T>(req: &Request<T>, trust_forwarded: bool) -> Option<IpAddr> {
    let forwarded = if trust_forwarded {
        forwarded_ip(req.headers())
    } else {
        None
    };
    forwarded.or_else(|| {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|connect_info| connect_info.0.ip())
    })
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{Method, Request};
    use tokio::time::advance;

    use super::*;

    fn create_test_rate_limit_config() -> RateLimitConfig {
        RateLimitConfig {
            by: RateLimitBy::Route,
            header_name: None,
            requests: 5,
            window: "1s".to_string(),
            algorithm: RateLimitAlgorithm::FixedWindow,
            on_missing_key: MissingKeyPolicy::Allow,
            trust_forwarded_headers: false,
        }
    }

    async fn check<T>(limiter: &RouteRateLimiter, req: &Request<T>) -> RateLimitDecision {
        limiter.check_client(limiter.client_key(req)).await
    }

    fn request_from(ip: &str) -> Request<()> {
        let addr: SocketAddr = format!("{ip}:40000").parse().unwrap();
        let mut req = Request::builder()
            .method(Method::GET)
            .uri("/api/test")
            .body(())
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    #[test]
    fn test_invalid_window() {
        let mut config = create_test_rate_limit_config();
        config.window = "invalid".to_string();
        assert!(RouteRateLimiter::new("/api", &config).is_err());
    }

    #[test]
    fn test_zero_requests() {
        let mut config = create_test_rate_limit_config();
        config.requests = 0;
        assert!(RouteRateLimiter::new("/api", &config).is_err());
    }

    #[test]
    fn test_header_limiter_missing_header_name() {
        let mut config = create_test_rate_limit_config();
        config.by = RateLimitBy::Header;
        config.header_name = None;
        assert!(RouteRateLimiter::new("/api", &config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_rejects_after_limit() {
        let limiter = RouteRateLimiter::new("/api", &create_test_rate_limit_config()).unwrap();
        let req = request_from("10.0.0.1");

        for _ in 0..5 {
            assert_eq!(check(&limiter, &req).await, RateLimitDecision::Allowed);
        }
        assert_eq!(check(&limiter, &req).await, RateLimitDecision::Limited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_resets_after_expiry() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_secs(1));
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);

        advance(Duration::from_millis(999)).await;
        assert!(!limiter.allow("k").await);

        advance(Duration::from_millis(1)).await;
        // First request after expiry resets and counts as one
        assert!(limiter.allow("k").await);
        assert!(limiter.allow("k").await);
        assert!(!limiter.allow("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_never_exceed_limit() {
        let limiter = Arc::new(FixedWindowLimiter::new(10, Duration::from_secs(60)));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.allow("shared").await })
            })
            .collect();

        let mut allowed = 0;
        for task in tasks {
            if task.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ip_keys_are_independent() {
        let mut config = create_test_rate_limit_config();
        config.by = RateLimitBy::Ip;
        config.requests = 1;
        let limiter = RouteRateLimiter::new("/api", &config).unwrap();

        assert!(check(&limiter, &request_from("10.0.0.1")).await.is_allowed());
        assert!(!check(&limiter, &request_from("10.0.0.1")).await.is_allowed());
        assert!(check(&limiter, &request_from("10.0.0.2")).await.is_allowed());
    }

    fn forwarded_from(peer: &str, forwarded_for: &str) -> Request<()> {
        let mut req = request_from(peer);
        req.headers_mut()
            .insert("x-forwarded-for", forwarded_for.parse().unwrap());
        req
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotating_forwarded_for_does_not_reset_quota() {
        let mut config = create_test_rate_limit_config();
        config.by = RateLimitBy::Ip;
        config.requests = 1;
        let limiter = RouteRateLimiter::new("/api", &config).unwrap();

        let req = forwarded_from("10.0.0.1", "203.0.113.9");
        assert_eq!(limiter.client_key(&req).as_deref(), Some("10.0.0.1"));

        let mut allowed = 0;
        for i in 0..10 {
            let req = forwarded_from("10.0.0.1", &format!("203.0.113.{i}"));
            if check(&limiter, &req).await.is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_for_used_when_trusted() {
        let mut config = create_test_rate_limit_config();
        config.by = RateLimitBy::Ip;
        config.trust_forwarded_headers = true;
        let limiter = RouteRateLimiter::new("/api", &config).unwrap();

        let req = forwarded_from("10.0.0.1", "203.0.113.9, 10.0.0.1");
        assert_eq!(limiter.client_key(&req).as_deref(), Some("203.0.113.9"));

        let mut req = request_from("10.0.0.1");
        req.headers_mut()
            .insert("x-real-ip", "198.51.100.4".parse().unwrap());
        assert_eq!(limiter.client_key(&req).as_deref(), Some("198.51.100.4"));

        // Unparseable hops fall back to the peer
        let req = forwarded_from("10.0.0.1", "not-an-ip");
        assert_eq!(limiter.client_key(&req).as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_missing_key_policy() {
        let mut config = create_test_rate_limit_config();
        config.by = RateLimitBy::Header;
        config.header_name = Some("x-api-key".to_string());
        config.on_missing_key = MissingKeyPolicy::Deny;
        let limiter = RouteRateLimiter::new("/api", &config).unwrap();

        let req = Request::builder().uri("/api").body(()).unwrap();
        assert_eq!(check(&limiter, &req).await, RateLimitDecision::MissingKey);

        config.on_missing_key = MissingKeyPolicy::Allow;
        let limiter = RouteRateLimiter::new("/api", &config).unwrap();
        assert_eq!(check(&limiter, &req).await, RateLimitDecision::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_windows() {
        let limiter = FixedWindowLimiter::new(5, Duration::from_secs(1));
        limiter.allow("a").await;
        limiter.allow("b").await;
        advance(Duration::from_millis(500)).await;
        limiter.allow("c").await;

        advance(Duration::from_millis(600)).await;
        assert_eq!(limiter.sweep().await, 2);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn test_token_bucket_allows_burst() {
        let mut config = create_test_rate_limit_config();
        config.algorithm = RateLimitAlgorithm::TokenBucket;
        config.window = "1h".to_string();
        config.requests = 3;
        let limiter = RouteRateLimiter::new("/api", &config).unwrap();

        for _ in 0..3 {
            assert!(limiter.check_key("client").await.is_allowed());
        }
        assert_eq!(limiter.check_key("client").await, RateLimitDecision::Limited);
    }
}
