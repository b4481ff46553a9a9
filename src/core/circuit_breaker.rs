//! Per-service circuit breaking.
//!
//! Each service gets one [`CircuitBreaker`] holding its state behind its own
//! mutex, so every transition is linearizable per service while unrelated
//! services never contend. Breakers are created lazily by
//! [`CircuitBreakerRegistry`] on first traffic.
//!
//! ```text
//! closed --(failure_threshold consecutive failures)--> open
//! open --(cooldown elapsed, checked on admission)--> half-open
//! half-open --(success_threshold consecutive successes)--> closed
//! half-open --(any failure)--> open
//! ```
//! Half-open admits a single probe at a time.
use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use scc::HashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::{config::CircuitBreakerConfig, config::parse_duration, metrics};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Parsed breaker thresholds
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl TryFrom<&CircuitBreakerConfig> for CircuitBreakerSettings {
    type Error = String;

    fn try_from(config: &CircuitBreakerConfig) -> Result<Self, Self::Error> {
        let cooldown = parse_duration(&config.cooldown)
            .map_err(|e| format!("Invalid circuit breaker cooldown '{}': {e}", config.cooldown))?;
        Ok(Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            cooldown,
        })
    }
}

/// Point-in-time copy of a breaker's counters
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// ID of the permit currently probing a half-open circuit
    probe_in_flight: Option<u64>,
}

/// Failure-isolation state machine for one service
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    settings: CircuitBreakerSettings,
    inner: Mutex<CircuitInner>,
    next_probe_id: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, settings: CircuitBreakerSettings) -> Self {
        Self {
            service: service.into(),
            settings,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: None,
            }),
            next_probe_id: AtomicU64::new(1),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock can be reused as is.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to send a request. Returns `None` when the call must short-circuit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<CircuitPermit> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(CircuitPermit {
                breaker: self.clone(),
                probe_id: None,
            }),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.settings.cooldown);
                if !cooled_down {
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                Some(self.grant_probe(&mut inner))
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight.is_some() {
                    None
                } else {
                    Some(self.grant_probe(&mut inner))
                }
            }
        }
    }

    fn grant_probe(self: &Arc<Self>, inner: &mut CircuitInner) -> CircuitPermit {
        let id = self.next_probe_id.fetch_add(1, Ordering::Relaxed);
        inner.probe_in_flight = Some(id);
        tracing::debug!(service = %self.service, probe_id = id, "Half-open probe admitted");
        CircuitPermit {
            breaker: self.clone(),
            probe_id: Some(id),
        }
    }

    /// Outcome of a call admitted under `probe_id`. While half-open only the
    /// outstanding probe moves the state; answers from calls admitted
    /// before the circuit opened are ignored.
    fn record_success(&self, probe_id: Option<u64>) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                if probe_id.is_none() || inner.probe_in_flight != probe_id {
                    tracing::debug!(
                        service = %self.service,
                        "Ignoring success from a call admitted before the probe"
                    );
                    return;
                }
                inner.probe_in_flight = None;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.settings.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // Late answer from a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, probe_id: Option<u64>) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if probe_id.is_none() || inner.probe_in_flight != probe_id {
                    return;
                }
                inner.consecutive_failures += 1;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without triggering the cooldown transition
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn status(&self) -> CircuitStatus {
        let inner = self.lock();
        CircuitStatus {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
        }
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
                inner.probe_in_flight = None;
                tracing::info!(service = %self.service, %from, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.consecutive_successes = 0;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = None;
                tracing::warn!(
                    service = %self.service,
                    %from,
                    failures = inner.consecutive_failures,
                    cooldown = ?self.settings.cooldown,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.probe_in_flight = None;
                tracing::info!(service = %self.service, "Circuit breaker half-open");
            }
        }
        metrics::set_circuit_state(&self.service, to);
    }

    fn release_probe(&self, probe_id: u64) {
        let mut inner = self.lock();
        if inner.probe_in_flight == Some(probe_id) {
            inner.probe_in_flight = None;
        }
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// A half-open probe permit dropped before any outcome was recorded (for
/// example because authentication rejected the request) frees the probe slot.
#[derive(Debug)]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    probe_id: Option<u64>,
}

impl CircuitPermit {
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_probe(&self) -> bool {
        self.probe_id.is_some()
    }

    /// Record an upstream call that reached the service
    pub fn record_success(&self) {
        self.breaker.record_success(self.probe_id);
    }

    /// Record a transport failure, timeout or 5xx
    pub fn record_failure(&self) {
        self.breaker.record_failure(self.probe_id);
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if let Some(id) = self.probe_id {
            self.breaker.release_probe(id);
        }
    }
}

/// Lazily populated map of breakers keyed by service name
pub struct CircuitBreakerRegistry {
    settings: CircuitBreakerSettings,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            breakers: HashMap::new(),
        }
    }

    /// Breaker for `service`, created closed on first use
    pub async fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read_async(service, |_, breaker| breaker.clone())
            .await
        {
            return existing;
        }
        self.breakers
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.settings)))
            .get()
            .clone()
    }

    /// Status of every breaker created so far
    pub async fn statuses(&self) -> Vec<(String, CircuitStatus)> {
        let mut statuses = Vec::new();
        self.breakers
            .retain_async(|service, breaker| {
                statuses.push((service.clone(), breaker.status()));
                true
            })
            .await;
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    fn test_settings() -> CircuitBreakerSettings {
        CircuitBreakerSettings {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(10),
        }
    }

    fn breaker(settings: CircuitBreakerSettings) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("users", settings))
    }

    fn fail(cb: &Arc<CircuitBreaker>, times: usize) {
        for _ in 0..times {
            cb.try_acquire().unwrap().record_failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state_is_closed() {
        let cb = breaker(test_settings());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failure_threshold() {
        let cb = breaker(test_settings());
        fail(&cb, 4);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let cb = breaker(test_settings());
        fail(&cb, 4);
        cb.try_acquire().unwrap().record_success();
        fail(&cb, 4);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.status().consecutive_failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_then_closes_on_probe_success() {
        let cb = breaker(test_settings());
        fail(&cb, 5);

        advance(Duration::from_secs(9)).await;
        assert!(cb.try_acquire().is_none());

        advance(Duration::from_secs(1)).await;
        let probe = cb.try_acquire().expect("probe admitted after cooldown");
        assert!(probe.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Only one probe at a time
        assert!(cb.try_acquire().is_none());

        probe.record_success();
        drop(probe);
        assert_eq!(cb.state(), CircuitState::Closed);
        let status = cb.status();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.consecutive_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_cooldown() {
        let cb = breaker(test_settings());
        fail(&cb, 5);
        advance(Duration::from_secs(10)).await;
        let probe = cb.try_acquire().unwrap();
        probe.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        advance(Duration::from_secs(5)).await;
        assert!(cb.try_acquire().is_none());
        advance(Duration::from_secs(5)).await;
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_requires_multiple_probes() {
        let cb = breaker(CircuitBreakerSettings {
            success_threshold: 2,
            ..test_settings()
        });
        fail(&cb, 5);
        advance(Duration::from_secs(10)).await;

        let first = cb.try_acquire().unwrap();
        first.record_success();
        drop(first);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let second = cb.try_acquire().expect("next probe admitted");
        second.record_success();
        drop(second);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_slot() {
        let cb = breaker(test_settings());
        fail(&cb, 5);
        advance(Duration::from_secs(10)).await;

        let probe = cb.try_acquire().unwrap();
        drop(probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answers_do_not_decide_half_open() {
        let cb = breaker(CircuitBreakerSettings {
            failure_threshold: 1,
            success_threshold: 1,
            cooldown: Duration::from_secs(2),
        });
        let early_success = cb.try_acquire().unwrap();
        let early_failure = cb.try_acquire().unwrap();
        fail(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);

        advance(Duration::from_secs(2)).await;
        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());

        // Calls admitted while closed answer after the probe went out
        early_success.record_success();
        early_failure.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_none());

        probe.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_registry_returns_same_breaker_per_service() {
        let registry = CircuitBreakerRegistry::new(test_settings());
        let a = registry.get("users").await;
        let b = registry.get("users").await;
        let c = registry.get("orders").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        a.try_acquire().unwrap().record_failure();
        let statuses = registry.statuses().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[1].0, "users");
        assert_eq!(statuses[1].1.consecutive_failures, 1);
    }

    #[test]
    fn test_settings_from_config() {
        let settings = CircuitBreakerSettings::try_from(&CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 0,
            cooldown: "2s".to_string(),
        })
        .unwrap();
        assert_eq!(settings.failure_threshold, 3);
        assert_eq!(settings.success_threshold, 1);
        assert_eq!(settings.cooldown, Duration::from_secs(2));

        let invalid = CircuitBreakerSettings::try_from(&CircuitBreakerConfig {
            cooldown: "soon".to_string(),
            ..CircuitBreakerConfig::default()
        });
        assert!(invalid.is_err());
    }
}
