use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use scc::HashMap;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::static_discovery::StaticDiscovery,
    config::{HealthCheckConfig, parse_duration},
    core::instance::ServiceInstance,
    ports::http_client::HttpClient,
};

/// Metadata key that overrides the probe path for a single instance
pub const HEALTH_PATH_METADATA: &str = "health_check_path";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ProbeCounters {
    consecutive_successes: u32,
    consecutive_failures: u32,
}

/// Active health checker for the static catalogue.
///
/// Probes every registered instance on a fixed interval and flips its health
/// flag in [`StaticDiscovery`] once the configured number of consecutive
/// results agrees. The flip is broadcast to registry watchers by the catalogue.
pub struct HealthChecker {
    discovery: Arc<StaticDiscovery>,
    http_client: Arc<dyn HttpClient>,
    interval: Duration,
    timeout: Duration,
    path: String,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    counters: HashMap<String, ProbeCounters>,
}

impl HealthChecker {
    pub fn new(
        discovery: Arc<StaticDiscovery>,
        http_client: Arc<dyn HttpClient>,
        config: &HealthCheckConfig,
    ) -> Result<Self> {
        let interval =
            parse_duration(&config.interval).wrap_err("Invalid health_check.interval")?;
        let timeout = parse_duration(&config.timeout).wrap_err("Invalid health_check.timeout")?;
        Ok(Self {
            discovery,
            http_client,
            interval,
            timeout,
            path: config.path.clone(),
            unhealthy_threshold: config.unhealthy_threshold.max(1),
            healthy_threshold: config.healthy_threshold.max(1),
            counters: HashMap::new(),
        })
    }

    /// Run the health checker loop until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            interval = ?self.interval,
            timeout = ?self.timeout,
            path = %self.path,
            "Starting health checker"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Give the server a moment before the first round
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let changed = self.check_all().await;
                    tracing::debug!(changed, "Health check cycle completed");
                }
            }
        }
        tracing::info!("Health checker stopped");
    }

    /// Probe every instance once. Returns how many health flags flipped.
    pub async fn check_all(&self) -> usize {
        let instances = self.discovery.all_instances();
        let mut changed = 0;
        for instance in &instances {
            let url = self.probe_url(instance);
            tracing::debug!(%url, "Health checking");

            let (ok, reason) = match self.http_client.health_check(&url, self.timeout).await {
                Ok(true) => (true, String::new()),
                Ok(false) => (false, "instance reported unhealthy".to_string()),
                Err(err) => (false, format!("request error: {err}")),
            };
            if self.record(instance, ok, &reason).await {
                changed += 1;
            }
        }
        self.forget_missing(&instances).await;
        changed
    }

    fn probe_url(&self, instance: &ServiceInstance) -> String {
        let path = instance
            .metadata
            .get(HEALTH_PATH_METADATA)
            .unwrap_or(&self.path);
        format!("{}{}", instance.base_url(), path)
    }

    /// Update counters for one probe result; returns true when the flag flipped
    async fn record(&self, instance: &ServiceInstance, ok: bool, reason: &str) -> bool {
        let key = counter_key(&instance.name, &instance.id);
        let counters = {
            let mut entry = self.counters.entry_async(key).await.or_default();
            let counters = entry.get_mut();
            if ok {
                counters.consecutive_successes += 1;
                counters.consecutive_failures = 0;
            } else {
                counters.consecutive_failures += 1;
                counters.consecutive_successes = 0;
            }
            *counters
        };

        if ok {
            if !instance.healthy && counters.consecutive_successes >= self.healthy_threshold {
                tracing::info!(
                    service = %instance.name,
                    instance = %instance.id,
                    successes = counters.consecutive_successes,
                    "Instance is now HEALTHY"
                );
                return self.discovery.set_health(&instance.name, &instance.id, true);
            }
        } else {
            tracing::info!(
                service = %instance.name,
                instance = %instance.id,
                reason,
                failures = counters.consecutive_failures,
                threshold = self.unhealthy_threshold,
                "Health check failed"
            );
            if instance.healthy && counters.consecutive_failures >= self.unhealthy_threshold {
                tracing::warn!(
                    service = %instance.name,
                    instance = %instance.id,
                    reason,
                    "Instance is now UNHEALTHY"
                );
                return self.discovery.set_health(&instance.name, &instance.id, false);
            }
        }
        false
    }

    async fn forget_missing(&self, instances: &[ServiceInstance]) {
        self.counters
            .retain_async(|key, _| {
                instances
                    .iter()
                    .any(|i| counter_key(&i.name, &i.id) == *key)
            })
            .await;
    }
}

fn counter_key(service: &str, instance_id: &str) -> String {
    format!("{service}/{instance_id}")
}
