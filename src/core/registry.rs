//! Caching, retrying front of a [`DiscoveryBackend`].
//!
//! The registry keeps one copy-on-write snapshot per service. Readers load the
//! current `Arc<InstanceSnapshot>` through `arc-swap` and never observe a
//! partially updated list. Backend failures are retried with capped
//! exponential backoff; when they persist, the last good snapshot is served
//! tagged as stale.
use std::{sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use scc::HashMap;
use tokio::{
    sync::{Mutex, broadcast, broadcast::error::RecvError, mpsc},
    time::{Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{RegistryConfig, parse_duration},
    core::instance::{InstanceSnapshot, ServiceInstance},
    metrics,
    ports::discovery::{DiscoveryBackend, DiscoveryError, DiscoveryResult},
};

/// Parsed registry tunables
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub cache_ttl: Duration,
    pub refresh_interval: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub watch_buffer: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(10),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            watch_buffer: 16,
        }
    }
}

impl TryFrom<&RegistryConfig> for RegistrySettings {
    type Error = String;

    fn try_from(config: &RegistryConfig) -> Result<Self, Self::Error> {
        let parse = |field: &str, value: &str| {
            parse_duration(value).map_err(|e| format!("Invalid registry {field} '{value}': {e}"))
        };
        Ok(Self {
            cache_ttl: parse("cache_ttl", &config.cache_ttl)?,
            refresh_interval: parse("refresh_interval", &config.refresh_interval)?,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: parse("initial_backoff", &config.initial_backoff)?,
            max_backoff: parse("max_backoff", &config.max_backoff)?,
            watch_buffer: config.watch_buffer.max(1),
        })
    }
}

struct ServiceEntry {
    snapshot: ArcSwapOption<InstanceSnapshot>,
    /// Serializes backend refreshes so concurrent misses share one lookup
    refresh: Mutex<()>,
}

impl ServiceEntry {
    fn new() -> Self {
        Self {
            snapshot: ArcSwapOption::empty(),
            refresh: Mutex::new(()),
        }
    }
}

/// Registry of discovered service instances.
pub struct ServiceRegistry {
    backend: Arc<dyn DiscoveryBackend>,
    settings: RegistrySettings,
    entries: HashMap<String, Arc<ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, settings: RegistrySettings) -> Self {
        Self {
            backend,
            settings,
            entries: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    async fn entry(&self, service: &str) -> Arc<ServiceEntry> {
        if let Some(entry) = self
            .entries
            .read_async(service, |_, entry| entry.clone())
            .await
        {
            return entry;
        }
        self.entries
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Arc::new(ServiceEntry::new()))
            .get()
            .clone()
    }

    fn fresh_snapshot(&self, entry: &ServiceEntry) -> Option<Arc<InstanceSnapshot>> {
        entry
            .snapshot
            .load_full()
            .filter(|snapshot| snapshot.fetched_at.elapsed() < self.settings.cache_ttl)
    }

    /// Healthy instances of `service`.
    ///
    /// Served from cache while younger than `cache_ttl`. A failed refresh
    /// falls back to the previous snapshot tagged stale; with nothing cached
    /// the discovery error is returned.
    pub async fn get_instances(&self, service: &str) -> DiscoveryResult<Arc<InstanceSnapshot>> {
        let entry = self.entry(service).await;
        if let Some(snapshot) = self.fresh_snapshot(&entry) {
            return Ok(snapshot);
        }

        let _guard = entry.refresh.lock().await;
        // Another task may have refreshed while we waited
        if let Some(snapshot) = self.fresh_snapshot(&entry) {
            return Ok(snapshot);
        }
        self.refresh_entry(service, &entry).await
    }

    /// Force a backend lookup regardless of cache age.
    pub async fn refresh(&self, service: &str) -> DiscoveryResult<Arc<InstanceSnapshot>> {
        let entry = self.entry(service).await;
        let _guard = entry.refresh.lock().await;
        self.refresh_entry(service, &entry).await
    }

    async fn refresh_entry(
        &self,
        service: &str,
        entry: &ServiceEntry,
    ) -> DiscoveryResult<Arc<InstanceSnapshot>> {
        match self.fetch_with_retry(service).await {
            Ok(instances) => {
                let healthy: Vec<ServiceInstance> =
                    instances.into_iter().filter(|i| i.healthy).collect();
                let snapshot = Arc::new(InstanceSnapshot::new(service, healthy));
                entry.snapshot.store(Some(snapshot.clone()));
                metrics::set_healthy_instances(service, snapshot.len());
                tracing::debug!(service, instances = snapshot.len(), "Refreshed instance snapshot");
                Ok(snapshot)
            }
            Err(error) => match entry.snapshot.load_full() {
                Some(previous) => {
                    tracing::warn!(
                        service,
                        error = %error,
                        instances = previous.len(),
                        "Discovery backend unavailable, serving stale snapshot"
                    );
                    // Restart the TTL so an outage does not turn every request
                    // into a full retry cycle.
                    let stale = Arc::new(InstanceSnapshot {
                        fetched_at: Instant::now(),
                        ..previous.as_stale()
                    });
                    entry.snapshot.store(Some(stale.clone()));
                    Ok(stale)
                }
                None => {
                    tracing::error!(service, error = %error, "Discovery failed with no cached snapshot");
                    Err(error)
                }
            },
        }
    }

    async fn fetch_with_retry(&self, service: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        let attempts = self.settings.max_attempts;
        let mut backoff = self.settings.initial_backoff;
        let mut last_error: Option<DiscoveryError> = None;

        for attempt in 1..=attempts {
            match self.backend.fetch_instances(service).await {
                Ok(instances) => return Ok(instances),
                Err(error) => {
                    metrics::record_discovery_failure(service);
                    tracing::warn!(service, attempt, error = %error, "Discovery lookup failed");
                    last_error = Some(error);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.settings.max_backoff);
                    }
                }
            }
        }

        Err(DiscoveryError::Exhausted {
            service: service.to_string(),
            attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }

    /// Last snapshot held for `service`, without touching the backend
    pub async fn cached(&self, service: &str) -> Option<Arc<InstanceSnapshot>> {
        self.entries
            .read_async(service, |_, entry| entry.snapshot.load_full())
            .await
            .flatten()
    }

    /// Announce an instance and refresh its service snapshot.
    pub async fn register(&self, instance: ServiceInstance) -> DiscoveryResult<()> {
        let service = instance.name.clone();
        tracing::info!(service = %service, instance = %instance.id, "Registering instance");
        self.backend.register(instance).await?;
        if let Err(e) = self.refresh(&service).await {
            tracing::warn!(service = %service, error = %e, "Refresh after register failed");
        }
        Ok(())
    }

    /// Remove an instance and refresh its service snapshot.
    pub async fn deregister(&self, service: &str, instance_id: &str) -> DiscoveryResult<()> {
        tracing::info!(service, instance = instance_id, "Deregistering instance");
        self.backend.deregister(service, instance_id).await?;
        if let Err(e) = self.refresh(service).await {
            tracing::warn!(service, error = %e, "Refresh after deregister failed");
        }
        Ok(())
    }

    pub async fn list_services(&self) -> DiscoveryResult<Vec<String>> {
        self.backend.list_services().await
    }

    /// Stream of snapshots for `service`, emitting the first successful
    /// lookup and then every membership change.
    ///
    /// The watch polls every `refresh_interval` and also reacts to backend
    /// push notifications. Failed lookups keep the cached data and emit
    /// nothing. The task ends when `shutdown` fires or the stream is dropped.
    pub fn watch(
        self: &Arc<Self>,
        service: &str,
        shutdown: CancellationToken,
    ) -> ReceiverStream<Arc<InstanceSnapshot>> {
        let (tx, rx) = mpsc::channel(self.settings.watch_buffer);
        let registry = self.clone();
        let service = service.to_string();

        tokio::spawn(async move {
            let mut changes = registry.backend.subscribe_changes();
            let mut ticker = tokio::time::interval(registry.settings.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Arc<InstanceSnapshot>> = None;

            tracing::debug!(service = %service, "Starting registry watch");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                    _ = next_change(&mut changes, &service) => {
                        tracing::debug!(service = %service, "Backend reported a membership change");
                    }
                }

                let snapshot = match registry.refresh(&service).await {
                    Ok(snapshot) if !snapshot.stale => snapshot,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(service = %service, error = %e, "Watch refresh failed");
                        continue;
                    }
                };

                let changed = last
                    .as_ref()
                    .is_none_or(|previous| !previous.same_membership(&snapshot));
                if changed {
                    if tx.send(snapshot.clone()).await.is_err() {
                        break;
                    }
                    last = Some(snapshot);
                }
            }
            tracing::debug!(service = %service, "Registry watch stopped");
        });

        ReceiverStream::new(rx)
    }
}

/// Resolve when the backend announces a change for `service`. Lagging counts
/// as a change; a closed channel degrades to polling only.
async fn next_change(changes: &mut Option<broadcast::Receiver<String>>, service: &str) {
    loop {
        let Some(receiver) = changes.as_mut() else {
            return std::future::pending().await;
        };
        match receiver.recv().await {
            Ok(changed) if changed == service => return,
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => *changes = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    use super::*;

    /// In-memory backend whose availability can be toggled
    #[derive(Default)]
    struct FlakyBackend {
        instances: std::sync::Mutex<Vec<ServiceInstance>>,
        down: AtomicBool,
        calls: AtomicU32,
    }

    impl FlakyBackend {
        fn with(instances: Vec<ServiceInstance>) -> Arc<Self> {
            Arc::new(Self {
                instances: std::sync::Mutex::new(instances),
                ..Default::default()
            })
        }

        fn set(&self, instances: Vec<ServiceInstance>) {
            *self.instances.lock().unwrap() = instances;
        }
    }

    #[async_trait]
    impl DiscoveryBackend for FlakyBackend {
        async fn fetch_instances(&self, _service: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(DiscoveryError::Unavailable("connection refused".to_string()));
            }
            Ok(self.instances.lock().unwrap().clone())
        }

        async fn register(&self, instance: ServiceInstance) -> DiscoveryResult<()> {
            let mut instances = self.instances.lock().unwrap();
            instances.retain(|i| i.id != instance.id);
            instances.push(instance);
            Ok(())
        }

        async fn deregister(&self, _service: &str, instance_id: &str) -> DiscoveryResult<()> {
            self.instances.lock().unwrap().retain(|i| i.id != instance_id);
            Ok(())
        }

        async fn list_services(&self) -> DiscoveryResult<Vec<String>> {
            Ok(vec!["users".to_string()])
        }
    }

    fn instance(id: &str, port: u16) -> ServiceInstance {
        ServiceInstance::new(id, "users", "127.0.0.1", port)
    }

    fn registry(backend: Arc<FlakyBackend>) -> Arc<ServiceRegistry> {
        Arc::new(ServiceRegistry::new(backend, RegistrySettings::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_unhealthy_instances() {
        let mut sick = instance("b", 2);
        sick.healthy = false;
        let backend = FlakyBackend::with(vec![instance("a", 1), sick]);
        let snapshot = registry(backend).get_instances("users").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains("a"));
        assert!(!snapshot.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serves_cache_within_ttl() {
        let backend = FlakyBackend::with(vec![instance("a", 1)]);
        let registry = registry(backend.clone());

        registry.get_instances("users").await.unwrap();
        registry.get_instances("users").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        registry.get_instances("users").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_lookup_failure_is_discovery_error() {
        let backend = FlakyBackend::with(vec![instance("a", 1)]);
        backend.down.store(true, Ordering::SeqCst);
        let result = registry(backend.clone()).get_instances("users").await;

        match result {
            Err(DiscoveryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhausted discovery error, got {other:?}"),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_serves_stale_snapshot() {
        let backend = FlakyBackend::with(vec![instance("a", 1), instance("b", 2)]);
        let registry = registry(backend.clone());
        registry.get_instances("users").await.unwrap();

        backend.down.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(6)).await;
        let snapshot = registry.get_instances("users").await.unwrap();
        assert!(snapshot.stale);
        assert_eq!(snapshot.len(), 2);

        backend.down.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(6)).await;
        let snapshot = registry.get_instances("users").await.unwrap();
        assert!(!snapshot.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_deregister_refresh_cache() {
        let backend = FlakyBackend::with(vec![instance("a", 1)]);
        let registry = registry(backend);
        registry.get_instances("users").await.unwrap();

        registry.register(instance("b", 2)).await.unwrap();
        // Idempotent by ID
        registry.register(instance("b", 2)).await.unwrap();
        let snapshot = registry.get_instances("users").await.unwrap();
        assert_eq!(snapshot.len(), 2);

        registry.deregister("users", "a").await.unwrap();
        registry.deregister("users", "a").await.unwrap();
        let snapshot = registry.get_instances("users").await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_emits_on_membership_change_only() {
        let backend = FlakyBackend::with(vec![instance("a", 1)]);
        let registry = registry(backend.clone());
        let shutdown = CancellationToken::new();
        let mut stream = registry.watch("users", shutdown.clone());

        let first = stream.next().await.unwrap();
        assert_eq!(first.len(), 1);

        // Metadata-only change plus an outage: no emission
        let mut tagged = instance("a", 1);
        tagged.metadata.insert("zone".to_string(), "eu".to_string());
        backend.set(vec![tagged]);
        backend.down.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(25)).await;

        backend.down.store(false, Ordering::SeqCst);
        backend.set(vec![instance("a", 1), instance("c", 3)]);
        let next = stream.next().await.unwrap();
        assert_eq!(next.len(), 2);
        assert!(next.contains("c"));

        shutdown.cancel();
        assert!(stream.next().await.is_none());
    }
}
