use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
    config::StaticInstanceConfig,
    core::instance::ServiceInstance,
    ports::discovery::{DiscoveryBackend, DiscoveryError, DiscoveryResult},
};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Discovery backend over an in-memory catalogue.
///
/// Seeded from the `discovery.services` table of the configuration and kept
/// current by `register`/`deregister` calls and the active health checker.
/// Every membership or health change is pushed to subscribers by service name.
pub struct StaticDiscovery {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    changes: broadcast::Sender<String>,
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticDiscovery {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            services: RwLock::new(HashMap::new()),
            changes,
        }
    }

    pub fn from_config(services: &HashMap<String, Vec<StaticInstanceConfig>>) -> Self {
        let discovery = Self::new();
        {
            let mut catalogue = discovery.write();
            for (service, instances) in services {
                catalogue.insert(
                    service.clone(),
                    instances
                        .iter()
                        .map(|i| ServiceInstance::from_static(service, i))
                        .collect(),
                );
            }
        }
        tracing::info!(services = services.len(), "Loaded static discovery catalogue");
        discovery
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<ServiceInstance>>> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<ServiceInstance>>> {
        self.services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, service: &str) {
        // No receivers is fine
        let _ = self.changes.send(service.to_string());
    }

    /// Every instance in the catalogue, healthy or not
    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        self.read().values().flatten().cloned().collect()
    }

    /// Set the health flag of one instance. Returns true when it changed.
    pub fn set_health(&self, service: &str, instance_id: &str, healthy: bool) -> bool {
        let changed = {
            let mut catalogue = self.write();
            match catalogue
                .get_mut(service)
                .and_then(|instances| instances.iter_mut().find(|i| i.id == instance_id))
            {
                Some(instance) if instance.healthy != healthy => {
                    instance.healthy = healthy;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.notify(service);
        }
        changed
    }
}

#[async_trait]
impl DiscoveryBackend for StaticDiscovery {
    async fn fetch_instances(&self, service: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        Ok(self.read().get(service).cloned().unwrap_or_default())
    }

    async fn register(&self, instance: ServiceInstance) -> DiscoveryResult<()> {
        if instance.id.is_empty() || instance.name.is_empty() {
            return Err(DiscoveryError::InvalidResponse(
                "instance id and service name are required".to_string(),
            ));
        }
        let service = instance.name.clone();
        {
            let mut catalogue = self.write();
            let instances = catalogue.entry(service.clone()).or_default();
            match instances.iter_mut().find(|i| i.id == instance.id) {
                Some(existing) => *existing = instance,
                None => instances.push(instance),
            }
        }
        self.notify(&service);
        Ok(())
    }

    async fn deregister(&self, service: &str, instance_id: &str) -> DiscoveryResult<()> {
        let removed = {
            let mut catalogue = self.write();
            catalogue.get_mut(service).is_some_and(|instances| {
                let before = instances.len();
                instances.retain(|i| i.id != instance_id);
                instances.len() != before
            })
        };
        if removed {
            self.notify(service);
        }
        Ok(())
    }

    async fn list_services(&self) -> DiscoveryResult<Vec<String>> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<String>> {
        Some(self.changes.subscribe())
    }
}
