use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::StaticInstanceConfig;

/// One running, addressable replica of a backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub healthy: bool,
}

impl ServiceInstance {
    /// Create a healthy instance without tags or metadata
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
            metadata: HashMap::new(),
            healthy: true,
        }
    }

    /// Build an instance of `service` from its static configuration entry
    pub fn from_static(service: &str, config: &StaticInstanceConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: service.to_string(),
            address: config.address.clone(),
            port: config.port,
            tags: config.tags.clone(),
            metadata: config.metadata.clone(),
            healthy: config.healthy,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// Base URL requests are forwarded to. An `https` tag or `scheme=https`
    /// metadata entry selects TLS towards the instance.
    pub fn base_url(&self) -> String {
        let secure = self.tags.iter().any(|t| t == "https")
            || self.metadata.get("scheme").is_some_and(|s| s == "https");
        let scheme = if secure { "https" } else { "http" };
        format!("{scheme}://{}", self.authority())
    }

    /// Fields that define membership; health and metadata changes alone do
    /// not change where traffic can go.
    fn membership_key(&self) -> (&str, &str, u16) {
        (&self.id, &self.address, self.port)
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.name, self.id, self.authority())
    }
}

/// Immutable view of a service's healthy instances at one point in time.
///
/// Snapshots are never mutated; the registry replaces them wholesale so that
/// readers always observe a complete list.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub service: String,
    pub instances: Arc<[ServiceInstance]>,
    pub fetched_at: Instant,
    /// Set when the backend could not be reached and this is the last known good list
    pub stale: bool,
}

impl InstanceSnapshot {
    pub fn new(service: impl Into<String>, instances: Vec<ServiceInstance>) -> Self {
        Self {
            service: service.into(),
            instances: instances.into(),
            fetched_at: Instant::now(),
            stale: false,
        }
    }

    /// Copy of this snapshot tagged as stale
    pub fn as_stale(&self) -> Self {
        Self {
            stale: true,
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instances.iter().any(|i| i.id == instance_id)
    }

    /// True when both snapshots route to the same set of replicas.
    pub fn same_membership(&self, other: &InstanceSnapshot) -> bool {
        if self.instances.len() != other.instances.len() {
            return false;
        }
        let mut left: Vec<_> = self.instances.iter().map(|i| i.membership_key()).collect();
        let mut right: Vec<_> = other.instances.iter().map(|i| i.membership_key()).collect();
        left.sort_unstable();
        right.sort_unstable();
        left == right
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let instance = ServiceInstance::new("a", "echo", "10.0.0.1", 8080);
        assert_eq!(instance.base_url(), "http://10.0.0.1:8080");

        let mut secure = ServiceInstance::new("b", "echo", "::1", 8443);
        secure.tags.push("https".to_string());
        assert_eq!(secure.base_url(), "https://[::1]:8443");
    }

    #[test]
    fn test_same_membership_ignores_order_and_health() {
        let a = ServiceInstance::new("a", "echo", "10.0.0.1", 1);
        let b = ServiceInstance::new("b", "echo", "10.0.0.2", 2);
        let first = InstanceSnapshot::new("echo", vec![a.clone(), b.clone()]);

        let mut b_meta = b.clone();
        b_meta.metadata.insert("zone".to_string(), "eu".to_string());
        let second = InstanceSnapshot::new("echo", vec![b_meta, a.clone()]);
        assert!(first.same_membership(&second));

        let third = InstanceSnapshot::new("echo", vec![a]);
        assert!(!first.same_membership(&third));
    }

    #[test]
    fn test_stale_copy_keeps_instances() {
        let snapshot =
            InstanceSnapshot::new("echo", vec![ServiceInstance::new("a", "echo", "h", 1)]);
        let stale = snapshot.as_stale();
        assert!(stale.stale);
        assert!(!snapshot.stale);
        assert!(stale.contains("a"));
    }
}
