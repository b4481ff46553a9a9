use std::{sync::Arc, time::Duration};

use eyre::Result;

use crate::{
    adapters::{consul::ConsulDiscovery, static_discovery::StaticDiscovery},
    config::DiscoveryBackendConfig,
    ports::discovery::DiscoveryBackend,
};

const CONSUL_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Discovery backend selected by the `discovery` section of the config.
#[derive(Clone)]
pub enum ConfiguredDiscovery {
    Static(Arc<StaticDiscovery>),
    Consul(Arc<ConsulDiscovery>),
}

impl ConfiguredDiscovery {
    pub fn from_config(config: &DiscoveryBackendConfig) -> Result<Self> {
        match config {
            DiscoveryBackendConfig::Static { services } => {
                Ok(Self::Static(Arc::new(StaticDiscovery::from_config(services))))
            }
            DiscoveryBackendConfig::Consul {
                address,
                datacenter,
                token,
            } => Ok(Self::Consul(Arc::new(ConsulDiscovery::new(
                address,
                datacenter.clone(),
                token.clone(),
                CONSUL_REQUEST_TIMEOUT,
            )?))),
        }
    }

    pub fn backend(&self) -> Arc<dyn DiscoveryBackend> {
        match self {
            Self::Static(discovery) => discovery.clone(),
            Self::Consul(discovery) => discovery.clone(),
        }
    }

    /// The in-memory catalogue, which the active health checker drives.
    /// Consul runs its own checks.
    pub fn static_catalogue(&self) -> Option<Arc<StaticDiscovery>> {
        match self {
            Self::Static(discovery) => Some(discovery.clone()),
            Self::Consul(_) => None,
        }
    }
}
