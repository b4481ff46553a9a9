use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core::instance::ServiceInstance;

/// Error type for discovery backend operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The backend could not be reached or answered with an error
    #[error("Discovery backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered but the payload could not be understood
    #[error("Invalid discovery response: {0}")]
    InvalidResponse(String),

    /// Lookup failed after all retries and there is no cached snapshot to fall back on
    #[error("Discovery failed for service '{service}' after {attempts} attempts: {reason}")]
    Exhausted {
        service: String,
        attempts: u32,
        reason: String,
    },
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// DiscoveryBackend defines the port (interface) to a service catalog such as
/// Consul or a static list.
///
/// Implementations report every instance they know about together with the
/// backend's own health verdict; filtering to healthy instances is the
/// registry's job.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Fetch the current instance list for a service
    async fn fetch_instances(&self, service: &str) -> DiscoveryResult<Vec<ServiceInstance>>;

    /// Announce an instance. Re-registering an existing ID replaces it.
    async fn register(&self, instance: ServiceInstance) -> DiscoveryResult<()>;

    /// Remove an instance. Unknown IDs are not an error.
    async fn deregister(&self, service: &str, instance_id: &str) -> DiscoveryResult<()>;

    /// Names of all services known to the backend
    async fn list_services(&self) -> DiscoveryResult<Vec<String>>;

    /// Push notifications carrying the name of a service whose membership
    /// changed. Polling-only backends return `None`.
    fn subscribe_changes(&self) -> Option<broadcast::Receiver<String>> {
        None
    }
}
