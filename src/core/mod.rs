pub mod circuit_breaker;
pub mod errors;
pub mod gateway;
pub mod instance;
pub mod load_balancer;
pub mod proxy_manager;
pub mod rate_limiter;
pub mod registry;
pub mod router;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitPermit, CircuitState};
pub use errors::GatewayError;
pub use gateway::GatewayService;
pub use instance::{InstanceSnapshot, ServiceInstance};
pub use load_balancer::{LoadBalancerFactory, LoadBalancingStrategy};
pub use proxy_manager::{Deadline, ForwardContext, ProxyManager};
pub use rate_limiter::{RateLimitDecision, RouteRateLimiter};
pub use registry::{RegistrySettings, ServiceRegistry};
pub use router::{Route, Router};
