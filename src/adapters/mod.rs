pub mod auth;
pub mod consul;
pub mod discovery;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod middleware;
pub mod static_discovery;

/// Re-export commonly used types from adapters
pub use auth::StaticTokenValidator;
pub use consul::ConsulDiscovery;
pub use discovery::ConfiguredDiscovery;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use middleware::*;
pub use static_discovery::StaticDiscovery;
