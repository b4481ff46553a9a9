//! Switchyard - the request-routing core of an API gateway.
//!
//! Switchyard implements a **hexagonal architecture**: the gateway logic in
//! `core` talks to the outside world only through the traits in `ports`, and
//! `adapters` provide the concrete implementations (axum ingress, hyper
//! upstream client, static and Consul discovery, static token validation).
//!
//! # Features
//! - Service registry over a pluggable discovery backend, with TTL caching,
//!   retry with backoff, stale fallback and per-service change streams
//! - Longest-prefix routing on path-segment boundaries
//! - Load-balanced forwarding (round-robin, random) with bounded retries that
//!   exclude already-failed instances until every instance has been tried
//! - Per-service circuit breakers (closed / open / half-open single probe)
//! - Per-route rate limiting (fixed window or token bucket; by IP, header or route)
//! - Optional bearer token authentication through an injected validator
//! - Active health checking of statically registered instances
//! - Metrics through the `metrics` facade and structured tracing via `tracing`
//! - Graceful shutdown of every background task through one cancellation token
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use switchyard::{GatewayService, HttpClientAdapter, HttpHandler, adapters::ConfiguredDiscovery};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = switchyard::config::load_config("switchyard.yaml").await?;
//! let discovery = ConfiguredDiscovery::from_config(&cfg.discovery)?;
//! let client = Arc::new(HttpClientAdapter::new()?);
//! let gateway = Arc::new(GatewayService::new(&cfg, discovery.backend(), client, None)?);
//! let app = HttpHandler::new(gateway).into_router();
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request-path failures are [`core::GatewayError`] values mapped to HTTP
//! statuses with a JSON body. Setup APIs return `eyre::Result<T>` with
//! `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap` with per-entry state, and registry
//! snapshots are swapped atomically with `arc-swap`, so unrelated services
//! and clients never contend on one lock.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{HealthChecker, HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
