//! Ports: the traits the gateway core talks to its collaborators through.
pub mod auth;
pub mod discovery;
pub mod http_client;
