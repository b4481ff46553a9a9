use async_trait::async_trait;
use thiserror::Error;

/// Authenticated caller as reported by the validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

/// Error type for token validation
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Validator unavailable: {0}")]
    Unavailable(String),
}

/// TokenValidator defines the port for the external authentication collaborator.
/// It is only consulted for routes with `auth_required = true`.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}
