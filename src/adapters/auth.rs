use std::collections::HashMap;

use async_trait::async_trait;

use crate::ports::auth::{AuthError, Identity, TokenValidator};

/// Token validator over a fixed token → subject table from configuration.
pub struct StaticTokenValidator {
    tokens: HashMap<String, String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .get(token)
            .map(|subject| Identity {
                subject: subject.clone(),
            })
            .ok_or(AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_and_unknown_tokens() {
        let validator = StaticTokenValidator::new(HashMap::from([(
            "t0k3n".to_string(),
            "svc-reporting".to_string(),
        )]));

        let identity = validator.validate("t0k3n").await.unwrap();
        assert_eq!(identity.subject, "svc-reporting");
        assert!(matches!(
            validator.validate("other").await,
            Err(AuthError::InvalidToken)
        ));
    }
}
