//! Token resolution at connection-upgrade time.
//!
//! A failed resolution rejects the upgrade outright; there is no partial
//! session.

use async_trait::async_trait;
use common::PrincipalId;
use dashmap::DashMap;
use thiserror::Error;

/// Errors raised during token resolution.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
}

/// Trait for resolving a bearer token to a principal.
#[async_trait]
pub trait TokenAuth: Send + Sync + 'static {
    async fn resolve(&self, token: &str) -> Result<PrincipalId, AuthError>;
}

/// Static token table, configurable from the environment
/// (`token:principal` pairs, comma-separated).
pub struct StaticTokenAuth {
    tokens: DashMap<String, PrincipalId>,
}

impl StaticTokenAuth {
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    pub fn insert(&self, token: impl Into<String>, principal: PrincipalId) {
        self.tokens.insert(token.into(), principal);
    }

    /// Parse a spec like `"dev:1,admin:2"`. Entries that do not parse are
    /// skipped.
    pub fn from_spec(spec: &str) -> Self {
        let auth = Self::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some((token, principal)) = entry.rsplit_once(':') {
                if let Ok(principal) = principal.parse::<PrincipalId>() {
                    auth.insert(token, principal);
                }
            }
        }
        auth
    }
}

impl Default for StaticTokenAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenAuth for StaticTokenAuth {
    async fn resolve(&self, token: &str) -> Result<PrincipalId, AuthError> {
        self.tokens
            .get(token)
            .map(|p| *p)
            .ok_or(AuthError::InvalidToken)
    }
}
