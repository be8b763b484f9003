/// Token verification for incoming sessions
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;

use crate::{Result, SyncError, UserId};

/// Resolves an opaque client token to the user it belongs to
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserId>;
}

/// Fixed token table, loaded from JSON (`{"token": "user-uuid"}`) or built in code
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, user: UserId) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let tokens: HashMap<String, UserId> = serde_json::from_str(json)?;
        Ok(Self { tokens })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            SyncError::Serialization(format!(
                "failed to read token file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn verify(&self, token: &str) -> Result<UserId> {
        self.tokens
            .get(token)
            .copied()
            .ok_or_else(|| SyncError::Unauthorized("unknown token".to_string()))
    }
}
