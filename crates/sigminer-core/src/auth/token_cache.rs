//! Token persistence
//!
//! Tokens live in `token_cache.json` next to the configuration document.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Error, Result};

/// OAuth tokens for the signed-in mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Access token for Graph calls
    pub access_token: String,

    /// Refresh token, absent if the tenant did not grant offline access
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token expiry timestamp (Unix seconds)
    pub expires_at: i64,

    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Signed-in user (preferred_username claim), when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl OAuthTokens {
    /// Check if the access token is expired or will expire soon
    pub fn is_expired(&self) -> bool {
        let now = chrono::Utc::now().timestamp();
        // Consider expired if less than 5 minutes remaining
        self.expires_at < now + 300
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }
}

/// Storage backend for the token cache
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Get the cached tokens
    async fn load(&self) -> Result<Option<OAuthTokens>>;

    /// Persist tokens
    async fn store(&self, tokens: &OAuthTokens) -> Result<()>;

    /// Forget the cached tokens
    async fn clear(&self) -> Result<()>;
}

/// JSON file token store
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<OAuthTokens>> {
        if !self.path.exists() {
            debug!("No token cache at {:?}", self.path);
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let tokens = serde_json::from_str(&contents)
            .map_err(|e| Error::Token(format!("Unreadable token cache {:?}: {}", self.path, e)))?;
        Ok(Some(tokens))
    }

    async fn store(&self, tokens: &OAuthTokens) -> Result<()> {
        // Only write when the cache state actually changed
        if self.load().await.ok().flatten().as_ref() == Some(tokens) {
            debug!("Token cache unchanged, skipping write");
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(tokens)?;
        tokio::fs::write(&self.path, data).await?;
        debug!("Stored tokens in {:?}", self.path);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
