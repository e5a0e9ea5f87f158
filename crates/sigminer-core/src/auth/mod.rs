//! Microsoft identity platform sign-in
//!
//! Silent acquisition uses the cached token (refreshing it when needed);
//! interactive acquisition uses the device-code flow so it works from a
//! terminal.

mod token_cache;

pub use token_cache::{FileTokenStore, OAuthTokens, TokenStore};

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Scopes requested for mailbox access
pub const MAIL_SCOPES: &[&str] = &[
    "openid",
    "profile",
    "offline_access",
    "User.Read",
    "Mail.Read",
];

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Account label used in errors when the user is unknown
const UNKNOWN_ACCOUNT: &str = "mailbox";

/// Identity provider application settings
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub client_id: String,
    pub tenant_id: String,
    pub authority_host: String,
}

impl IdentityConfig {
    /// Read client and tenant ids from the configuration document
    pub fn from_config(config: &Config) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfig {
                field: "CLIENT_ID".to_string(),
                reason: "set it with `sigminer config set-client-id`".to_string(),
            })?;
        let tenant_id = config
            .tenant_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| Error::InvalidConfig {
                field: "TENANT_ID".to_string(),
                reason: "set it with `sigminer config set-tenant-id`".to_string(),
            })?;

        Ok(Self {
            client_id,
            tenant_id,
            authority_host: config.settings.authority_host.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}/oauth2/v2.0/{}",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id,
            path
        )
    }
}

/// Device-code challenge shown to the user
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    /// Ready-made instruction text from the provider
    #[serde(default)]
    pub message: String,
}

fn default_poll_interval() -> u64 {
    5
}

/// Response from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    scope: Option<String>,
    id_token: Option<String>,
}

/// Error body from the token endpoint
#[derive(Debug, Default, Deserialize)]
struct TokenError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// OAuth manager for the mailbox account
pub struct OAuthManager {
    config: IdentityConfig,
    client: Client,
    store: Arc<dyn TokenStore>,
}

impl OAuthManager {
    /// Create a manager storing tokens in the config directory's token cache
    pub fn from_config(config: &Config) -> Result<Self> {
        let identity = IdentityConfig::from_config(config)?;
        let store = Arc::new(FileTokenStore::new(config.token_cache_path()));
        Ok(Self::with_store(identity, store))
    }

    /// Create with a custom token store
    pub fn with_store(config: IdentityConfig, store: Arc<dyn TokenStore>) -> Self {
        Self {
            config,
            client: Client::new(),
            store,
        }
    }

    /// Get the token store
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Get a valid access token without user interaction, refreshing if necessary
    pub async fn get_access_token(&self) -> Result<String> {
        let tokens = self.store.load().await?.ok_or_else(|| Error::TokenExpired {
            account: UNKNOWN_ACCOUNT.to_string(),
        })?;

        if !tokens.is_expired() {
            debug!("Cached token still valid");
            return Ok(tokens.access_token);
        }

        let account = tokens
            .account
            .clone()
            .unwrap_or_else(|| UNKNOWN_ACCOUNT.to_string());
        if !tokens.can_refresh() {
            return Err(Error::TokenExpired { account });
        }

        info!("Token expired for {}, refreshing...", account);
        let refreshed = self.refresh(&tokens).await?;
        Ok(refreshed.access_token)
    }

    /// Exchange the refresh token for a new access token and persist it
    pub async fn refresh(&self, current: &OAuthTokens) -> Result<OAuthTokens> {
        let account = current
            .account
            .clone()
            .unwrap_or_else(|| UNKNOWN_ACCOUNT.to_string());
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| Error::TokenExpired { account: account.clone() })?;

        let scopes = MAIL_SCOPES.join(" ");
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("scope", scopes.as_str()),
        ];

        let response = self
            .client
            .post(self.config.endpoint("token"))
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Token refresh failed for {}: {} - {}", account, status, body);
            return Err(Error::TokenRefreshFailed {
                account,
                reason: format!("{} - {}", status, body),
            });
        }

        let token_response: TokenResponse = response.json().await?;
        let mut tokens = tokens_from_response(token_response);
        // Keep the old refresh token and account if not provided
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }
        if tokens.account.is_none() {
            tokens.account = current.account.clone();
        }

        self.store.store(&tokens).await?;
        info!("Refreshed access token for {}", account);
        Ok(tokens)
    }

    /// Start the device-code flow
    pub async fn start_device_flow(&self) -> Result<DeviceCode> {
        let scopes = MAIL_SCOPES.join(" ");
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("scope", scopes.as_str()),
        ];

        let response = self
            .client
            .post(self.config.endpoint("devicecode"))
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!(
                "Device code request failed: {} - {}",
                status, body
            )));
        }

        let code: DeviceCode = response.json().await?;
        debug!("Device code issued, expires in {}s", code.expires_in);
        Ok(code)
    }

    /// Poll until the user completes the device-code sign-in, then persist the tokens
    pub async fn complete_device_flow(&self, code: &DeviceCode) -> Result<OAuthTokens> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(code.expires_in);
        let mut interval = code.interval;

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Auth(
                    "Unable to obtain a token: the device code expired".to_string(),
                ));
            }

            let params = [
                ("client_id", self.config.client_id.as_str()),
                ("grant_type", DEVICE_CODE_GRANT),
                ("device_code", code.device_code.as_str()),
            ];
            let response = self
                .client
                .post(self.config.endpoint("token"))
                .form(&params)
                .send()
                .await?;

            if response.status().is_success() {
                let token_response: TokenResponse = response.json().await?;
                let tokens = tokens_from_response(token_response);
                self.store.store(&tokens).await?;
                info!(
                    "Signed in as {}",
                    tokens.account.as_deref().unwrap_or(UNKNOWN_ACCOUNT)
                );
                return Ok(tokens);
            }

            let body = response.text().await.unwrap_or_default();
            let token_error: TokenError = serde_json::from_str(&body).unwrap_or_default();
            match token_error.error.as_str() {
                "authorization_pending" => debug!("Waiting for the user to sign in"),
                "slow_down" => {
                    interval += 5;
                    warn!("Token endpoint asked to slow down, polling every {}s", interval);
                }
                _ => {
                    let reason = if token_error.error_description.is_empty() {
                        body
                    } else {
                        token_error.error_description
                    };
                    return Err(Error::Auth(format!("Unable to obtain a token: {}", reason)));
                }
            }
        }
    }

    /// Forget the signed-in account
    pub async fn logout(&self) -> Result<()> {
        self.store.clear().await
    }
}

fn tokens_from_response(response: TokenResponse) -> OAuthTokens {
    let account = response.id_token.as_deref().and_then(username_from_id_token);
    OAuthTokens {
        access_token: response.access_token,
        refresh_token: response.refresh_token,
        expires_at: chrono::Utc::now().timestamp() + response.expires_in,
        scopes: response
            .scope
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_else(|| MAIL_SCOPES.iter().map(|s| s.to_string()).collect()),
        account,
    }
}

/// Read the `preferred_username` claim from an unverified id token
fn username_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims["preferred_username"]
        .as_str()
        .or_else(|| claims["email"].as_str())
        .map(String::from)
}
