//! Credential lifecycle: the shared token pair and the refresher that renews it.
//!
//! [`CredentialStore`] is the single shared copy of the session's
//! [`Credential`]. Readers always take a whole-struct snapshot under the lock,
//! so a publish call can never observe a new access token paired with an old
//! refresh token. The session's refresh task is the only writer.

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

use crate::config::mask_token;
use crate::error::{BoxError, SessionError};
use crate::oauth::exchange_refresh_token;

/// Access/refresh token pair plus the account handle they belong to.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub account_handle: String,
}

impl Credential {
    /// Validates and builds a credential. All three fields must be non-empty.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        account_handle: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let credential = Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            account_handle: account_handle.into(),
        };
        credential.validate()?;
        Ok(credential)
    }

    /// Checks the non-empty invariant on every field.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.access_token.trim().is_empty() {
            return Err(SessionError::Config("missing access token".to_string()));
        }
        if self.refresh_token.trim().is_empty() {
            return Err(SessionError::Config("missing refresh token".to_string()));
        }
        if self.account_handle.trim().is_empty() {
            return Err(SessionError::Config("missing account handle".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &mask_token(&self.access_token))
            .field("refresh_token", &mask_token(&self.refresh_token))
            .field("account_handle", &self.account_handle)
            .finish()
    }
}

/// OAuth client identity used to authenticate the refresh-token grant.
#[derive(Clone)]
pub struct ClientIdentity {
    pub client_id: String,
    pub client_secret: String,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("client_id", &mask_token(&self.client_id))
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

/// Shared, lock-guarded home of the session's credential.
///
/// Cloning the store clones the handle, not the credential.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<RwLock<Credential>>,
}

impl CredentialStore {
    pub fn new(credential: Credential) -> Self {
        Self {
            inner: Arc::new(RwLock::new(credential)),
        }
    }

    /// Returns a consistent copy of the current credential.
    pub async fn snapshot(&self) -> Credential {
        self.inner.read().await.clone()
    }

    /// Returns the current access token.
    pub async fn access_token(&self) -> String {
        self.inner.read().await.access_token.clone()
    }

    /// Overwrites the credential. The previous pair is discarded.
    pub async fn replace(&self, credential: Credential) {
        let mut guard = self.inner.write().await;
        *guard = credential;
    }
}

/// Exchanges the current refresh token for a fresh credential.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Returns the renewed credential; `current` is left untouched.
    async fn refresh(&self, current: &Credential) -> Result<Credential, SessionError>;
}

/// Refresher backed by the platform's OAuth 2.0 token endpoint.
pub struct HttpCredentialRefresher {
    http: Client,
    token_url: Url,
    client: Option<ClientIdentity>,
}

impl HttpCredentialRefresher {
    pub fn new(http: Client, token_url: Url, client: Option<ClientIdentity>) -> Self {
        Self {
            http,
            token_url,
            client,
        }
    }
}

#[async_trait]
impl CredentialRefresher for HttpCredentialRefresher {
    async fn refresh(&self, current: &Credential) -> Result<Credential, SessionError> {
        let client = self.client.as_ref().ok_or_else(|| {
            SessionError::Auth("missing client credentials for token refresh".to_string())
        })?;

        info!("Refreshing access token for @{}", current.account_handle);
        let token = exchange_refresh_token(
            &self.http,
            &self.token_url,
            &client.client_id,
            &client.client_secret,
            &current.refresh_token,
        )
        .await?;

        let refresh_token = match token.refresh_token.filter(|t| !t.is_empty()) {
            Some(rotated) => {
                debug!("Rotated refresh token (masked): {}", mask_token(&rotated));
                rotated
            }
            None => {
                debug!("Token endpoint did not rotate the refresh token, keeping the current one");
                current.refresh_token.clone()
            }
        };

        debug!(
            "Updated access token (masked): {}",
            mask_token(&token.access_token)
        );

        Ok(Credential {
            access_token: token.access_token,
            refresh_token,
            account_handle: current.account_handle.clone(),
        })
    }
}

/// Durable home for rotated refresh tokens.
///
/// Rotated refresh tokens invalidate the previous one, so losing the new one
/// on restart locks the account out until it is re-authorized.
#[async_trait]
pub trait TokenVault: Send + Sync {
    async fn save_refresh_token(&self, token: &str) -> Result<(), BoxError>;
}
