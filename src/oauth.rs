//! OAuth 2.0 helpers for Twitter/X API integration.
//!
//! This module builds the Authorization headers used by the session and
//! performs the refresh-token grant against the platform's token endpoint.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{debug, error, info};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::error::SessionError;
use crate::twitter::sanitize_for_logging;

/// Builds the Authorization header for OAuth 2.0 User Context authentication.
///
/// # Example
///
/// ```rust
/// use twitter_oauth_session::build_oauth2_user_context_header;
///
/// let header = build_oauth2_user_context_header("your_access_token");
/// assert_eq!(header, "Bearer your_access_token");
/// ```
pub fn build_oauth2_user_context_header(access_token: &str) -> String {
    format!("Bearer {}", access_token)
}

/// Builds the HTTP Basic Authorization header for a confidential client.
///
/// The value is `Basic base64(client_id:client_secret)`, as required by the
/// token endpoint.
///
/// # Example
///
/// ```rust
/// use twitter_oauth_session::oauth::build_basic_auth_header;
///
/// assert_eq!(build_basic_auth_header("id", "secret"), "Basic aWQ6c2VjcmV0");
/// ```
pub fn build_basic_auth_header(client_id: &str, client_secret: &str) -> String {
    let encoded = STANDARD.encode(format!("{}:{}", client_id, client_secret));
    format!("Basic {}", encoded)
}

/// Token endpoint response for the refresh-token grant.
///
/// The platform does not rotate the refresh token on every call, so
/// `refresh_token` is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Exchanges a refresh token for a new access token.
///
/// Sends `grant_type=refresh_token&refresh_token=<token>` form-encoded to
/// `token_url` with Basic client authentication.
///
/// # Errors
///
/// Returns [`SessionError::Auth`] on network failure, a non-success status,
/// an unparseable body, or a response without a non-empty `access_token`.
pub async fn exchange_refresh_token(
    client: &Client,
    token_url: &Url,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<TokenResponse, SessionError> {
    info!("Requesting new access token from {}", token_url);

    let body = serde_urlencoded::to_string([
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ])
    .map_err(|e| SessionError::Auth(format!("failed to encode token request: {}", e)))?;

    let response = client
        .post(token_url.clone())
        .header(AUTHORIZATION, build_basic_auth_header(client_id, client_secret))
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await
        .map_err(|e| SessionError::Auth(format!("token request failed: {}", e)))?;

    let status = response.status();
    let response_text = response
        .text()
        .await
        .map_err(|e| SessionError::Auth(format!("failed to read token response: {}", e)))?;

    if !status.is_success() {
        error!("Token refresh rejected - Status: {}", status);
        debug!(
            "Token endpoint error body: {}",
            sanitize_for_logging(&response_text, 200)
        );
        return Err(SessionError::Auth(format!(
            "token endpoint returned {}",
            status
        )));
    }

    let token: TokenResponse = serde_json::from_str(&response_text)
        .map_err(|e| SessionError::Auth(format!("malformed token response: {}", e)))?;

    if token.access_token.is_empty() {
        return Err(SessionError::Auth(
            "token response did not contain an access_token".to_string(),
        ));
    }

    info!(
        "Token endpoint returned a new access token (refresh token rotated: {})",
        token.refresh_token.is_some()
    );
    Ok(token)
}
