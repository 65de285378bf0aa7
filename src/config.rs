//! Configuration module for the Twitter OAuth session.
//!
//! This module contains the session configuration structure and the
//! environment variable handling used to build it.

use log::{debug, error, info, warn};
use reqwest::Client;
use std::env;
use std::time::Duration;
use url::Url;

use crate::credentials::{ClientIdentity, Credential};
use crate::error::SessionError;

/// Default Twitter API v2 base URL.
pub const DEFAULT_API_BASE: &str = "https://api.twitter.com/2";

/// Default OAuth 2.0 token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://api.twitter.com/2/oauth2/token";

/// Default cadence for both the refresh and the publish task (one hour).
pub const DEFAULT_CADENCE_SECS: u64 = 60 * 60;

/// Default per-request timeout for outbound HTTP calls.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Masks a secret for logging, keeping at most the first and last 8 characters.
///
/// # Example
///
/// ```rust
/// use twitter_oauth_session::config::mask_token;
///
/// assert_eq!(mask_token("abcdefghijklmnopqrstuvwxyz"), "abcdefgh...stuvwxyz");
/// assert_eq!(mask_token("short"), "short...");
/// ```
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    let len = chars.len();
    if len > 16 {
        let prefix: String = chars[..8].iter().collect();
        let suffix: String = chars[len - 8..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        let prefix: String = chars[..len.min(8)].iter().collect();
        format!("{}...", prefix)
    }
}

/// UTC hour window during which scheduled posts are allowed.
///
/// Both ends are inclusive. A window whose start is after its end wraps
/// around midnight (`22-6` allows 22:00 through 06:59).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    pub start: u32,
    pub end: u32,
}

impl ActiveHours {
    /// Parses a `start-end` hour range such as `8-23`.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let (start, end) = raw
            .split_once('-')
            .ok_or_else(|| SessionError::Config(format!("invalid hour window '{}'", raw)))?;
        let start: u32 = start
            .trim()
            .parse()
            .map_err(|_| SessionError::Config(format!("invalid start hour in '{}'", raw)))?;
        let end: u32 = end
            .trim()
            .parse()
            .map_err(|_| SessionError::Config(format!("invalid end hour in '{}'", raw)))?;
        if start > 23 || end > 23 {
            return Err(SessionError::Config(format!(
                "hours must be between 0 and 23, got '{}'",
                raw
            )));
        }
        Ok(Self { start, end })
    }

    /// Returns true if `hour` falls inside the window.
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour <= self.end
        } else {
            hour >= self.start || hour <= self.end
        }
    }
}

/// Configuration for one Twitter OAuth session.
///
/// Holds the initial credential, the client identity used for token refresh,
/// the platform endpoints and the two task cadences.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial access/refresh token pair and account handle
    pub credential: Credential,
    /// Client identity for the refresh-token grant (absent disables successful refresh)
    pub client: Option<ClientIdentity>,
    /// Twitter API v2 base URL
    pub api_base: Url,
    /// OAuth 2.0 token endpoint
    pub token_url: Url,
    /// Interval between token refresh ticks
    pub refresh_cadence: Duration,
    /// Interval between scheduled publish ticks
    pub publish_cadence: Duration,
    /// Optional UTC hour window for scheduled posts
    pub active_hours: Option<ActiveHours>,
}

impl SessionConfig {
    /// Builds a configuration from an explicit credential with default
    /// endpoints and cadences.
    pub fn new(credential: Credential) -> Result<Self, SessionError> {
        Ok(Self {
            credential,
            client: None,
            api_base: parse_url("TWITTER_API_BASE", DEFAULT_API_BASE)?,
            token_url: parse_url("TWITTER_TOKEN_URL", DEFAULT_TOKEN_URL)?,
            refresh_cadence: Duration::from_secs(DEFAULT_CADENCE_SECS),
            publish_cadence: Duration::from_secs(DEFAULT_CADENCE_SECS),
            active_hours: None,
        })
    }

    /// Sets the client identity used for token refresh.
    pub fn with_client(mut self, client: ClientIdentity) -> Self {
        self.client = Some(client);
        self
    }

    /// Overrides both task cadences.
    pub fn with_cadences(mut self, refresh: Duration, publish: Duration) -> Self {
        self.refresh_cadence = refresh;
        self.publish_cadence = publish;
        self
    }

    /// Creates a new `SessionConfig` by loading values from environment variables.
    ///
    /// # Required Environment Variables
    ///
    /// - `TWITTER_ACCESS_TOKEN`: OAuth 2.0 User Context access token
    /// - `TWITTER_REFRESH_TOKEN`: refresh token for the same grant
    /// - `TWITTER_USERNAME`: the account handle the session posts as
    ///
    /// # Optional Environment Variables
    ///
    /// - `TWITTER_CLIENT_ID` / `TWITTER_CLIENT_SECRET`: client identity for token refresh
    /// - `TWITTER_API_BASE`, `TWITTER_TOKEN_URL`: endpoint overrides
    /// - `TOKEN_REFRESH_INTERVAL_SECS`, `POST_INTERVAL_SECS`: cadences (default 3600)
    /// - `POST_ACTIVE_HOURS`: UTC hour window such as `8-23`
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] if a required variable is missing or
    /// empty, or if an optional value is present but malformed.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`SessionConfig::from_env`], reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SessionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        info!("Loading Twitter session configuration");

        let access_token = required(&lookup, "TWITTER_ACCESS_TOKEN")?;
        let refresh_token = required(&lookup, "TWITTER_REFRESH_TOKEN")?;
        let account_handle = required(&lookup, "TWITTER_USERNAME")?;

        debug!("Access token (masked): {}", mask_token(&access_token));
        debug!("Refresh token (masked): {}", mask_token(&refresh_token));
        if access_token.len() < 10 {
            warn!(
                "Access token seems unusually short ({} characters)",
                access_token.len()
            );
        }

        let credential = Credential::new(access_token, refresh_token, account_handle)?;

        let client = match (
            non_empty(lookup("TWITTER_CLIENT_ID")),
            non_empty(lookup("TWITTER_CLIENT_SECRET")),
        ) {
            (Some(id), Some(secret)) => {
                debug!("Client ID (masked): {}", mask_token(&id));
                Some(ClientIdentity::new(id, secret))
            }
            _ => {
                warn!("TWITTER_CLIENT_ID or TWITTER_CLIENT_SECRET missing - token refresh ticks will fail until both are set");
                None
            }
        };

        let api_base = parse_url(
            "TWITTER_API_BASE",
            &lookup("TWITTER_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
        )?;
        let token_url = parse_url(
            "TWITTER_TOKEN_URL",
            &lookup("TWITTER_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
        )?;

        let refresh_cadence = cadence(&lookup, "TOKEN_REFRESH_INTERVAL_SECS")?;
        let publish_cadence = cadence(&lookup, "POST_INTERVAL_SECS")?;

        let active_hours = match non_empty(lookup("POST_ACTIVE_HOURS")) {
            Some(raw) => Some(ActiveHours::parse(&raw)?),
            None => None,
        };

        info!(
            "Twitter session configuration loaded for @{} (refresh every {}s, post every {}s)",
            credential.account_handle,
            refresh_cadence.as_secs(),
            publish_cadence.as_secs()
        );

        Ok(Self {
            credential,
            client,
            api_base,
            token_url,
            refresh_cadence,
            publish_cadence,
            active_hours,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn required<F>(lookup: &F, key: &str) -> Result<String, SessionError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup(key)) {
        Some(value) => {
            info!("Found {} with length: {}", key, value.len());
            Ok(value)
        }
        None => {
            error!("Missing {} - make sure the variable is set", key);
            Err(SessionError::Config(format!("missing {}", key)))
        }
    }
}

fn cadence<F>(lookup: &F, key: &str) -> Result<Duration, SessionError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = match non_empty(lookup(key)) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|_| SessionError::Config(format!("{} must be a number of seconds", key)))?,
        None => DEFAULT_CADENCE_SECS,
    };
    if secs == 0 {
        return Err(SessionError::Config(format!("{} must be greater than zero", key)));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_url(key: &str, raw: &str) -> Result<Url, SessionError> {
    Url::parse(raw).map_err(|e| SessionError::Config(format!("{} is not a valid URL: {}", key, e)))
}

/// Gets the server port from environment variables or returns the default.
///
/// Reads `PORT` and parses it as a u16, falling back to 3000 when the variable
/// is unset or not a valid port.
pub fn get_server_port() -> u16 {
    match env::var("PORT") {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("PORT '{}' is not a valid port number, using 3000", raw);
            3000
        }),
        Err(_) => 3000,
    }
}

/// Gets the shared secret for the routes that post as the account from
/// `WEBHOOK_SECRET`. `None` when unset or blank.
pub fn get_webhook_secret() -> Option<String> {
    non_empty(env::var("WEBHOOK_SECRET").ok()).map(|secret| secret.trim().to_string())
}

/// Gets the outbound HTTP timeout from `HTTP_TIMEOUT_SECS`, defaulting to
/// 30 seconds when unset, zero or not a number.
pub fn get_http_timeout() -> Duration {
    let secs = match env::var("HTTP_TIMEOUT_SECS") {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => secs,
            _ => {
                warn!(
                    "HTTP_TIMEOUT_SECS '{}' is not a positive number, using {}",
                    raw, DEFAULT_HTTP_TIMEOUT_SECS
                );
                DEFAULT_HTTP_TIMEOUT_SECS
            }
        },
        Err(_) => DEFAULT_HTTP_TIMEOUT_SECS,
    };
    Duration::from_secs(secs)
}

/// Builds the HTTP client shared by the token endpoint, the Twitter API and
/// the completion service. Every request is bounded by `timeout`.
pub fn build_http_client(timeout: Duration) -> Result<Client, SessionError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SessionError::Config(format!("failed to build HTTP client: {}", e)))
}
