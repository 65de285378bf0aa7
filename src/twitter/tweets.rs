//! Post operations for the Twitter API.
//!
//! [`PublishGateway`] is the session's outbound seam; [`XPublisher`] is its
//! Twitter API v2 implementation.

use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::json;
use url::Url;

use crate::credentials::CredentialStore;
use crate::error::SessionError;
use crate::oauth::build_oauth2_user_context_header;

use super::api::send_request;

/// Sends finished text to the platform.
///
/// Both operations return [`SessionError::Publish`] on failure, and callers
/// receive that error unchanged.
#[async_trait]
pub trait PublishGateway: Send + Sync {
    /// Posts `text` as an original post.
    async fn publish(&self, text: &str) -> Result<(), SessionError>;

    /// Posts `text` as a reply to the post `target_id`.
    async fn reply(&self, text: &str, target_id: &str) -> Result<(), SessionError>;
}

/// Publishes through `POST /2/tweets` with the session's current access token.
pub struct XPublisher {
    http: Client,
    tweets_url: Url,
    credentials: CredentialStore,
}

impl XPublisher {
    /// `api_base` is the v2 root, e.g. `https://api.twitter.com/2`.
    pub fn new(http: Client, api_base: &Url, credentials: CredentialStore) -> Result<Self, SessionError> {
        let base = api_base.as_str().trim_end_matches('/');
        let tweets_url = Url::parse(&format!("{}/tweets", base))
            .map_err(|e| SessionError::Config(format!("invalid API base URL: {}", e)))?;
        Ok(Self {
            http,
            tweets_url,
            credentials,
        })
    }

    async fn create_post(
        &self,
        payload: serde_json::Value,
        operation_name: &str,
    ) -> Result<(), SessionError> {
        // Read the token as late as possible so a completed refresh is picked up.
        let access_token = self.credentials.access_token().await;

        debug!("Request URL: {}", self.tweets_url);
        debug!("Request headers: Authorization: Bearer [REDACTED], Content-Type: application/json");
        debug!("Request payload: {}", payload);

        let request_builder = self
            .http
            .post(self.tweets_url.clone())
            .header(AUTHORIZATION, build_oauth2_user_context_header(&access_token))
            .header(CONTENT_TYPE, "application/json")
            .json(&payload);

        match send_request(request_builder, operation_name).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Error in {}: {}", operation_name, e);
                Err(SessionError::Publish(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl PublishGateway for XPublisher {
    async fn publish(&self, text: &str) -> Result<(), SessionError> {
        info!("Posting tweet: '{}'", text);
        self.create_post(json!({ "text": text }), "post_tweet").await
    }

    async fn reply(&self, text: &str, target_id: &str) -> Result<(), SessionError> {
        info!("Replying to tweet {} with: '{}'", target_id, text);
        let payload = json!({
            "text": text,
            "reply": {
                "in_reply_to_tweet_id": target_id
            }
        });
        self.create_post(payload, "reply_to_tweet").await
    }
}
