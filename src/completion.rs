//! OpenAI-compatible agent runtime.
//!
//! A minimal [`AgentRuntime`] for running the session on its own: persona from
//! environment variables, state composed from that persona, and completions
//! from any `/chat/completions` endpoint.

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::env;
use uuid::Uuid;

use crate::error::{BoxError, SessionError};
use crate::oauth::build_oauth2_user_context_header;
use crate::runtime::{stable_uuid, AgentRuntime, Character, CompletionRequest, State, StateRequest};
use crate::twitter::sanitize_for_logging;

/// Default OpenAI API root.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Runtime backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiRuntime {
    http: Client,
    base_url: String,
    api_key: String,
    agent_id: Uuid,
    character: Character,
}

impl OpenAiRuntime {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        character: Character,
    ) -> Self {
        let agent_id = stable_uuid(&character.name);
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            agent_id,
            character,
        }
    }

    /// Builds the runtime from environment variables.
    ///
    /// - `OPENAI_API_KEY` (required), `OPENAI_BASE_URL`
    /// - `AGENT_NAME` (defaults to the account handle), `AGENT_BIO`,
    ///   `AGENT_LORE`, `AGENT_POST_DIRECTIONS` (`|`-separated lists), `AGENT_MODEL`
    pub fn from_env(http: Client, default_name: &str) -> Result<Self, SessionError> {
        let api_key = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SessionError::Config("missing OPENAI_API_KEY".to_string()))?;
        let base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string());

        let list = |key: &str| -> Vec<String> {
            env::var(key)
                .map(|raw| {
                    raw.split('|')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        let character = Character {
            name: env::var("AGENT_NAME").unwrap_or_else(|_| default_name.to_string()),
            bio: list("AGENT_BIO"),
            lore: list("AGENT_LORE"),
            post_directions: list("AGENT_POST_DIRECTIONS"),
            model: env::var("AGENT_MODEL").ok().filter(|m| !m.is_empty()),
        };
        info!("Loaded agent persona '{}'", character.name);

        Ok(Self::new(http, base_url, api_key, character))
    }
}

#[async_trait]
impl AgentRuntime for OpenAiRuntime {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn character(&self) -> &Character {
        &self.character
    }

    async fn compose_state(
        &self,
        _request: &StateRequest,
        extras: &HashMap<String, String>,
    ) -> Result<State, BoxError> {
        Ok(State::from_character(&self.character, extras))
    }

    async fn completion(&self, request: &CompletionRequest) -> Result<String, BoxError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": request.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "temperature": request.temperature,
            "frequency_penalty": request.frequency_penalty,
            "stop": request.stop,
        });

        debug!("Sending completion request to {} (model {})", url, request.model);
        let response = self
            .http
            .post(&url)
            .header("Authorization", build_oauth2_user_context_header(&self.api_key))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            debug!("Completion error body: {}", sanitize_for_logging(&body, 200));
            return Err(format!("completion service returned {}", status).into());
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}
