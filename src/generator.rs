//! Post generation: prompt rendering, completion and output cleanup.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::SessionError;
use crate::mentions::MentionEvent;
use crate::runtime::{stable_uuid, AgentRuntime, CompletionRequest, MessageContent, State, StateRequest};

/// Platform limit for a single post, in UTF-16 code units.
pub const MAX_POST_LENGTH: usize = 280;

/// Seed for the room that groups every scheduled post.
pub const ROOM_SEED: &str = "twitter_room";

/// Model used when the character does not name one.
pub const DEFAULT_MODEL: &str = "gpt-4-turbo";

pub const TEMPERATURE: f32 = 0.7;
pub const FREQUENCY_PENALTY: f32 = 1.2;
pub const STOP_SEQUENCES: [&str; 2] = ["<|eot_id|>", "<|eom_id|>"];

pub const TOPICS: [&str; 14] = [
    "life",
    "love",
    "dreams",
    "success",
    "happiness",
    "friendship",
    "adventure",
    "creativity",
    "inspiration",
    "growth",
    "change",
    "passion",
    "wisdom",
    "courage",
];

pub const TONES: [&str; 10] = [
    "thoughtful",
    "witty",
    "sarcastic",
    "inspiring",
    "reflective",
    "humorous",
    "passionate",
    "observant",
    "clever",
    "insightful",
];

/// Prompt for scheduled original posts.
pub const POST_TEMPLATE: &str = "About {{agentName}} (@{{twitterUserName}}):
{{bio}}
{{lore}}
{{postDirections}}

# Task: Write a post in the voice and style of {{agentName}}, aka @{{twitterUserName}}
Write one sentence with a {{tone}} take on {{topic}}, without naming {{topic}} itself, from the perspective of {{agentName}}. Make it different from earlier posts. Reply with the post only, no commentary.
No questions, no emojis. Short declarative statements only.";

/// Prompt for replies to mentions.
pub const REPLY_TEMPLATE: &str = "About {{agentName}} (@{{twitterUserName}}):
{{bio}}
{{lore}}
{{postDirections}}

# Task: Reply as {{agentName}} to this post from @{{mentionAuthor}}:
{{mentionText}}

Reply with one or two sentences only, no commentary. No emojis.";

/// The stable room every scheduled post is recorded in.
pub fn room_id() -> Uuid {
    stable_uuid(ROOM_SEED)
}

/// Picks a topic and a tone uniformly at random.
pub fn pick_topic_and_tone<R: Rng + ?Sized>(rng: &mut R) -> (&'static str, &'static str) {
    let topic = TOPICS[rng.gen_range(0..TOPICS.len())];
    let tone = TONES[rng.gen_range(0..TONES.len())];
    (topic, tone)
}

/// Substitutes every `{{key}}` in `template` with the matching state value.
/// Keys missing from the state render as the empty string.
pub fn compose_context(state: &State, template: &str) -> String {
    let Ok(re) = Regex::new(r"\{\{(\w+)\}\}") else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures| {
        state.get(&caps[1]).unwrap_or_default().to_string()
    })
    .into_owned()
}

/// Cleans raw completion output into post text.
///
/// Unescapes literal `\n`, strips one leading and one trailing quote, strips a
/// leading `Tweet:` label, trims, then bounds the length with
/// [`truncate_post`].
pub fn clean_generated_text(raw: &str) -> String {
    let mut text = raw.replace("\\n", "\n");

    if text.starts_with('"') || text.starts_with('\'') {
        text.remove(0);
    }
    if text.ends_with('"') || text.ends_with('\'') {
        text.pop();
    }

    if let Ok(label) = Regex::new(r"(?i)^tweet: ") {
        text = label.replace(&text, "").into_owned();
    }

    truncate_post(text.trim())
}

/// Bounds `text` to [`MAX_POST_LENGTH`] UTF-16 code units, the unit the
/// platform counts in, ending in `...` when cut. Cuts fall on character
/// boundaries, so a surrogate pair is never split.
pub fn truncate_post(text: &str) -> String {
    if utf16_len(text) <= MAX_POST_LENGTH {
        return text.to_string();
    }

    let budget = MAX_POST_LENGTH - 3;
    let mut used = 0;
    let mut truncated = String::with_capacity(text.len().min(budget * 4));
    for c in text.chars() {
        let width = c.len_utf16();
        if used + width > budget {
            break;
        }
        used += width;
        truncated.push(c);
    }
    truncated.push_str("...");
    truncated
}

/// Length of `text` in UTF-16 code units.
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// One generated post, alive for a single publish cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedPost {
    pub text: String,
    pub topic: String,
    pub tone: String,
    pub created_at: DateTime<Utc>,
}

/// Builds prompts, calls the completion service and cleans the result.
#[derive(Clone)]
pub struct ContentGenerator {
    runtime: Arc<dyn AgentRuntime>,
    handle: String,
}

impl ContentGenerator {
    pub fn new(runtime: Arc<dyn AgentRuntime>, handle: impl Into<String>) -> Self {
        Self {
            runtime,
            handle: handle.into(),
        }
    }

    /// The agent runtime this generator talks to.
    pub fn runtime(&self) -> &Arc<dyn AgentRuntime> {
        &self.runtime
    }

    /// Generates an original post about a random topic in a random tone.
    ///
    /// # Errors
    ///
    /// [`SessionError::Generation`] when state composition or completion
    /// fails, or when the cleaned output is empty.
    pub async fn generate(&self) -> Result<GeneratedPost, SessionError> {
        let (topic, tone) = pick_topic_and_tone(&mut rand::thread_rng());
        let room_id = room_id();
        let agent_id = self.runtime.agent_id();

        info!("Generating post as @{} (topic: {}, tone: {})", self.handle, topic, tone);

        self.runtime
            .ensure_room(room_id)
            .await
            .map_err(|e| SessionError::Generation(format!("failed to ensure room: {}", e)))?;
        self.runtime
            .ensure_participant(agent_id, &self.handle, room_id)
            .await
            .map_err(|e| SessionError::Generation(format!("failed to ensure participant: {}", e)))?;

        let mut extras = HashMap::new();
        extras.insert("twitterUserName".to_string(), self.handle.clone());
        extras.insert("topic".to_string(), topic.to_string());
        extras.insert("tone".to_string(), tone.to_string());

        let request = StateRequest {
            actor_id: agent_id,
            room_id,
            content: MessageContent::default(),
        };
        let state = self
            .runtime
            .compose_state(&request, &extras)
            .await
            .map_err(|e| SessionError::Generation(format!("failed to compose state: {}", e)))?;

        let text = self.complete(compose_context(&state, POST_TEMPLATE)).await?;

        Ok(GeneratedPost {
            text,
            topic: topic.to_string(),
            tone: tone.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Generates a reply to `event` using the state composed for it.
    pub async fn generate_reply(
        &self,
        event: &MentionEvent,
        state: &State,
    ) -> Result<String, SessionError> {
        let mut state = state.clone();
        if state.get("twitterUserName").is_none() {
            state.insert("twitterUserName", self.handle.clone());
        }
        state.insert("mentionAuthor", event.author_handle.clone());
        state.insert("mentionText", event.text.clone());

        self.complete(compose_context(&state, REPLY_TEMPLATE)).await
    }

    async fn complete(&self, prompt: String) -> Result<String, SessionError> {
        let model = self
            .runtime
            .character()
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        debug!("Completion prompt ({} chars) for model {}", prompt.len(), model);

        let request = CompletionRequest {
            prompt,
            stop: STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
            temperature: TEMPERATURE,
            frequency_penalty: FREQUENCY_PENALTY,
            model,
        };

        let raw = self
            .runtime
            .completion(&request)
            .await
            .map_err(|e| SessionError::Generation(format!("completion failed: {}", e)))?;

        let text = clean_generated_text(&raw);
        if text.is_empty() {
            warn!("Completion returned no usable text");
            return Err(SessionError::Generation(
                "completion returned empty output".to_string(),
            ));
        }

        info!("Generated text: {}", text);
        Ok(text)
    }
}
