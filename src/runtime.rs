//! Interfaces to the agent runtime and the memory store.
//!
//! The session does not own an LLM, a state composer or a database. It talks
//! to them through [`AgentRuntime`] and [`MemoryStore`], and this module
//! defines the records that cross those boundaries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::BoxError;

/// Dimension of the placeholder embedding attached to memory records.
pub const EMBEDDING_DIMENSION: usize = 1536;

/// Source tag written into every memory record created by this client.
pub const MEMORY_SOURCE: &str = "twitter_oauth";

/// Derives a deterministic UUID from a seed string.
///
/// The same seed always yields the same identifier, across processes and
/// restarts.
pub fn stable_uuid(seed: &str) -> Uuid {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// All-zero embedding used when the client has no embedding of its own.
pub fn zero_embedding() -> Vec<f32> {
    vec![0.0; EMBEDDING_DIMENSION]
}

/// Persona fields of the agent the session posts for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub bio: Vec<String>,
    #[serde(default)]
    pub lore: Vec<String>,
    #[serde(default)]
    pub post_directions: Vec<String>,
    /// Model override from the character settings
    #[serde(default)]
    pub model: Option<String>,
}

/// Message content handed to the runtime when composing state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: String,
    #[serde(default)]
    pub action: String,
}

/// Scope of a state composition request.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRequest {
    pub actor_id: Uuid,
    pub room_id: Uuid,
    pub content: MessageContent,
}

/// Conversational state returned by the runtime.
///
/// Opaque to the session except as the set of values a prompt template can
/// reference by `{{key}}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    values: HashMap<String, String>,
}

impl State {
    /// Builds state from a character's persona plus request-specific extras.
    /// Extras override persona values with the same key.
    pub fn from_character(character: &Character, extras: &HashMap<String, String>) -> Self {
        let mut values = HashMap::new();
        values.insert("agentName".to_string(), character.name.clone());
        values.insert("bio".to_string(), character.bio.join(" "));
        values.insert("lore".to_string(), character.lore.join("\n"));
        values.insert(
            "postDirections".to_string(),
            character.post_directions.join("\n"),
        );
        for (key, value) in extras {
            values.insert(key.clone(), value.clone());
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

/// Parameters for one completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub stop: Vec<String>,
    pub temperature: f32,
    pub frequency_penalty: f32,
    pub model: String,
}

/// Content of a persisted memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryContent {
    pub text: String,
    pub source: String,
}

/// A persisted unit of conversational history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub room_id: Uuid,
    pub content: MemoryContent,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Builds a record for text this client posted in `room_id`.
    ///
    /// The id is derived from the room and the creation timestamp in
    /// milliseconds.
    pub fn posted(actor_id: Uuid, room_id: Uuid, text: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: stable_uuid(&format!("{}:{}", room_id, created_at.timestamp_millis())),
            actor_id,
            room_id,
            content: MemoryContent {
                text: text.to_string(),
                source: MEMORY_SOURCE.to_string(),
            },
            embedding: zero_embedding(),
            created_at,
        }
    }
}

/// The orchestrating agent runtime: identity, state composition and completion.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Identity of the agent the session acts for.
    fn agent_id(&self) -> Uuid;

    /// Persona of the agent.
    fn character(&self) -> &Character;

    /// Makes sure `room_id` exists before anything is recorded in it.
    async fn ensure_room(&self, _room_id: Uuid) -> Result<(), BoxError> {
        Ok(())
    }

    /// Makes sure `user_id` (known on the platform as `handle`) participates in `room_id`.
    async fn ensure_participant(
        &self,
        _user_id: Uuid,
        _handle: &str,
        _room_id: Uuid,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    /// Composes conversational state for a message in a room.
    async fn compose_state(
        &self,
        request: &StateRequest,
        extras: &HashMap<String, String>,
    ) -> Result<State, BoxError>;

    /// Runs one completion. An empty string means the model produced nothing.
    async fn completion(&self, request: &CompletionRequest) -> Result<String, BoxError>;
}

/// Long-term memory persistence.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn create_memory(&self, record: &MemoryRecord) -> Result<(), BoxError>;
}

/// Process-local memory store, used when no database is configured.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<Vec<MemoryRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out every record stored so far, oldest first.
    pub fn records(&self) -> Vec<MemoryRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn create_memory(&self, record: &MemoryRecord) -> Result<(), BoxError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}
