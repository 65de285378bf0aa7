//! # Tests Module
//!
//! Tests for the Twitter OAuth session. Collaborators (agent runtime,
//! publisher, refresher) are replaced with in-process fakes so that every
//! test runs without network access.
//!
//! ## Test Categories
//!
//! ### Unit Tests
//! - Configuration loading (`SessionConfig::from_lookup`, `ActiveHours`)
//! - Post cleanup and truncation (`clean_generated_text`, `truncate_post`)
//! - Prompt composition (`compose_context`, `pick_topic_and_tone`)
//!
//! ### Session Tests
//! - Immediate publish at startup and memory recording
//! - Refresh and publish ticks on a paused tokio clock
//! - Error isolation between ticks and shutdown
//! - Mention routing
//!
//! ### Integration Tests
//! - HTTP endpoint testing for all routes

use crate::{
    config::{
        get_http_timeout, get_server_port, mask_token, ActiveHours, SessionConfig,
        DEFAULT_HTTP_TIMEOUT_SECS,
    },
    credentials::{Credential, CredentialRefresher},
    error::{BoxError, SessionError},
    generator::{
        clean_generated_text, compose_context, pick_topic_and_tone, room_id, truncate_post,
        utf16_len, MAX_POST_LENGTH, TONES, TOPICS,
    },
    handlers::{create_router, handle_health, AppState},
    mentions::{mention_room_id, ChannelNotifier, MentionEvent, MentionHandler, MentionNotifier},
    runtime::{
        AgentRuntime, Character, CompletionRequest, InMemoryStore, MemoryRecord, MemoryStore, State,
        StateRequest, EMBEDDING_DIMENSION, MEMORY_SOURCE,
    },
    scheduler::{ScheduledTask, TaskState},
    session::TwitterSession,
    twitter::{sanitize_for_logging, PublishGateway},
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Json,
};
use chrono::{Timelike, Utc};
use http_body_util::BodyExt;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;
use uuid::Uuid;

const REFRESH_CADENCE: Duration = Duration::from_secs(60);
const PUBLISH_CADENCE: Duration = Duration::from_secs(300);

/// Agent runtime fake: answers completions from a script, falling back to a
/// fixed reply, and records every prompt it receives.
struct MockRuntime {
    agent_id: Uuid,
    character: Character,
    scripted: Mutex<VecDeque<String>>,
    fallback: String,
    prompts: Mutex<Vec<CompletionRequest>>,
    rooms: Mutex<Vec<Uuid>>,
}

impl MockRuntime {
    fn new(fallback: &str) -> Self {
        Self {
            agent_id: Uuid::from_u128(7),
            character: Character {
                name: "Sage".to_string(),
                bio: vec!["Writes short essays.".to_string()],
                lore: vec!["Once walked the Camino.".to_string()],
                post_directions: vec!["Be brief.".to_string()],
                model: None,
            },
            scripted: Mutex::new(VecDeque::new()),
            fallback: fallback.to_string(),
            prompts: Mutex::new(Vec::new()),
            rooms: Mutex::new(Vec::new()),
        }
    }

    fn then_reply(self, text: &str) -> Self {
        self.scripted.lock().unwrap().push_back(text.to_string());
        self
    }

    fn prompts(&self) -> Vec<CompletionRequest> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    fn character(&self) -> &Character {
        &self.character
    }

    async fn ensure_room(&self, room_id: Uuid) -> Result<(), BoxError> {
        self.rooms.lock().unwrap().push(room_id);
        Ok(())
    }

    async fn compose_state(
        &self,
        _request: &StateRequest,
        extras: &HashMap<String, String>,
    ) -> Result<State, BoxError> {
        Ok(State::from_character(&self.character, extras))
    }

    async fn completion(&self, request: &CompletionRequest) -> Result<String, BoxError> {
        self.prompts.lock().unwrap().push(request.clone());
        let next = self.scripted.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Publisher fake that records posts and replies, and can be told to fail.
#[derive(Default)]
struct RecordingPublisher {
    posts: Mutex<Vec<String>>,
    replies: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingPublisher {
    fn failing() -> Self {
        let publisher = Self::default();
        publisher.fail.store(true, Ordering::SeqCst);
        publisher
    }

    fn posts(&self) -> Vec<String> {
        self.posts.lock().unwrap().clone()
    }

    fn replies(&self) -> Vec<(String, String)> {
        self.replies.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishGateway for RecordingPublisher {
    async fn publish(&self, text: &str) -> Result<(), SessionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::Publish("platform returned 503".to_string()));
        }
        self.posts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn reply(&self, text: &str, target_id: &str) -> Result<(), SessionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::Publish("platform returned 503".to_string()));
        }
        self.replies
            .lock()
            .unwrap()
            .push((text.to_string(), target_id.to_string()));
        Ok(())
    }
}

/// Refresher fake that answers every call with the same outcome, shaped the
/// way the token endpoint's answer is applied.
struct ScriptedRefresher {
    access_token: Option<String>,
    rotated_refresh_token: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedRefresher {
    fn granting(access_token: &str, rotated_refresh_token: Option<&str>) -> Self {
        Self {
            access_token: Some(access_token.to_string()),
            rotated_refresh_token: rotated_refresh_token.map(String::from),
            calls: AtomicUsize::new(0),
        }
    }

    fn rejecting() -> Self {
        Self {
            access_token: None,
            rotated_refresh_token: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialRefresher for ScriptedRefresher {
    async fn refresh(&self, current: &Credential) -> Result<Credential, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let access_token = self
            .access_token
            .clone()
            .ok_or_else(|| SessionError::Auth("token endpoint returned 401 Unauthorized".to_string()))?;
        Ok(Credential {
            access_token,
            refresh_token: self
                .rotated_refresh_token
                .clone()
                .unwrap_or_else(|| current.refresh_token.clone()),
            account_handle: current.account_handle.clone(),
        })
    }
}

/// Mention handler that only counts what it sees.
#[derive(Default)]
struct CountingHandler {
    seen: Mutex<Vec<(String, Option<String>)>>,
}

#[async_trait]
impl MentionHandler for CountingHandler {
    async fn handle(&self, event: &MentionEvent, state: &State) -> Result<(), SessionError> {
        self.seen.lock().unwrap().push((
            event.source_id.clone(),
            state.get("mentionAuthor").map(String::from),
        ));
        Ok(())
    }
}

fn test_credential() -> Credential {
    Credential::new("A1", "R1", "bot").unwrap()
}

fn test_config() -> SessionConfig {
    SessionConfig::new(test_credential())
        .unwrap()
        .with_cadences(REFRESH_CADENCE, PUBLISH_CADENCE)
}

struct Harness {
    runtime: Arc<MockRuntime>,
    publisher: Arc<RecordingPublisher>,
    refresher: Arc<ScriptedRefresher>,
    memory: Arc<InMemoryStore>,
}

impl Harness {
    fn new(runtime: MockRuntime, publisher: RecordingPublisher, refresher: ScriptedRefresher) -> Self {
        Self {
            runtime: Arc::new(runtime),
            publisher: Arc::new(publisher),
            refresher: Arc::new(refresher),
            memory: Arc::new(InMemoryStore::new()),
        }
    }

    async fn start(&self, config: SessionConfig) -> Result<TwitterSession, SessionError> {
        TwitterSession::builder(config, self.runtime.clone(), self.memory.clone())
            .publisher(self.publisher.clone())
            .refresher(self.refresher.clone())
            .start()
            .await
    }
}

fn mention(source_id: &str, in_reply_to: Option<&str>) -> MentionEvent {
    MentionEvent {
        source_id: source_id.to_string(),
        author_handle: "alice".to_string(),
        text: "@bot what keeps you going?".to_string(),
        in_reply_to: in_reply_to.map(String::from),
    }
}

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

const WEBHOOK_SECRET: &str = "hook-secret";

fn json_post(uri: &str, body: &'static str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(uri)
        .method("POST")
        .header("content-type", "application/json");
    if let Some(secret) = bearer {
        builder = builder.header("authorization", format!("Bearer {}", secret));
    }
    builder.body(Body::from(body)).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

/// Configuration loads from a complete set of variables with defaults filled in.
#[test]
fn test_config_from_lookup() {
    let config = SessionConfig::from_lookup(lookup_from(&[
        ("TWITTER_ACCESS_TOKEN", "access-token-value"),
        ("TWITTER_REFRESH_TOKEN", "refresh-token-value"),
        ("TWITTER_USERNAME", "bot"),
        ("TWITTER_CLIENT_ID", "client"),
        ("TWITTER_CLIENT_SECRET", "secret"),
        ("POST_INTERVAL_SECS", "900"),
        ("POST_ACTIVE_HOURS", "8-23"),
    ]))
    .unwrap();

    assert_eq!(config.credential.account_handle, "bot");
    assert_eq!(config.credential.refresh_token, "refresh-token-value");
    assert_eq!(config.client.unwrap().client_id, "client");
    assert_eq!(config.refresh_cadence, Duration::from_secs(3600));
    assert_eq!(config.publish_cadence, Duration::from_secs(900));
    assert_eq!(config.active_hours, Some(ActiveHours { start: 8, end: 23 }));
    assert_eq!(config.api_base.as_str(), "https://api.twitter.com/2");
}

/// Every required credential field is reported when missing or blank.
#[test]
fn test_config_missing_fields() {
    let full = [
        ("TWITTER_ACCESS_TOKEN", "A1"),
        ("TWITTER_REFRESH_TOKEN", "R1"),
        ("TWITTER_USERNAME", "bot"),
    ];
    for missing in ["TWITTER_ACCESS_TOKEN", "TWITTER_REFRESH_TOKEN", "TWITTER_USERNAME"] {
        let pairs: Vec<(&str, &str)> = full
            .iter()
            .map(|&(k, v)| if k == missing { (k, "  ") } else { (k, v) })
            .collect();
        match SessionConfig::from_lookup(lookup_from(&pairs)) {
            Err(SessionError::Config(message)) => assert!(message.contains(missing)),
            other => panic!("expected config error for {}, got {:?}", missing, other),
        }
    }
}

/// Missing client identity only warns; zero or malformed cadences are rejected.
#[test]
fn test_config_optional_values() {
    let base = [
        ("TWITTER_ACCESS_TOKEN", "A1"),
        ("TWITTER_REFRESH_TOKEN", "R1"),
        ("TWITTER_USERNAME", "bot"),
    ];
    let config = SessionConfig::from_lookup(lookup_from(&base)).unwrap();
    assert!(config.client.is_none());
    assert!(config.active_hours.is_none());

    let mut zero = base.to_vec();
    zero.push(("TOKEN_REFRESH_INTERVAL_SECS", "0"));
    assert!(matches!(
        SessionConfig::from_lookup(lookup_from(&zero)),
        Err(SessionError::Config(_))
    ));

    let mut garbled = base.to_vec();
    garbled.push(("POST_INTERVAL_SECS", "hourly"));
    assert!(matches!(
        SessionConfig::from_lookup(lookup_from(&garbled)),
        Err(SessionError::Config(_))
    ));
}

/// Credentials reject empty fields.
#[test]
fn test_credential_validation() {
    assert_ok!(Credential::new("A1", "R1", "bot"));
    assert_err!(Credential::new("", "R1", "bot"));
    assert_err!(Credential::new("A1", " ", "bot"));
    assert_err!(Credential::new("A1", "R1", ""));
}

/// Debug output of a credential never carries the raw tokens.
#[test]
fn test_credential_debug_is_masked() {
    let credential =
        Credential::new("access-token-0123456789", "refresh-token-0123456789", "bot").unwrap();
    let debug = format!("{:?}", credential);
    assert!(!debug.contains("access-token-0123456789"));
    assert!(!debug.contains("refresh-token-0123456789"));
    assert!(debug.contains("bot"));
}

/// Hour windows parse, bound-check and wrap around midnight.
#[test]
fn test_active_hours() {
    let day = ActiveHours::parse("8-23").unwrap();
    assert!(day.contains(8));
    assert!(day.contains(23));
    assert!(!day.contains(3));

    let night = ActiveHours::parse("22-6").unwrap();
    assert!(night.contains(23));
    assert!(night.contains(0));
    assert!(night.contains(6));
    assert!(!night.contains(12));

    assert_err!(ActiveHours::parse("8"));
    assert_err!(ActiveHours::parse("8-24"));
    assert_err!(ActiveHours::parse("a-b"));
}

#[test]
fn test_mask_token() {
    assert_eq!(mask_token("abcdefghijklmnopqrstuvwxyz"), "abcdefgh...stuvwxyz");
    assert_eq!(mask_token("short"), "short...");
    assert_eq!(mask_token(""), "...");
}

#[test]
fn test_sanitize_for_logging() {
    assert_eq!(sanitize_for_logging("line one\nline two", 100), "line one line two");
    let long = "x".repeat(50);
    let sanitized = sanitize_for_logging(&long, 10);
    assert!(sanitized.starts_with("xxxxxxxxxx"));
    assert!(sanitized.len() < long.len());
}

/// Unit test for the get_server_port function.
///
/// Verifies the default port (3000), a custom port and the fallback for an
/// unparseable value.
#[test]
fn test_get_server_port() {
    std::env::remove_var("PORT");
    assert_eq!(get_server_port(), 3000);

    std::env::set_var("PORT", "8080");
    assert_eq!(get_server_port(), 8080);

    std::env::set_var("PORT", "not-a-port");
    assert_eq!(get_server_port(), 3000);

    std::env::remove_var("PORT");
}

/// Outbound requests are always bounded: unset, zero and garbage values of
/// HTTP_TIMEOUT_SECS fall back to the default.
#[test]
fn test_get_http_timeout() {
    let default = Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS);

    std::env::remove_var("HTTP_TIMEOUT_SECS");
    assert_eq!(get_http_timeout(), default);

    std::env::set_var("HTTP_TIMEOUT_SECS", "5");
    assert_eq!(get_http_timeout(), Duration::from_secs(5));

    for raw in ["0", "-3", "soon"] {
        std::env::set_var("HTTP_TIMEOUT_SECS", raw);
        assert_eq!(get_http_timeout(), default, "{}", raw);
    }

    std::env::remove_var("HTTP_TIMEOUT_SECS");
}

/// Quotes, escaped newlines and a `Tweet:` label are stripped from completions.
#[test]
fn test_clean_generated_text() {
    assert_eq!(
        clean_generated_text("\"Growth rarely announces itself.\""),
        "Growth rarely announces itself."
    );
    assert_eq!(clean_generated_text("'single quoted'"), "single quoted");
    assert_eq!(clean_generated_text("Tweet: hello there"), "hello there");
    assert_eq!(clean_generated_text("TWEET: shouting"), "shouting");
    assert_eq!(clean_generated_text("first\\nsecond"), "first\nsecond");
    assert_eq!(clean_generated_text("  padded  "), "padded");
    assert_eq!(clean_generated_text("\"\""), "");
}

/// Long output is cut to the post limit and ends with an ellipsis.
#[test]
fn test_truncate_post() {
    let long = "a".repeat(300);
    let truncated = truncate_post(&long);
    assert_eq!(utf16_len(&truncated), MAX_POST_LENGTH);
    assert!(truncated.ends_with("..."));

    let exact = "b".repeat(MAX_POST_LENGTH);
    assert_eq!(truncate_post(&exact), exact);

    // Counted in UTF-16 units, not bytes: é is one unit.
    let wide = "é".repeat(MAX_POST_LENGTH);
    assert_eq!(truncate_post(&wide), wide);

    let cleaned = clean_generated_text(&format!("\"{}\"", "c".repeat(400)));
    assert!(utf16_len(&cleaned) <= MAX_POST_LENGTH);
    assert!(cleaned.ends_with("..."));
}

/// Characters outside the Basic Multilingual Plane count as two units each
/// and are never split.
#[test]
fn test_truncate_post_counts_utf16_units() {
    let emoji = format!("{}{}", "🚀".repeat(140), "a".repeat(150));
    let truncated = truncate_post(&emoji);
    assert!(utf16_len(&truncated) <= MAX_POST_LENGTH);
    assert!(truncated.ends_with("..."));
    assert_eq!(truncated, format!("{}...", "🚀".repeat(138)));

    let at_limit = "🚀".repeat(MAX_POST_LENGTH / 2);
    assert_eq!(truncate_post(&at_limit), at_limit);

    let over = "🚀".repeat(MAX_POST_LENGTH / 2 + 1);
    let cut = truncate_post(&over);
    assert!(utf16_len(&cut) <= MAX_POST_LENGTH);
    assert!(cut.ends_with("..."));

    let cleaned = clean_generated_text(&format!("Tweet: {}", "😀".repeat(200)));
    assert!(utf16_len(&cleaned) <= MAX_POST_LENGTH);
    assert!(cleaned.ends_with("..."));
}

#[test]
fn test_pick_topic_and_tone_from_vocabulary() {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..200 {
        let (topic, tone) = pick_topic_and_tone(&mut rng);
        assert!(TOPICS.contains(&topic));
        assert!(TONES.contains(&tone));
    }
}

/// Template keys are substituted from state; unknown keys render empty.
#[test]
fn test_compose_context() {
    let mut state = State::default();
    state.insert("agentName", "Sage");
    state.insert("topic", "resilience");

    let rendered = compose_context(&state, "{{agentName}} on {{topic}}{{missing}}.");
    assert_eq!(rendered, "Sage on resilience.");
}

#[test]
fn test_room_ids_are_stable() {
    assert_eq!(room_id(), room_id());

    let standalone = mention("100", None);
    let threaded = mention("101", Some("100"));
    assert_eq!(mention_room_id(&standalone), mention_room_id(&threaded));
    assert_ne!(mention_room_id(&standalone), room_id());
}

/// Tests the health endpoint handler function directly.
#[tokio::test]
async fn test_handle_health() {
    let Json(json_response): Json<Value> = handle_health().await;
    assert_eq!(json_response["status"], "healthy");
    assert_eq!(json_response["service"], "twitter-oauth-session");
}

/// Starting a session publishes one post immediately and records it as a memory.
#[tokio::test]
async fn test_start_publishes_immediately() {
    let harness = Harness::new(
        MockRuntime::new("\"Growth rarely announces itself.\""),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = harness.start(test_config()).await.unwrap();

    assert_eq!(harness.publisher.posts(), vec!["Growth rarely announces itself."]);

    let records = harness.memory.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].content.text, "Growth rarely announces itself.");
    assert_eq!(records[0].content.source, MEMORY_SOURCE);
    assert_eq!(records[0].room_id, room_id());
    assert_eq!(records[0].actor_id, harness.runtime.agent_id);
    assert_eq!(records[0].embedding.len(), EMBEDDING_DIMENSION);
    assert!(harness.runtime.rooms.lock().unwrap().contains(&room_id()));

    let prompts = harness.runtime.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].prompt.contains("@bot"));
    assert!(prompts[0].prompt.contains("Sage"));
    assert_eq!(prompts[0].model, "gpt-4-turbo");

    let status = session.status();
    assert!(status.running);
    assert_eq!(status.posts_published, 1);
    assert_eq!(status.publish.runs, 1);
    assert_eq!(status.publish.state, TaskState::Armed);
    assert_eq!(status.refresh.state, TaskState::Armed);

    session.shutdown().await;
}

/// An incomplete credential fails startup before any task runs.
#[tokio::test]
async fn test_start_rejects_incomplete_credential() {
    let harness = Harness::new(
        MockRuntime::new("never used"),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let mut config = test_config();
    config.credential.account_handle = String::new();

    let result = harness.start(config).await;
    assert!(matches!(result, Err(SessionError::Config(_))));
    assert!(harness.runtime.prompts().is_empty());
    assert_eq!(harness.publisher.attempts(), 0);
    assert_eq!(harness.refresher.calls(), 0);
}

/// Empty completion output skips publishing but startup still succeeds.
#[tokio::test]
async fn test_empty_generation_skips_publish() {
    let harness = Harness::new(
        MockRuntime::new("\"\""),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = harness.start(test_config()).await.unwrap();

    assert_eq!(harness.publisher.attempts(), 0);
    assert!(harness.memory.records().is_empty());
    assert_eq!(session.status().publish.runs, 1);
    assert!(matches!(
        session.post_generated().await,
        Err(SessionError::Generation(_))
    ));

    session.shutdown().await;
}

/// Publish ticks fire once per cadence after the immediate run.
#[tokio::test(start_paused = true)]
async fn test_publish_ticks_on_cadence() {
    let harness = Harness::new(
        MockRuntime::new("Steady work compounds.")
            .then_reply("First light.")
            .then_reply("Second wind."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = harness.start(test_config()).await.unwrap();
    assert_eq!(harness.publisher.posts(), vec!["First light."]);

    tokio::time::sleep(PUBLISH_CADENCE - Duration::from_secs(1)).await;
    assert_eq!(harness.publisher.posts().len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.publisher.posts(), vec!["First light.", "Second wind."]);

    tokio::time::sleep(PUBLISH_CADENCE).await;
    assert_eq!(harness.publisher.posts().len(), 3);
    assert_eq!(harness.memory.records().len(), 3);
    assert_eq!(session.status().publish.runs, 3);

    session.shutdown().await;
}

/// A refresh tick replaces the access token and keeps the refresh token
/// when the endpoint does not rotate it.
#[tokio::test(start_paused = true)]
async fn test_refresh_tick_keeps_unrotated_refresh_token() {
    let harness = Harness::new(
        MockRuntime::new("Quiet progress."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = harness.start(test_config()).await.unwrap();
    assert_eq!(session.credential().await.access_token, "A1");

    tokio::time::sleep(REFRESH_CADENCE + Duration::from_secs(1)).await;

    assert_eq!(harness.refresher.calls(), 1);
    assert_eq!(
        session.credential().await,
        Credential::new("A2", "R1", "bot").unwrap()
    );
    assert_eq!(session.status().refresh.runs, 1);

    session.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_tick_applies_rotated_refresh_token() {
    let harness = Harness::new(
        MockRuntime::new("Quiet progress."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", Some("R2")),
    );
    let session = harness.start(test_config()).await.unwrap();

    tokio::time::sleep(REFRESH_CADENCE + Duration::from_secs(1)).await;

    assert_eq!(
        session.credential().await,
        Credential::new("A2", "R2", "bot").unwrap()
    );

    session.shutdown().await;
}

/// A failed refresh leaves the credential alone, keeps the refresh timer
/// armed and does not disturb publishing.
#[tokio::test(start_paused = true)]
async fn test_refresh_failure_is_isolated() {
    let harness = Harness::new(
        MockRuntime::new("Keep going."),
        RecordingPublisher::default(),
        ScriptedRefresher::rejecting(),
    );
    let session = harness.start(test_config()).await.unwrap();

    tokio::time::sleep(PUBLISH_CADENCE + Duration::from_secs(1)).await;

    assert_eq!(harness.refresher.calls(), 5);
    assert_eq!(session.credential().await, test_credential());
    assert_eq!(harness.publisher.posts().len(), 2);

    let status = session.status();
    assert!(status.running);
    assert_eq!(status.refresh.state, TaskState::Armed);
    assert_eq!(status.refresh.runs, 5);

    assert!(matches!(
        session.refresh_now().await,
        Err(SessionError::Auth(_))
    ));
    assert_eq!(session.credential().await, test_credential());

    session.shutdown().await;
}

/// Scheduled publish failures are logged and the next tick still fires.
#[tokio::test(start_paused = true)]
async fn test_publish_failure_does_not_stop_schedule() {
    let harness = Harness::new(
        MockRuntime::new("Still here."),
        RecordingPublisher::failing(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = harness.start(test_config()).await.unwrap();
    assert_eq!(harness.publisher.attempts(), 1);

    tokio::time::sleep(PUBLISH_CADENCE * 2 + Duration::from_secs(1)).await;

    assert_eq!(harness.publisher.attempts(), 3);
    assert!(harness.memory.records().is_empty());
    assert_eq!(session.status().posts_published, 0);
    assert_eq!(session.status().publish.state, TaskState::Armed);

    session.shutdown().await;
}

/// Direct publish errors reach the caller unchanged.
#[tokio::test]
async fn test_direct_publish_error_propagates() {
    let harness = Harness::new(
        MockRuntime::new("Unused."),
        RecordingPublisher::failing(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = harness.start(test_config()).await.unwrap();

    assert!(matches!(
        session.publish("hello").await,
        Err(SessionError::Publish(_))
    ));
    assert!(matches!(
        session.reply("hello", "123").await,
        Err(SessionError::Publish(_))
    ));

    session.shutdown().await;
}

/// Direct generated posts ignore the posting window; scheduled ones honour it.
#[tokio::test]
async fn test_active_hours_only_gate_scheduled_posts() {
    let harness = Harness::new(
        MockRuntime::new("Off hours thought."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let excluded = (Utc::now().hour() + 12) % 24;
    let mut config = test_config();
    config.active_hours = Some(ActiveHours {
        start: excluded,
        end: excluded,
    });

    let session = harness.start(config).await.unwrap();
    assert!(harness.publisher.posts().is_empty());

    let post = session.post_generated().await.unwrap();
    assert_eq!(post.text, "Off hours thought.");
    assert!(TOPICS.contains(&post.topic.as_str()));
    assert_eq!(harness.publisher.posts(), vec!["Off hours thought."]);

    session.shutdown().await;
}

/// After shutdown neither timer fires again and both tasks report cancelled.
#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_ticks() {
    let harness = Harness::new(
        MockRuntime::new("Last word."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = harness.start(test_config()).await.unwrap();

    session.shutdown().await;
    session.shutdown().await;

    tokio::time::sleep(PUBLISH_CADENCE * 10).await;

    assert_eq!(harness.publisher.posts().len(), 1);
    assert_eq!(harness.refresher.calls(), 0);

    let status = session.status();
    assert!(!status.running);
    assert_eq!(status.refresh.state, TaskState::Cancelled);
    assert_eq!(status.publish.state, TaskState::Cancelled);
}

/// A panicking tick ends only that tick.
#[tokio::test(start_paused = true)]
async fn test_scheduled_task_survives_panicking_tick() {
    let task = ScheduledTask::new("flaky", Duration::from_secs(10));
    let counter = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::clone(&counter);

    task.start(move || {
        let ticks = Arc::clone(&ticks);
        async move {
            if ticks.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick blows up");
            }
            Ok(())
        }
    });
    assert_eq!(task.state(), TaskState::Armed);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(task.runs(), 3);
    assert!(task.last_run_at().is_some());

    task.cancel();
    task.join().await;
    assert_eq!(task.state(), TaskState::Cancelled);

    // A cancelled task never resumes.
    task.start(|| async { Ok(()) });
    assert_eq!(task.state(), TaskState::Cancelled);
}

/// Threaded mentions get a reply to the mention itself; standalone ones get
/// an original post. Both are recorded in the mention's room.
#[tokio::test]
async fn test_mention_reply_routing() {
    let harness = Harness::new(
        MockRuntime::new("Opening post.")
            .then_reply("Opening post.")
            .then_reply("Thanks for asking!")
            .then_reply("Curiosity, mostly."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = harness.start(test_config()).await.unwrap();
    assert_eq!(session.status().mention_handlers, 1);

    let threaded = mention("200", Some("150"));
    session.handle_mention(&threaded).await.unwrap();
    assert_eq!(
        harness.publisher.replies(),
        vec![("Thanks for asking!".to_string(), "200".to_string())]
    );

    let standalone = mention("300", None);
    session.handle_mention(&standalone).await.unwrap();
    assert_eq!(
        harness.publisher.posts(),
        vec!["Opening post.", "Curiosity, mostly."]
    );

    let records = harness.memory.records();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].room_id, mention_room_id(&threaded));
    assert_eq!(records[2].room_id, mention_room_id(&standalone));

    let prompts = harness.runtime.prompts();
    assert!(prompts[1].prompt.contains("@alice"));
    assert!(prompts[1].prompt.contains("what keeps you going?"));

    session.shutdown().await;
}

/// Custom handlers receive mentions delivered through a channel notifier.
#[tokio::test]
async fn test_mention_listener_dispatches_to_custom_handler() {
    let harness = Harness::new(
        MockRuntime::new("Hello."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = TwitterSession::builder(test_config(), harness.runtime.clone(), harness.memory.clone())
        .publisher(harness.publisher.clone())
        .refresher(harness.refresher.clone())
        .without_mention_replies()
        .start()
        .await
        .unwrap();

    let handler = Arc::new(CountingHandler::default());
    session.on_mention(handler.clone());
    assert_eq!(session.status().mention_handlers, 1);

    let (sender, notifier) = ChannelNotifier::channel(4);
    session.listen_for_mentions(Box::new(notifier));
    sender.send(mention("400", None)).await.unwrap();
    sender.send(mention("401", Some("400"))).await.unwrap();

    for _ in 0..100 {
        if handler.seen.lock().unwrap().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = handler.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("400".to_string(), Some("alice".to_string())),
            ("401".to_string(), Some("alice".to_string())),
        ]
    );
    assert!(harness.publisher.replies().is_empty());

    session.shutdown().await;
}

/// Memory store that always fails.
struct BrokenMemory;

#[async_trait]
impl MemoryStore for BrokenMemory {
    async fn create_memory(&self, _record: &MemoryRecord) -> Result<(), BoxError> {
        Err("disk full".into())
    }
}

/// A memory failure is reported but the post has already gone out.
#[tokio::test]
async fn test_memory_failure_after_publish() {
    let runtime = Arc::new(MockRuntime::new("Written in sand."));
    let publisher = Arc::new(RecordingPublisher::default());
    let session = TwitterSession::builder(test_config(), runtime, Arc::new(BrokenMemory))
        .publisher(publisher.clone())
        .refresher(Arc::new(ScriptedRefresher::granting("A2", None)))
        .start()
        .await
        .unwrap();

    assert_eq!(publisher.posts(), vec!["Written in sand."]);
    assert_eq!(session.status().posts_published, 1);
    assert!(matches!(
        session.post_generated().await,
        Err(SessionError::Memory(_))
    ));

    session.shutdown().await;
}

/// Integration test for the health endpoint (GET /health).
#[tokio::test]
async fn test_health_endpoint() {
    let app = create_router(AppState::default());

    let request = Request::builder()
        .uri("/health")
        .method("GET")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json_response = body_json(response).await;
    assert_eq!(json_response["status"], "healthy");
    assert_eq!(json_response["service"], "twitter-oauth-session");
}

/// Without a running session the session routes answer 503.
#[tokio::test]
async fn test_endpoints_without_session() {
    let state = AppState {
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        ..AppState::default()
    };
    let requests = [
        Request::builder().uri("/status").body(Body::empty()).unwrap(),
        json_post("/tweet", r#"{"text":"hi"}"#, Some(WEBHOOK_SECRET)),
        json_post(
            "/mentions",
            r#"{"source_id":"1","author_handle":"alice","text":"hi"}"#,
            Some(WEBHOOK_SECRET),
        ),
    ];
    for request in requests {
        let uri = request.uri().to_string();
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        assert_eq!(body_json(response).await["status"], "error");
    }
}

/// Routes that post as the account reject requests without the right bearer
/// secret, and reject everything when no secret is configured. Nothing is
/// published or queued for a rejected request.
#[tokio::test]
async fn test_posting_endpoints_require_webhook_secret() {
    let harness = Harness::new(
        MockRuntime::new("Boot post."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = Arc::new(harness.start(test_config()).await.unwrap());
    let (sender, mut notifier) = ChannelNotifier::channel(4);

    let unconfigured = AppState {
        session: Some(Arc::clone(&session)),
        mentions: Some(sender.clone()),
        webhook_secret: None,
    };
    let configured = AppState {
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        ..unconfigured.clone()
    };

    let mention_body = r#"{"source_id":"9","author_handle":"mallory","text":"@bot say this"}"#;
    let cases = [
        (unconfigured.clone(), json_post("/tweet", r#"{"text":"spam"}"#, Some(WEBHOOK_SECRET))),
        (unconfigured, json_post("/mentions", mention_body, Some(WEBHOOK_SECRET))),
        (configured.clone(), json_post("/tweet", r#"{"text":"spam"}"#, None)),
        (configured.clone(), json_post("/tweet", r#"{"text":"spam"}"#, Some("wrong-secret"))),
        (configured.clone(), json_post("/mentions", mention_body, None)),
        (configured.clone(), json_post("/mentions", mention_body, Some("hook-secre"))),
    ];
    for (state, request) in cases {
        let uri = request.uri().to_string();
        let response = create_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        assert_eq!(body_json(response).await["status"], "error");
    }

    assert_eq!(harness.publisher.posts(), vec!["Boot post."]);
    assert!(harness.publisher.replies().is_empty());

    // The health and status routes stay open.
    let response = create_router(configured)
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    drop(sender);
    session.shutdown().await;
    let leftover = tokio::time::timeout(Duration::from_millis(50), notifier.next_mention()).await;
    assert!(!matches!(leftover, Ok(Some(_))));
}

/// Integration test for /status, /tweet and /mentions with a running session.
#[tokio::test]
async fn test_endpoints_with_session() {
    let harness = Harness::new(
        MockRuntime::new("Boot post."),
        RecordingPublisher::default(),
        ScriptedRefresher::granting("A2", None),
    );
    let session = Arc::new(harness.start(test_config()).await.unwrap());
    let (sender, mut notifier) = ChannelNotifier::channel(1);
    let state = AppState {
        session: Some(Arc::clone(&session)),
        mentions: Some(sender),
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
    };

    let response = create_router(state.clone())
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await;
    assert_eq!(status["account_handle"], "bot");
    assert_eq!(status["publish"]["state"], "armed");
    assert_eq!(status["posts_published"], 1);

    let response = create_router(state.clone())
        .oneshot(json_post(
            "/tweet",
            r#"{"text":"Manual post","in_reply_to":"42"}"#,
            Some(WEBHOOK_SECRET),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        harness.publisher.replies(),
        vec![("Manual post".to_string(), "42".to_string())]
    );

    let response = create_router(state.clone())
        .oneshot(json_post("/tweet", r#"{"text":"   "}"#, Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mention_body = r#"{"source_id":"500","author_handle":"alice","text":"@bot hi"}"#;
    let response = create_router(state.clone())
        .oneshot(json_post("/mentions", mention_body, Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // Capacity one and nobody draining: the second mention is refused.
    let response = create_router(state.clone())
        .oneshot(json_post("/mentions", mention_body, Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let queued = notifier.next_mention().await.unwrap();
    assert_eq!(queued.source_id, "500");
    assert_eq!(queued.in_reply_to, None);

    harness.publisher.fail.store(true, Ordering::SeqCst);
    let response = create_router(state)
        .oneshot(json_post("/tweet", r#"{"text":"Will fail"}"#, Some(WEBHOOK_SECRET)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    session.shutdown().await;
}

/// A zero cadence is a configuration error: startup fails before anything
/// runs instead of returning a session with a dead timer.
#[tokio::test]
async fn test_start_rejects_zero_cadence() {
    for (refresh, publish) in [
        (Duration::ZERO, PUBLISH_CADENCE),
        (REFRESH_CADENCE, Duration::ZERO),
    ] {
        let harness = Harness::new(
            MockRuntime::new("never used"),
            RecordingPublisher::default(),
            ScriptedRefresher::granting("A2", None),
        );
        let config = SessionConfig::new(test_credential())
            .unwrap()
            .with_cadences(refresh, publish);

        match harness.start(config).await {
            Err(SessionError::Config(message)) => assert!(message.contains("cadence")),
            Err(other) => panic!("expected config error, got {}", other),
            Ok(_) => panic!("session started with a zero cadence"),
        }
        assert!(harness.runtime.prompts().is_empty());
        assert_eq!(harness.publisher.attempts(), 0);
        assert_eq!(harness.refresher.calls(), 0);
    }
}

/// A task with a zero cadence is never armed and never runs its body.
#[tokio::test(start_paused = true)]
async fn test_scheduled_task_refuses_zero_cadence() {
    let runs = Arc::new(AtomicUsize::new(0));

    let task = ScheduledTask::new("zero", Duration::ZERO);
    let counter = Arc::clone(&runs);
    task.start(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    assert_eq!(task.state(), TaskState::Idle);

    let counter = Arc::clone(&runs);
    task.start_after_initial_run(move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .await;
    assert_eq!(task.state(), TaskState::Idle);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(task.runs(), 0);
}

/// Refresher that rotates the refresh token on every call and takes a while
/// to answer, recording how many calls overlap.
#[derive(Default)]
struct RotatingRefresher {
    seen: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

#[async_trait]
impl CredentialRefresher for RotatingRefresher {
    async fn refresh(&self, current: &Credential) -> Result<Credential, SessionError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let n = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(current.refresh_token.clone());
            seen.len()
        };
        tokio::time::sleep(Duration::from_secs(5)).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(Credential {
            access_token: format!("A{}", n + 1),
            refresh_token: format!("R{}", n + 1),
            account_handle: current.account_handle.clone(),
        })
    }
}

/// Manual and scheduled refreshes never overlap, and each one starts from the
/// refresh token the previous one stored.
#[tokio::test(start_paused = true)]
async fn test_refreshes_are_serialized() {
    let refresher = Arc::new(RotatingRefresher::default());
    let session = TwitterSession::builder(
        test_config(),
        Arc::new(MockRuntime::new("Hello.")),
        Arc::new(InMemoryStore::new()),
    )
    .publisher(Arc::new(RecordingPublisher::default()))
    .refresher(refresher.clone())
    .start()
    .await
    .unwrap();

    // The scheduled tick starts at 60s and is still in flight at 62s.
    tokio::time::sleep(REFRESH_CADENCE + Duration::from_secs(2)).await;
    let (first, second) = tokio::join!(session.refresh_now(), session.refresh_now());
    assert_ok!(first);
    assert_ok!(second);

    assert_eq!(refresher.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(*refresher.seen.lock().unwrap(), vec!["R1", "R2", "R3"]);
    assert_eq!(
        session.credential().await,
        Credential::new("A4", "R4", "bot").unwrap()
    );

    session.shutdown().await;
}
