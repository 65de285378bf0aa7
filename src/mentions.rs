//! Inbound mention handling.
//!
//! Mentions arrive from a [`MentionNotifier`] (the delivery mechanism is up to
//! the caller: webhook, polling, tests), get a state snapshot from the agent
//! runtime, and are dispatched to every registered [`MentionHandler`].
//! Events are handled once and in arrival order; nothing is queued or
//! deduplicated here.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::SessionError;
use crate::generator::ContentGenerator;
use crate::runtime::{stable_uuid, AgentRuntime, MemoryRecord, MemoryStore, MessageContent, State, StateRequest};
use crate::twitter::{sanitize_for_logging, PublishGateway};

/// A post that mentioned the session's account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionEvent {
    pub source_id: String,
    pub author_handle: String,
    pub text: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

/// Room a mention's conversation is recorded in.
///
/// Replies share the room of the post they answer; a standalone mention opens
/// its own room.
pub fn mention_room_id(event: &MentionEvent) -> Uuid {
    let anchor = event.in_reply_to.as_deref().unwrap_or(&event.source_id);
    stable_uuid(&format!("twitter_mention_{}", anchor))
}

/// Source of mention events.
#[async_trait]
pub trait MentionNotifier: Send {
    /// Waits for the next mention. `None` means the source is exhausted.
    async fn next_mention(&mut self) -> Option<MentionEvent>;
}

/// Sending half paired with a [`ChannelNotifier`].
pub type MentionSender = mpsc::Sender<MentionEvent>;

/// Notifier fed through an in-process channel (webhook handlers, tests).
pub struct ChannelNotifier {
    rx: mpsc::Receiver<MentionEvent>,
}

impl ChannelNotifier {
    /// Creates a bounded notifier and the sender that feeds it.
    pub fn channel(capacity: usize) -> (MentionSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl MentionNotifier for ChannelNotifier {
    async fn next_mention(&mut self) -> Option<MentionEvent> {
        self.rx.recv().await
    }
}

/// Reacts to one mention.
#[async_trait]
pub trait MentionHandler: Send + Sync {
    async fn handle(&self, event: &MentionEvent, state: &State) -> Result<(), SessionError>;
}

/// Dispatches mentions to the registered handlers.
pub struct MentionRouter {
    runtime: Arc<dyn AgentRuntime>,
    handle: String,
    handlers: RwLock<Vec<Arc<dyn MentionHandler>>>,
}

impl MentionRouter {
    pub fn new(runtime: Arc<dyn AgentRuntime>, handle: impl Into<String>) -> Self {
        Self {
            runtime,
            handle: handle.into(),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a handler for every subsequent mention.
    pub fn register(&self, handler: Arc<dyn MentionHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Composes the runtime state a mention is handled with.
    pub async fn compose_state(&self, event: &MentionEvent) -> Result<State, SessionError> {
        let request = StateRequest {
            actor_id: stable_uuid(&event.author_handle),
            room_id: mention_room_id(event),
            content: MessageContent {
                text: event.text.clone(),
                action: String::new(),
            },
        };
        let mut extras = HashMap::new();
        extras.insert("twitterUserName".to_string(), self.handle.clone());
        extras.insert("mentionAuthor".to_string(), event.author_handle.clone());

        self.runtime
            .compose_state(&request, &extras)
            .await
            .map_err(|e| SessionError::Generation(format!("failed to compose mention state: {}", e)))
    }

    /// Invokes every registered handler with `event` and `state`.
    ///
    /// All handlers run even if one fails; the first failure is returned.
    pub async fn route(&self, event: &MentionEvent, state: &State) -> Result<(), SessionError> {
        let handlers: Vec<Arc<dyn MentionHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        if handlers.is_empty() {
            warn!("Mention {} received but no handler is registered", event.source_id);
            return Ok(());
        }

        let mut first_error = None;
        for handler in handlers {
            if let Err(e) = handler.handle(event, state).await {
                error!("Mention handler failed for {}: {}", event.source_id, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Composes state for `event` and routes it.
    pub async fn dispatch(&self, event: &MentionEvent) -> Result<(), SessionError> {
        info!(
            "Handling mention {} from @{}: {}",
            event.source_id,
            event.author_handle,
            sanitize_for_logging(&event.text, 120)
        );
        let state = self.compose_state(event).await?;
        self.route(event, &state).await
    }

    /// Consumes `notifier` until it is exhausted or `shutdown` flips to true.
    pub fn listen(
        self: Arc<Self>,
        mut notifier: Box<dyn MentionNotifier>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Mention listener started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let event = tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    event = notifier.next_mention() => event,
                };

                let Some(event) = event else {
                    info!("Mention notifier exhausted");
                    break;
                };

                if let Err(e) = self.dispatch(&event).await {
                    error!("Failed to handle mention {} ({}): {}", event.source_id, e.kind(), e);
                }
            }
            debug!("Mention listener stopped");
        })
    }
}

/// Reference handler: generate a reply and post it.
///
/// Mentions that are themselves replies get a threaded reply to the
/// mention's own id; other mentions are answered with an original post. The
/// response is then recorded as a memory.
pub struct ReplyHandler {
    generator: ContentGenerator,
    publisher: Arc<dyn PublishGateway>,
    memory: Arc<dyn MemoryStore>,
}

impl ReplyHandler {
    pub fn new(
        generator: ContentGenerator,
        publisher: Arc<dyn PublishGateway>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            generator,
            publisher,
            memory,
        }
    }
}

#[async_trait]
impl MentionHandler for ReplyHandler {
    async fn handle(&self, event: &MentionEvent, state: &State) -> Result<(), SessionError> {
        let text = self.generator.generate_reply(event, state).await?;

        if event.in_reply_to.is_some() {
            self.publisher.reply(&text, &event.source_id).await?;
        } else {
            self.publisher.publish(&text).await?;
        }

        let record = MemoryRecord::posted(
            self.generator.runtime().agent_id(),
            mention_room_id(event),
            &text,
            Utc::now(),
        );
        self.memory
            .create_memory(&record)
            .await
            .map_err(|e| SessionError::Memory(e.to_string()))?;

        info!("Responded to mention {}", event.source_id);
        Ok(())
    }
}
