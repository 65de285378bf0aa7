//! The Twitter OAuth session: one credential, two timers, one mention router.
//!
//! [`SessionBuilder::start`] validates the configuration, arms the refresh
//! task, runs one publish cycle immediately and then arms the publish task.
//! It either returns a running [`TwitterSession`] or an error; there is no
//! half-started session.
//!
//! The refresh and publish tasks are independent. A publish call reads the
//! access token just before sending, so a refresh that completes before that
//! read is used, while one that completes during the request is only seen by
//! the next call.

use chrono::{Timelike, Utc};
use log::{error, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::config::{
    build_http_client, mask_token, ActiveHours, SessionConfig, DEFAULT_HTTP_TIMEOUT_SECS,
};
use crate::credentials::{Credential, CredentialRefresher, CredentialStore, HttpCredentialRefresher, TokenVault};
use crate::error::SessionError;
use crate::generator::{room_id, ContentGenerator, GeneratedPost};
use crate::mentions::{MentionEvent, MentionHandler, MentionNotifier, MentionRouter, ReplyHandler};
use crate::runtime::{AgentRuntime, MemoryRecord, MemoryStore};
use crate::scheduler::{ScheduledTask, TaskSnapshot};
use crate::twitter::{PublishGateway, XPublisher};

/// Serializable view of a running session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub account_handle: String,
    pub running: bool,
    pub posts_published: u64,
    pub mention_handlers: usize,
    pub refresh: TaskSnapshot,
    pub publish: TaskSnapshot,
}

/// Everything one publish cycle needs, cheap to clone into a task body.
#[derive(Clone)]
struct PublishCycle {
    generator: ContentGenerator,
    publisher: Arc<dyn PublishGateway>,
    memory: Arc<dyn MemoryStore>,
    active_hours: Option<ActiveHours>,
    posts_published: Arc<AtomicU64>,
}

impl PublishCycle {
    /// Generates, publishes and records one post.
    ///
    /// Scheduled runs honour the posting window and return `Ok(None)` when
    /// outside it.
    async fn run(&self, scheduled: bool) -> Result<Option<GeneratedPost>, SessionError> {
        if scheduled {
            if let Some(hours) = self.active_hours {
                let hour = Utc::now().hour();
                if !hours.contains(hour) {
                    info!("Outside of posting hours ({}:00 UTC), skipping post", hour);
                    return Ok(None);
                }
            }
        }

        let post = self.generator.generate().await?;

        info!("Publishing generated post: {}", post.text);
        self.publisher.publish(&post.text).await?;
        self.posts_published.fetch_add(1, Ordering::SeqCst);
        info!("Post published successfully");

        let record = MemoryRecord::posted(
            self.generator.runtime().agent_id(),
            room_id(),
            &post.text,
            post.created_at,
        );
        self.memory
            .create_memory(&record)
            .await
            .map_err(|e| SessionError::Memory(format!("failed to save post memory: {}", e)))?;

        Ok(Some(post))
    }
}

/// Everything one refresh cycle needs.
///
/// Clones share `in_flight`, so scheduled and manual refreshes run one at a
/// time and each starts from the credential the previous one wrote.
#[derive(Clone)]
struct RefreshCycle {
    store: CredentialStore,
    refresher: Arc<dyn CredentialRefresher>,
    vault: Option<Arc<dyn TokenVault>>,
    in_flight: Arc<AsyncMutex<()>>,
}

impl RefreshCycle {
    /// Refreshes the credential in place. On error the stored credential is
    /// untouched.
    async fn run(&self) -> Result<(), SessionError> {
        let _serial = self.in_flight.lock().await;
        let current = self.store.snapshot().await;
        let next = self.refresher.refresh(&current).await?;
        let rotated = next.refresh_token != current.refresh_token;

        self.store.replace(next.clone()).await;
        info!(
            "Access token refreshed for @{} (new token: {})",
            next.account_handle,
            mask_token(&next.access_token)
        );

        if rotated {
            if let Some(vault) = &self.vault {
                match vault.save_refresh_token(&next.refresh_token).await {
                    Ok(()) => info!("Rotated refresh token saved"),
                    Err(e) => {
                        warn!("Failed to save rotated refresh token: {}", e);
                        warn!("Refresh token updated in memory only");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Assembles a [`TwitterSession`] from configuration and collaborators.
pub struct SessionBuilder {
    config: SessionConfig,
    runtime: Arc<dyn AgentRuntime>,
    memory: Arc<dyn MemoryStore>,
    http: Client,
    publisher: Option<Arc<dyn PublishGateway>>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    vault: Option<Arc<dyn TokenVault>>,
    reply_to_mentions: bool,
}

impl SessionBuilder {
    pub fn new(
        config: SessionConfig,
        runtime: Arc<dyn AgentRuntime>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            config,
            runtime,
            memory,
            http: build_http_client(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
                .unwrap_or_default(),
            publisher: None,
            refresher: None,
            vault: None,
            reply_to_mentions: true,
        }
    }

    /// HTTP client shared by the default publisher and refresher.
    pub fn http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Replaces the default Twitter API publisher.
    pub fn publisher(mut self, publisher: Arc<dyn PublishGateway>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replaces the default token-endpoint refresher.
    pub fn refresher(mut self, refresher: Arc<dyn CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Persists rotated refresh tokens to `vault`.
    pub fn token_vault(mut self, vault: Arc<dyn TokenVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Leaves the mention router without the reference reply handler.
    pub fn without_mention_replies(mut self) -> Self {
        self.reply_to_mentions = false;
        self
    }

    /// Validates the configuration and starts the session.
    ///
    /// The first publish cycle runs before this returns; its failure is
    /// logged and does not fail startup.
    ///
    /// # Errors
    ///
    /// [`SessionError::Config`] when the credential is incomplete, a cadence
    /// is zero or the endpoints are unusable. No task is started in that case.
    pub async fn start(self) -> Result<TwitterSession, SessionError> {
        info!("Starting Twitter OAuth session initialization");

        if let Err(e) = self.config.credential.validate() {
            error!("Failed to initialize Twitter session: {}", e);
            return Err(e);
        }

        for (task, cadence) in [
            ("refresh", self.config.refresh_cadence),
            ("publish", self.config.publish_cadence),
        ] {
            if cadence.is_zero() {
                let e = SessionError::Config(format!("{} cadence must be greater than zero", task));
                error!("Failed to initialize Twitter session: {}", e);
                return Err(e);
            }
        }

        let credential = self.config.credential.clone();
        let handle = credential.account_handle.clone();
        info!(
            "Config validation passed for @{} (access token length {}, refresh token length {})",
            handle,
            credential.access_token.len(),
            credential.refresh_token.len()
        );

        let store = CredentialStore::new(credential);

        let publisher: Arc<dyn PublishGateway> = match self.publisher {
            Some(publisher) => publisher,
            None => Arc::new(XPublisher::new(
                self.http.clone(),
                &self.config.api_base,
                store.clone(),
            )?),
        };
        let refresher: Arc<dyn CredentialRefresher> = match self.refresher {
            Some(refresher) => refresher,
            None => Arc::new(HttpCredentialRefresher::new(
                self.http.clone(),
                self.config.token_url.clone(),
                self.config.client.clone(),
            )),
        };

        let generator = ContentGenerator::new(Arc::clone(&self.runtime), handle.clone());
        let router = Arc::new(MentionRouter::new(Arc::clone(&self.runtime), handle.clone()));
        if self.reply_to_mentions {
            router.register(Arc::new(ReplyHandler::new(
                generator.clone(),
                Arc::clone(&publisher),
                Arc::clone(&self.memory),
            )));
        }

        let posts_published = Arc::new(AtomicU64::new(0));
        let publish_cycle = PublishCycle {
            generator: generator.clone(),
            publisher: Arc::clone(&publisher),
            memory: Arc::clone(&self.memory),
            active_hours: self.config.active_hours,
            posts_published: Arc::clone(&posts_published),
        };
        let refresh_cycle = RefreshCycle {
            store: store.clone(),
            refresher,
            vault: self.vault,
            in_flight: Arc::new(AsyncMutex::new(())),
        };

        let refresh_task = ScheduledTask::new("token_refresh", self.config.refresh_cadence);
        let publish_task = ScheduledTask::new("publish", self.config.publish_cadence);

        info!("Setting up token refresh");
        let tick_cycle = refresh_cycle.clone();
        refresh_task.start(move || {
            let cycle = tick_cycle.clone();
            async move { cycle.run().await }
        });

        info!("Setting up scheduled posts");
        publish_task
            .start_after_initial_run(move || {
                let cycle = publish_cycle.clone();
                async move { cycle.run(true).await.map(|_| ()) }
            })
            .await;

        let (shutdown_tx, _) = watch::channel(false);

        info!("Twitter OAuth session for @{} is running", handle);
        Ok(TwitterSession {
            handle,
            credentials: store,
            generator,
            publisher,
            memory: self.memory,
            router,
            refresh_cycle,
            refresh_task,
            publish_task,
            posts_published,
            shutdown_tx,
            listeners: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }
}

/// A running session. Dropping it cancels both timers.
pub struct TwitterSession {
    handle: String,
    credentials: CredentialStore,
    generator: ContentGenerator,
    publisher: Arc<dyn PublishGateway>,
    memory: Arc<dyn MemoryStore>,
    router: Arc<MentionRouter>,
    refresh_cycle: RefreshCycle,
    refresh_task: ScheduledTask,
    publish_task: ScheduledTask,
    posts_published: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TwitterSession {
    /// Shorthand for [`SessionBuilder::new`].
    pub fn builder(
        config: SessionConfig,
        runtime: Arc<dyn AgentRuntime>,
        memory: Arc<dyn MemoryStore>,
    ) -> SessionBuilder {
        SessionBuilder::new(config, runtime, memory)
    }

    pub fn account_handle(&self) -> &str {
        &self.handle
    }

    /// Current credential snapshot.
    pub async fn credential(&self) -> Credential {
        self.credentials.snapshot().await
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Posts `text` now. Failures are logged and returned to the caller.
    pub async fn publish(&self, text: &str) -> Result<(), SessionError> {
        self.publisher.publish(text).await.map_err(|e| {
            error!("Error posting tweet: {}", e);
            e
        })
    }

    /// Replies to `target_id` now. Failures are logged and returned to the caller.
    pub async fn reply(&self, text: &str, target_id: &str) -> Result<(), SessionError> {
        self.publisher.reply(text, target_id).await.map_err(|e| {
            error!("Error posting reply: {}", e);
            e
        })
    }

    /// Refreshes the credential now, outside the schedule. Waits for a
    /// scheduled refresh already in progress. On error the credential is
    /// unchanged and the error is returned.
    pub async fn refresh_now(&self) -> Result<(), SessionError> {
        self.refresh_cycle.run().await.map_err(|e| {
            error!("Error refreshing Twitter token: {}", e);
            e
        })
    }

    /// Runs one full publish cycle outside the schedule, ignoring the posting window.
    pub async fn post_generated(&self) -> Result<GeneratedPost, SessionError> {
        let cycle = PublishCycle {
            generator: self.generator.clone(),
            publisher: Arc::clone(&self.publisher),
            memory: Arc::clone(&self.memory),
            active_hours: None,
            posts_published: Arc::clone(&self.posts_published),
        };
        cycle.run(false).await?.ok_or_else(|| {
            SessionError::Generation("publish cycle produced no post".to_string())
        })
    }

    /// Registers an additional mention handler.
    pub fn on_mention(&self, handler: Arc<dyn MentionHandler>) {
        self.router.register(handler);
    }

    /// Handles one mention directly, bypassing any notifier.
    pub async fn handle_mention(&self, event: &MentionEvent) -> Result<(), SessionError> {
        self.router.dispatch(event).await
    }

    /// Starts consuming mentions from `notifier` until shutdown.
    pub fn listen_for_mentions(&self, notifier: Box<dyn MentionNotifier>) {
        if !self.is_running() {
            warn!("Session is shut down, ignoring mention notifier");
            return;
        }
        let handle = Arc::clone(&self.router).listen(notifier, self.shutdown_tx.subscribe());
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            account_handle: self.handle.clone(),
            running: self.is_running(),
            posts_published: self.posts_published.load(Ordering::SeqCst),
            mention_handlers: self.router.handler_count(),
            refresh: self.refresh_task.snapshot(),
            publish: self.publish_task.snapshot(),
        }
    }

    /// Cancels both timers and the mention listeners, then waits for their
    /// loops to exit. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down Twitter OAuth session for @{}", self.handle);

        self.refresh_task.cancel();
        self.publish_task.cancel();
        self.shutdown_tx.send_replace(true);

        self.refresh_task.join().await;
        self.publish_task.join().await;

        let listeners: Vec<JoinHandle<()>> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for listener in listeners {
            if let Err(e) = listener.await {
                error!("Mention listener ended abnormally: {}", e);
            }
        }
        info!("Twitter OAuth session stopped");
    }
}

impl Drop for TwitterSession {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
