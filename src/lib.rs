//! # twitter-oauth-session
//!
//! A long-lived Twitter/X client for an autonomous agent. One session owns a
//! single OAuth 2.0 credential and runs three independent concerns against it:
//!
//! - **Token refresh**: exchanges the refresh token on a fixed cadence and
//!   overwrites the shared credential.
//! - **Scheduled posts**: generates a post through the agent runtime, publishes
//!   it and records it as a memory, once at startup and then on a fixed cadence.
//! - **Mentions**: routes inbound mention events from a pluggable notifier to
//!   registered handlers.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twitter_oauth_session::{InMemoryStore, OpenAiRuntime, SessionConfig, TwitterSession};
//!
//! # async fn run() -> Result<(), twitter_oauth_session::SessionError> {
//! let config = SessionConfig::from_env()?;
//! let runtime = Arc::new(OpenAiRuntime::from_env(reqwest::Client::new(), "bot")?);
//! let session = TwitterSession::builder(config, runtime, Arc::new(InMemoryStore::new()))
//!     .start()
//!     .await?;
//!
//! println!("{:?}", session.status());
//! session.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod completion;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod generator;
pub mod handlers;
pub mod mentions;
pub mod oauth;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod twitter;

// Re-export commonly used types and functions
pub use completion::OpenAiRuntime;
pub use config::{ActiveHours, SessionConfig};
pub use credentials::{
    ClientIdentity, Credential, CredentialRefresher, CredentialStore, HttpCredentialRefresher,
    TokenVault,
};
pub use error::{BoxError, SessionError};
pub use generator::{ContentGenerator, GeneratedPost};
pub use mentions::{
    ChannelNotifier, MentionEvent, MentionHandler, MentionNotifier, MentionRouter, ReplyHandler,
};
pub use oauth::build_oauth2_user_context_header;
pub use runtime::{AgentRuntime, Character, InMemoryStore, MemoryRecord, MemoryStore, State};
pub use scheduler::{ScheduledTask, TaskState};
pub use session::{SessionBuilder, SessionStatus, TwitterSession};
pub use twitter::{PublishGateway, XPublisher};

#[cfg(test)]
mod tests;
