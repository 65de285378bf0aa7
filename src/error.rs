//! Error taxonomy for the Twitter OAuth session.
//!
//! Each variant maps to one failure class and one handling rule:
//!
//! - [`SessionError::Config`]: a required credential field is missing; the
//!   session is never constructed.
//! - [`SessionError::Auth`]: a token refresh failed; logged, retried on the
//!   next refresh tick, credential unchanged.
//! - [`SessionError::Generation`]: the completion service produced nothing
//!   usable; the publish cycle is skipped.
//! - [`SessionError::Publish`]: the platform rejected a post or the transport
//!   failed; propagated to direct callers, logged by scheduled ticks.
//! - [`SessionError::Memory`]: the memory store rejected a record; logged only.

/// Boxed error used at collaborator boundaries (HTTP helpers, runtime, stores).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error type for the session and its components.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Missing or invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Token exchange failure (non-success response, malformed body, network).
    #[error("auth error: {0}")]
    Auth(String),

    /// Completion output was empty or unusable.
    #[error("generation error: {0}")]
    Generation(String),

    /// Post or reply could not be delivered.
    #[error("publish error: {0}")]
    Publish(String),

    /// Memory record could not be persisted.
    #[error("memory error: {0}")]
    Memory(String),
}

impl SessionError {
    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Auth(_) => "auth",
            Self::Generation(_) => "generation",
            Self::Publish(_) => "publish",
            Self::Memory(_) => "memory",
        }
    }
}
