//! HTTP route handlers for the session's status and webhook server.
//!
//! The server is a thin operational surface: health, session status, a direct
//! post endpoint and a webhook that feeds mentions into the session.
//!
//! `POST /tweet` and `POST /mentions` act as the account, so they require
//! `Authorization: Bearer <WEBHOOK_SECRET>`. Without a configured secret both
//! answer `401`.

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;

use crate::mentions::{MentionEvent, MentionSender};
use crate::session::{SessionStatus, TwitterSession};

/// Shared state for the HTTP handlers.
///
/// `session` is `None` when the session failed to start; the server keeps
/// running so health checks still answer. `webhook_secret` guards the routes
/// that post as the account.
#[derive(Clone, Default)]
pub struct AppState {
    pub session: Option<Arc<TwitterSession>>,
    pub mentions: Option<MentionSender>,
    pub webhook_secret: Option<String>,
}

type HandlerError = (StatusCode, Json<Value>);

fn not_running() -> HandlerError {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"status": "error", "message": "Twitter session is not running"})),
    )
}

fn unauthorized(message: &str) -> HandlerError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"status": "error", "message": message})),
    )
}

/// Compares digests so the comparison time does not depend on where the
/// inputs first differ.
fn secrets_match(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Checks the bearer secret on a request that acts as the account.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), HandlerError> {
    let Some(expected) = state.webhook_secret.as_deref() else {
        warn!("Rejecting request: WEBHOOK_SECRET is not configured");
        return Err(unauthorized("webhook secret is not configured"));
    };

    let given = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match given {
        Some(given) if secrets_match(given, expected) => Ok(()),
        _ => {
            warn!("Rejecting request with missing or invalid webhook secret");
            Err(unauthorized("missing or invalid bearer token"))
        }
    }
}

/// Builds the router with every route of the service.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/status", get(handle_status))
        .route("/tweet", post(handle_tweet))
        .route("/mentions", post(handle_mention))
        .with_state(state)
}

/// Handles GET requests to the `/health` endpoint.
///
/// Always answers while the process is up, whether or not the session started.
pub async fn handle_health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": "twitter-oauth-session"}))
}

/// Handles GET requests to the `/status` endpoint with the session's task states.
pub async fn handle_status(
    State(state): State<AppState>,
) -> Result<Json<SessionStatus>, HandlerError> {
    match &state.session {
        Some(session) => Ok(Json(session.status())),
        None => Err(not_running()),
    }
}

/// Body of a `POST /tweet` request.
#[derive(Debug, Deserialize)]
pub struct TweetRequest {
    pub text: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

/// Handles POST requests to the `/tweet` endpoint.
///
/// Posts the given text (or replies, when `in_reply_to` is set) through the
/// running session. Requires the webhook secret. Publish failures are
/// returned as `502 Bad Gateway`.
pub async fn handle_tweet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TweetRequest>,
) -> Result<Json<Value>, HandlerError> {
    authorize(&state, &headers)?;
    let session = state.session.as_ref().ok_or_else(not_running)?;

    if request.text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": "text must not be empty"})),
        ));
    }

    let result = match &request.in_reply_to {
        Some(target) => session.reply(&request.text, target).await,
        None => session.publish(&request.text).await,
    };

    match result {
        Ok(()) => {
            info!("Tweet posted through HTTP endpoint");
            Ok(Json(json!({"status": "success", "message": "Tweet posted"})))
        }
        Err(e) => {
            error!("Failed to post tweet: {}", e);
            Err((
                StatusCode::BAD_GATEWAY,
                Json(json!({"status": "error", "message": "Failed to post tweet", "error": e.to_string()})),
            ))
        }
    }
}

/// Handles POST requests to the `/mentions` webhook.
///
/// Queues the mention for the session's listener and answers `202 Accepted`.
/// A full queue answers `429`.
pub async fn handle_mention(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<MentionEvent>,
) -> Result<(StatusCode, Json<Value>), HandlerError> {
    authorize(&state, &headers)?;
    let sender = state.mentions.as_ref().ok_or_else(not_running)?;

    match sender.try_send(event) {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(json!({"status": "queued"})))),
        Err(TrySendError::Full(event)) => {
            warn!("Mention queue full, rejecting {}", event.source_id);
            Err((
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"status": "error", "message": "mention queue is full"})),
            ))
        }
        Err(TrySendError::Closed(_)) => Err(not_running()),
    }
}
