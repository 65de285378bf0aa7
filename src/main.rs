//! # twitter-oauth-session
//!
//! Runs one Twitter/X session for an agent: token refresh on a fixed cadence,
//! a generated post at startup and on every publish tick, and replies to
//! mentions posted to the `/mentions` webhook.
//!
//! ## Environment Variables
//!
//! - `TWITTER_ACCESS_TOKEN`, `TWITTER_REFRESH_TOKEN`, `TWITTER_USERNAME` (required)
//! - `TWITTER_CLIENT_ID`, `TWITTER_CLIENT_SECRET` (token refresh)
//! - `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `AGENT_*` (generation)
//! - `DATABASE_URL`, `TOKEN_ENCRYPTION_KEY` (optional persistence)
//! - `WEBHOOK_SECRET` (bearer secret for `POST /tweet` and `POST /mentions`)
//! - `HTTP_TIMEOUT_SECS` (outbound request timeout, defaults to 30)
//! - `PORT` (defaults to 3000), `RUST_LOG`
//!
//! ## API Endpoints
//!
//! - `GET /health`: service health
//! - `GET /status`: session task states
//! - `POST /tweet`: post through the session
//! - `POST /mentions`: mention webhook

use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use twitter_oauth_session::{
    config::{build_http_client, get_http_timeout, get_server_port, get_webhook_secret},
    crypto::TokenCipher,
    db::PgStore,
    handlers::{create_router, AppState},
    ChannelNotifier, InMemoryStore, MemoryStore, OpenAiRuntime, SessionConfig, SessionError,
    TwitterSession,
};

/// Capacity of the webhook mention queue.
const MENTION_QUEUE_CAPACITY: usize = 64;

/// Loads configuration and collaborators, then starts the session.
async fn start_session() -> Result<Arc<TwitterSession>, SessionError> {
    let mut config = SessionConfig::from_env()?;
    let http = build_http_client(get_http_timeout())?;

    let runtime = Arc::new(OpenAiRuntime::from_env(
        http.clone(),
        &config.credential.account_handle,
    )?);

    let pg = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let cipher = TokenCipher::from_env().map_err(|e| SessionError::Config(e.to_string()))?;
            let store = PgStore::connect(&url, cipher)
                .await
                .map_err(|e| SessionError::Config(format!("database unavailable: {}", e)))?;
            store
                .migrate()
                .await
                .map_err(|e| SessionError::Config(format!("database migration failed: {}", e)))?;
            Some(store)
        }
        Err(_) => {
            warn!("DATABASE_URL not set - memories are kept in process only");
            None
        }
    };

    if let Some(store) = &pg {
        match store.latest_refresh_token().await {
            Ok(Some(token)) => {
                info!("Using refresh token from database instead of TWITTER_REFRESH_TOKEN");
                config.credential.refresh_token = token;
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load refresh token from database: {}", e),
        }
    }

    let memory: Arc<dyn MemoryStore> = match &pg {
        Some(store) => Arc::new(store.clone()),
        None => Arc::new(InMemoryStore::new()),
    };

    let mut builder = TwitterSession::builder(config, runtime, memory).http_client(http);
    if let Some(store) = pg {
        builder = builder.token_vault(Arc::new(store));
    }

    Ok(Arc::new(builder.start().await?))
}

/// Main entry point.
///
/// A session that fails to start is logged and the HTTP server keeps running
/// without it.
#[tokio::main]
async fn main() {
    env_logger::init();

    let mut state = AppState {
        webhook_secret: get_webhook_secret(),
        ..AppState::default()
    };
    if state.webhook_secret.is_none() {
        warn!("WEBHOOK_SECRET not set - POST /tweet and POST /mentions will reject every request");
    }
    match start_session().await {
        Ok(session) => {
            let (sender, notifier) = ChannelNotifier::channel(MENTION_QUEUE_CAPACITY);
            session.listen_for_mentions(Box::new(notifier));
            state.mentions = Some(sender);
            state.session = Some(session);
        }
        Err(e) => {
            error!("Failed to initialize Twitter session: {}", e);
        }
    }

    let session = state.session.clone();
    let app = create_router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let port = get_server_port();
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            if let Some(session) = &session {
                session.shutdown().await;
            }
            return;
        }
    };

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    if let Some(session) = session {
        session.shutdown().await;
    }
}
