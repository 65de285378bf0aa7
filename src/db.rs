//! Database module for memory records and refresh tokens.
//!
//! [`PgStore`] is the PostgreSQL-backed [`MemoryStore`] and [`TokenVault`].
//! Memory records go to the `memories` table; rotated refresh tokens are
//! encrypted and appended to `refresh_tokens`, newest row wins.

use async_trait::async_trait;
use log::{debug, info, warn};
use sqlx::{PgPool, Row};

use crate::config::mask_token;
use crate::credentials::TokenVault;
use crate::crypto::TokenCipher;
use crate::error::BoxError;
use crate::runtime::{MemoryRecord, MemoryStore};

/// PostgreSQL store for memories and refresh tokens.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    cipher: Option<TokenCipher>,
}

impl PgStore {
    /// Connects to `database_url`. Without a cipher, refresh tokens are not persisted.
    pub async fn connect(database_url: &str, cipher: Option<TokenCipher>) -> Result<Self, BoxError> {
        info!("Connecting to PostgreSQL database");
        debug!("Database URL (masked): {}", mask_token(database_url));

        let pool = PgPool::connect(database_url).await?;
        info!("Successfully connected to PostgreSQL database");

        if cipher.is_none() {
            warn!("TOKEN_ENCRYPTION_KEY not set - rotated refresh tokens will not be saved");
        }
        Ok(Self { pool, cipher })
    }

    /// Creates the `memories` and `refresh_tokens` tables if missing.
    pub async fn migrate(&self) -> Result<(), BoxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id UUID PRIMARY KEY,
                actor_id UUID NOT NULL,
                room_id UUID NOT NULL,
                text TEXT NOT NULL,
                source TEXT NOT NULL,
                embedding REAL[] NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refresh_tokens (
                id BIGSERIAL PRIMARY KEY,
                token TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database tables are ready");
        Ok(())
    }

    /// Returns the most recently saved refresh token, decrypted.
    pub async fn latest_refresh_token(&self) -> Result<Option<String>, BoxError> {
        let Some(cipher) = &self.cipher else {
            return Ok(None);
        };

        info!("Querying database for latest refresh token");
        let row = sqlx::query(
            r#"
            SELECT token, created_at
            FROM refresh_tokens
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let encrypted: String = row.get("token");
                let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");
                let token = cipher.decrypt(&encrypted)?;
                info!(
                    "Found refresh token created at {} (masked: {})",
                    created_at,
                    mask_token(&token)
                );
                Ok(Some(token))
            }
            None => {
                info!("No refresh token found in database");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl MemoryStore for PgStore {
    async fn create_memory(&self, record: &MemoryRecord) -> Result<(), BoxError> {
        debug!("Saving memory {} in room {}", record.id, record.room_id);

        let result = sqlx::query(
            r#"
            INSERT INTO memories (id, actor_id, room_id, text, source, embedding, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.actor_id)
        .bind(record.room_id)
        .bind(&record.content.text)
        .bind(&record.content.source)
        .bind(&record.embedding)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("Memory {} already exists, not overwritten", record.id);
        } else {
            info!("Saved memory {}", record.id);
        }
        Ok(())
    }
}

#[async_trait]
impl TokenVault for PgStore {
    async fn save_refresh_token(&self, token: &str) -> Result<(), BoxError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or("TOKEN_ENCRYPTION_KEY not configured, refusing to store a plaintext token")?;

        info!("Storing new refresh token in database");
        debug!("Refresh token (masked): {}", mask_token(token));

        let encrypted = cipher.encrypt(token)?;
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (token, created_at)
            VALUES ($1, NOW())
            "#,
        )
        .bind(encrypted)
        .execute(&self.pool)
        .await?;

        info!("Successfully stored new refresh token in database");
        Ok(())
    }
}
