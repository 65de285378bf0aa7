//! Cryptographic utilities for secure token storage.
//!
//! Refresh tokens written to the database are encrypted with AES-256-GCM.
//! The stored form is hex(nonce || ciphertext || tag).

use aes_gcm::{
    aead::{generic_array::typenum::U12, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use log::debug;
use std::env;

use crate::error::BoxError;

/// The length of the nonce in bytes (96 bits for AES-GCM)
const NONCE_LENGTH: usize = 12;

/// Environment variable holding the 64-character hex key.
pub const ENCRYPTION_KEY_VAR: &str = "TOKEN_ENCRYPTION_KEY";

/// AES-256-GCM cipher for tokens at rest.
#[derive(Clone)]
pub struct TokenCipher {
    key: [u8; 32],
}

impl TokenCipher {
    /// Builds a cipher from a 32-byte key encoded as 64 hex characters.
    pub fn from_hex(key_hex: &str) -> Result<Self, BoxError> {
        let key_bytes = hex::decode(key_hex.trim()).map_err(|e| {
            format!(
                "{} is not valid hex: {}. Generate a key with: openssl rand -hex 32",
                ENCRYPTION_KEY_VAR, e
            )
        })?;

        if key_bytes.len() != 32 {
            return Err(format!(
                "{} must be exactly 32 bytes (64 hex chars), got {} bytes",
                ENCRYPTION_KEY_VAR,
                key_bytes.len()
            )
            .into());
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&key_bytes);
        Ok(Self { key })
    }

    /// Reads the key from `TOKEN_ENCRYPTION_KEY`. `Ok(None)` when unset.
    pub fn from_env() -> Result<Option<Self>, BoxError> {
        match env::var(ENCRYPTION_KEY_VAR) {
            Ok(key_hex) => Ok(Some(Self::from_hex(&key_hex)?)),
            Err(_) => Ok(None),
        }
    }

    /// Encrypts `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, BoxError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| format!("Failed to generate random nonce: {}", e))?;
        let nonce: Nonce<U12> = nonce_bytes.into();

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("Encryption failed: {}", e))?;

        let mut result = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);

        debug!("Token encrypted successfully");
        Ok(hex::encode(result))
    }

    /// Decrypts a value produced by [`TokenCipher::encrypt`].
    pub fn decrypt(&self, encrypted_hex: &str) -> Result<String, BoxError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)?;

        let encrypted_bytes = hex::decode(encrypted_hex)
            .map_err(|e| format!("Invalid hex in encrypted token: {}", e))?;

        if encrypted_bytes.len() < NONCE_LENGTH {
            return Err("Encrypted token is too short".into());
        }

        let (nonce_bytes, ciphertext) = encrypted_bytes.split_at(NONCE_LENGTH);
        let nonce_array: [u8; NONCE_LENGTH] =
            nonce_bytes.try_into().map_err(|_| "Invalid nonce length")?;
        let nonce: Nonce<U12> = nonce_array.into();

        let plaintext = cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| "Decryption failed - wrong key or corrupted data")?;

        let token = String::from_utf8(plaintext)
            .map_err(|e| format!("Decrypted token is not valid UTF-8: {}", e))?;

        debug!("Token decrypted successfully");
        Ok(token)
    }
}
