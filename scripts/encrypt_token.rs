//! Token Encryption Utility
//!
//! Encrypts a refresh token with AES-256-GCM so it can be inserted into the
//! `refresh_tokens` table by hand. Requires `TOKEN_ENCRYPTION_KEY`.

use std::io::{self, Write};

use twitter_oauth_session::crypto::{TokenCipher, ENCRYPTION_KEY_VAR};
use twitter_oauth_session::BoxError;

fn main() -> Result<(), BoxError> {
    println!("🔐 Token Encryption Utility");
    println!("===========================");
    println!();

    let cipher = match TokenCipher::from_env()? {
        Some(cipher) => cipher,
        None => {
            eprintln!("❌ Error: {} environment variable is not set.", ENCRYPTION_KEY_VAR);
            eprintln!();
            eprintln!("Generate a key with:");
            eprintln!("  openssl rand -hex 32");
            eprintln!();
            eprintln!("Then set it:");
            eprintln!("  export {}=\"your_64_char_hex_key\"", ENCRYPTION_KEY_VAR);
            std::process::exit(1);
        }
    };

    print!("Enter the token to encrypt: ");
    io::stdout().flush()?;
    let mut token = String::new();
    io::stdin().read_line(&mut token)?;
    let token = token.trim();

    if token.is_empty() {
        eprintln!("❌ Error: Token cannot be empty");
        std::process::exit(1);
    }

    let encrypted = cipher.encrypt(token)?;
    // Round-trip before handing it out.
    if cipher.decrypt(&encrypted)? != token {
        eprintln!("❌ Encryption self-check failed");
        std::process::exit(1);
    }

    println!();
    println!("✅ Token encrypted successfully!");
    println!();
    println!("Encrypted value (hex):");
    println!("{}", encrypted);
    println!();
    println!("📝 Use this value in: INSERT INTO refresh_tokens (token) VALUES ('<value>');");

    Ok(())
}
