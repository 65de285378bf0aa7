//! Twitter Session Token Refresh Utility
//!
//! Exchanges a refresh token for a new access token outside a running session,
//! for example after the session was down long enough for the access token to
//! expire. Reads `TWITTER_CLIENT_ID` / `TWITTER_CLIENT_SECRET` from the
//! environment and prompts for anything missing. When `DATABASE_URL` is set,
//! a rotated refresh token is also saved to the database.

use std::env;
use std::io::{self, Write};

use twitter_oauth_session::{
    config::{mask_token, DEFAULT_TOKEN_URL},
    crypto::TokenCipher,
    db::PgStore,
    oauth::exchange_refresh_token,
    BoxError, TokenVault,
};
use url::Url;

fn env_or_prompt(key: &str, prompt: &str) -> Result<String, BoxError> {
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            println!("Using {} from environment ({})", key, mask_token(&value));
            return Ok(value.trim().to_string());
        }
    }

    print!("{}: ", prompt);
    io::stdout().flush()?;
    let mut value = String::new();
    io::stdin().read_line(&mut value)?;
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(format!("{} is required", key).into());
    }
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    println!("🔄 Twitter Session Token Refresh Utility");
    println!("========================================");

    let client_id = env_or_prompt("TWITTER_CLIENT_ID", "Enter your Twitter App Client ID")?;
    let client_secret =
        env_or_prompt("TWITTER_CLIENT_SECRET", "Enter your Twitter App Client Secret")?;
    let refresh_token = env_or_prompt("TWITTER_REFRESH_TOKEN", "Enter your refresh token")?;
    let token_url = Url::parse(
        &env::var("TWITTER_TOKEN_URL").unwrap_or_else(|_| DEFAULT_TOKEN_URL.to_string()),
    )?;

    println!("\n🔄 Refreshing access token...");
    let token = exchange_refresh_token(
        &reqwest::Client::new(),
        &token_url,
        &client_id,
        &client_secret,
        &refresh_token,
    )
    .await?;

    println!("\n✅ Success! Your new access token is:");
    println!("{}", token.access_token);
    if let Some(expires_in) = token.expires_in {
        println!("   (expires in {} seconds)", expires_in);
    }
    println!("\n📝 Update your access token:");
    println!("   export TWITTER_ACCESS_TOKEN=\"{}\"", token.access_token);

    let Some(rotated) = token.refresh_token.filter(|t| !t.is_empty()) else {
        println!("\nRefresh token was not rotated; keep using the current one.");
        return Ok(());
    };

    println!("\n⚠️  IMPORTANT: Your old refresh token is now invalid!");
    println!("   export TWITTER_REFRESH_TOKEN=\"{}\"", rotated);

    if let Ok(database_url) = env::var("DATABASE_URL") {
        let store = PgStore::connect(&database_url, TokenCipher::from_env()?).await?;
        store.migrate().await?;
        match store.save_refresh_token(&rotated).await {
            Ok(()) => println!("💾 Rotated refresh token saved to the database"),
            Err(e) => eprintln!("❌ Failed to save refresh token to the database: {}", e),
        }
    }

    Ok(())
}
