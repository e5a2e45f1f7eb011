//! Environment-driven configuration, loaded once at process start.
//!
//! Mirrors `bin/server.rs` in the teacher: `dotenvy::dotenv().ok()` followed
//! by `std::env::var(..).context(..)` for required values and
//! `.unwrap_or_else` defaults for optional ones.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub admin_api_key: Option<String>,
    pub credentials_encryption_key: Option<String>,
    pub public_url: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_from_number: String,
    pub server_port: u16,
    pub idle_session_timeout_secs: u64,
    pub assistant_call_timeout_secs: u64,
    pub scheduler_lease_ttl_secs: i64,
    pub scheduler_claim_limit: i64,
    pub max_message_chars: usize,
    pub max_enabled_schedules_per_user: i64,
}

impl Config {
    /// Load configuration from the process environment. Call
    /// `dotenvy::dotenv().ok()` before this in `main` so a local `.env` file
    /// is picked up in development.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            credentials_encryption_key: std::env::var("CREDENTIALS_ENCRYPTION_KEY").ok(),
            public_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            twilio_account_sid: std::env::var("TWILIO_ACCOUNT_SID").unwrap_or_default(),
            twilio_auth_token: std::env::var("TWILIO_AUTH_TOKEN").unwrap_or_default(),
            twilio_from_number: std::env::var("TWILIO_FROM_NUMBER").unwrap_or_default(),
            server_port: std::env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("invalid SERVER_PORT")?,
            idle_session_timeout_secs: std::env::var("IDLE_SESSION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15 * 60),
            assistant_call_timeout_secs: std::env::var("ASSISTANT_CALL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5 * 60),
            scheduler_lease_ttl_secs: 300,
            scheduler_claim_limit: 50,
            max_message_chars: 4096,
            max_enabled_schedules_per_user: 10,
        })
    }
}
