use std::env;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(#[from] env::VarError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_tls: bool,
    pub smtp_from_email: String,
    pub smtp_max_attempts: u32,
    pub smtp_retry_backoff_ms: u64,
    pub smtp_rate_limit_ms: u64,
    pub mail_send_timeout_secs: u64,
    pub dispatch_concurrency: usize,
    pub campaign_scheduler_interval_secs: u64,
    pub submission_encryption_key: [u8; 32],
    pub session_secret: String,
    pub admin_api_token: Option<String>,
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Decode a base64 (standard or URL-safe) value into a 32-byte key.
pub fn decode_key(encoded: &str) -> Result<[u8; 32], ConfigError> {
    let encoded = encoded.trim();
    let bytes = STANDARD
        .decode(encoded)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(encoded))
        .map_err(|e| ConfigError::Invalid(format!("SUBMISSION_ENCRYPTION_KEY: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        ConfigError::Invalid(format!(
            "SUBMISSION_ENCRYPTION_KEY must decode to 32 bytes, got {}",
            bytes.len()
        ))
    })
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env::var("BASE_URL")?.trim_end_matches('/').to_string();
        let session_secret = env::var("SESSION_SECRET")?;
        if session_secret.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "SESSION_SECRET must not be empty".to_string(),
            ));
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_or("PORT", 8080),
            base_url,
            smtp_host: env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            smtp_port: parse_or("SMTP_PORT", 1025),
            smtp_username: env::var("SMTP_USERNAME").ok().filter(|s| !s.is_empty()),
            smtp_password: env::var("SMTP_PASSWORD").ok().filter(|s| !s.is_empty()),
            smtp_tls: parse_or("SMTP_TLS", false),
            smtp_from_email: env::var("SMTP_FROM_EMAIL")
                .unwrap_or_else(|_| "security-awareness@localhost".to_string()),
            smtp_max_attempts: parse_or("SMTP_MAX_ATTEMPTS", 3).max(1),
            smtp_retry_backoff_ms: parse_or("SMTP_RETRY_BACKOFF_MS", 2000),
            smtp_rate_limit_ms: parse_or("SMTP_RATE_LIMIT_MS", 0),
            mail_send_timeout_secs: parse_or("MAIL_SEND_TIMEOUT_SECS", 30).max(1),
            dispatch_concurrency: parse_or("DISPATCH_CONCURRENCY", 4).max(1),
            campaign_scheduler_interval_secs: parse_or("CAMPAIGN_SCHEDULER_INTERVAL_SECS", 30)
                .max(1),
            submission_encryption_key: decode_key(&env::var("SUBMISSION_ENCRYPTION_KEY")?)?,
            session_secret,
            admin_api_token: env::var("ADMIN_API_TOKEN").ok().filter(|s| !s.is_empty()),
        })
    }

    pub fn mail_send_timeout(&self) -> Duration {
        Duration::from_secs(self.mail_send_timeout_secs)
    }
}
