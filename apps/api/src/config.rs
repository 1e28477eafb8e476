use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if a required variable is missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    /// Absent: in-memory pipeline store, single instance only.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    /// Absent: in-memory shared store, single instance only.
    pub redis_url: Option<String>,
    pub anthropic_api_key: String,
    pub slack_signing_secret: Option<String>,
    pub mailgun_signing_key: Option<String>,
    pub bot_handle: String,
    pub fuzzy_match_threshold: f64,
    pub redirect_timeout: Duration,
    pub signature_tolerance: Duration,
    pub reuse_thread_on_retry: bool,
    /// API host overrides, for proxies and mock servers.
    pub slack_api_base: Option<String>,
    pub figma_api_base: Option<String>,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let fuzzy_match_threshold: f64 = env_or("FUZZY_MATCH_THRESHOLD", 0.8)?;
        if !(0.0..=1.0).contains(&fuzzy_match_threshold) {
            anyhow::bail!("FUZZY_MATCH_THRESHOLD must be between 0 and 1");
        }

        Ok(Config {
            database_url: optional_env("DATABASE_URL"),
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: optional_env("REDIS_URL"),
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            slack_signing_secret: optional_env("SLACK_SIGNING_SECRET"),
            mailgun_signing_key: optional_env("MAILGUN_SIGNING_KEY"),
            bot_handle: optional_env("BOT_HANDLE").unwrap_or_else(|| "threadwise".to_string()),
            fuzzy_match_threshold,
            redirect_timeout: Duration::from_millis(env_or("REDIRECT_TIMEOUT_MS", 3000)?),
            signature_tolerance: Duration::from_secs(env_or("SIGNATURE_TOLERANCE_SECS", 300)?),
            reuse_thread_on_retry: env_or("REUSE_THREAD_ON_RETRY", true)?,
            slack_api_base: optional_env("SLACK_API_BASE"),
            figma_api_base: optional_env("FIGMA_API_BASE"),
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("{key} has an invalid value '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_reports_key() {
        let err = parse_value::<u16>("PORT", "eighty").unwrap_err();
        assert!(err.to_string().contains("PORT"));
        assert_eq!(parse_value::<u16>("PORT", " 9000 ").unwrap(), 9000);
        assert!(!parse_value::<bool>("REUSE_THREAD_ON_RETRY", "false").unwrap());
    }
}
