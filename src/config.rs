use anyhow::{Context, Result};
use std::{str::FromStr, time::Duration};

use crate::{
    guards::throttle::{GLOBAL_IP_LIMIT, LINK_IP_LIMIT},
    jobs::{expiry::SWEEP_INTERVAL, stats::FLUSH_INTERVAL},
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite connection string, e.g. "sqlite:./linkguard.db"
    pub database_url: String,

    /// Redis URL for the shared ephemeral store. When unset, counters and
    /// cached snapshots live in this process only.
    pub redis_url: Option<String>,

    /// Host to bind the HTTP server to, e.g. "0.0.0.0"
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Set when a reverse proxy sits in front of the server. Only then are
    /// `X-Forwarded-For` / `X-Real-IP` used to find the client address.
    pub trust_proxy: bool,

    /// Deadline for every ephemeral and durable store call
    pub store_timeout: Duration,

    pub flush_interval: Duration,
    pub sweep_interval: Duration,

    /// Fixed-window limiter on the redirect route: key prefix, max requests,
    /// window length.
    pub rate_limit_prefix: String,
    pub rate_limit_max: i64,
    pub rate_limit_window: Duration,

    pub global_ip_limit: i64,
    pub link_ip_limit: i64,

    /// Google Safe Browsing key; links are not scanned without one.
    pub safe_browsing_api_key: Option<String>,
    pub safety_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./linkguard.db".into(),
            redis_url: None,
            host: "0.0.0.0".into(),
            port: 3000,
            trust_proxy: false,
            store_timeout: Duration::from_millis(500),
            flush_interval: FLUSH_INTERVAL,
            sweep_interval: SWEEP_INTERVAL,
            rate_limit_prefix: "rl".into(),
            rate_limit_max: 50,
            rate_limit_window: Duration::from_secs(60),
            global_ip_limit: GLOBAL_IP_LIMIT,
            link_ip_limit: LINK_IP_LIMIT,
            safe_browsing_api_key: None,
            safety_timeout: Duration::from_secs(3),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables (populated by dotenvy before this is called).
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: non_empty_var("REDIS_URL"),
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: parse_var("PORT", defaults.port)?,
            trust_proxy: parse_var("TRUST_PROXY", defaults.trust_proxy)?,
            store_timeout: Duration::from_millis(parse_var(
                "STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
            flush_interval: Duration::from_secs(parse_var(
                "FLUSH_INTERVAL_SECS",
                defaults.flush_interval.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(parse_var(
                "SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )?),
            rate_limit_prefix: non_empty_var("RATE_LIMIT_PREFIX")
                .unwrap_or(defaults.rate_limit_prefix),
            rate_limit_max: parse_var("RATE_LIMIT_MAX", defaults.rate_limit_max)?,
            rate_limit_window: Duration::from_secs(parse_var(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window.as_secs(),
            )?),
            global_ip_limit: parse_var("GLOBAL_IP_LIMIT", defaults.global_ip_limit)?,
            link_ip_limit: parse_var("LINK_IP_LIMIT", defaults.link_ip_limit)?,
            safe_browsing_api_key: non_empty_var("SAFE_BROWSING_API_KEY"),
            safety_timeout: Duration::from_millis(parse_var(
                "SAFETY_TIMEOUT_MS",
                defaults.safety_timeout.as_millis() as u64,
            )?),
        };

        if config.flush_interval.is_zero() || config.sweep_interval.is_zero() {
            anyhow::bail!("FLUSH_INTERVAL_SECS and SWEEP_INTERVAL_SECS must be at least 1");
        }
        if config.rate_limit_window.is_zero() {
            anyhow::bail!("RATE_LIMIT_WINDOW_SECS must be at least 1");
        }

        Ok(config)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

/// Parse `name` if set, otherwise use `default`. A value that does not parse
/// is an error rather than a silent fallback.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}
