//! Environment-driven configuration.
//!
//! Values come from the process environment (after `.env` is loaded in
//! `main`). Zero or negative durations fall back to their defaults.

use std::time::Duration;

use crate::error::{HandoffError, Result};

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_QUEUE_EXPIRY_MINUTES: u64 = 30;
pub const DEFAULT_QUEUE_SWEEP_INTERVAL_MINUTES: u64 = 5;
pub const DEFAULT_QUEUE_SWEEP_BATCH: i64 = 100;
pub const DEFAULT_HUMAN_SESSION_TTL_SECS: u64 = 5 * 60;
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WUKONGIM_URL: &str = "http://localhost:5001";

/// Which backend holds the human-session liveness keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCacheBackend {
    Memory,
    Postgres,
    Off,
}

impl SessionCacheBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "memory" => Some(Self::Memory),
            "postgres" | "pg" => Some(Self::Postgres),
            "off" | "disabled" | "none" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub expiry: Duration,
    pub sweep_interval: Duration,
    pub sweep_batch: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(DEFAULT_QUEUE_EXPIRY_MINUTES * 60),
            sweep_interval: Duration::from_secs(DEFAULT_QUEUE_SWEEP_INTERVAL_MINUTES * 60),
            sweep_batch: DEFAULT_QUEUE_SWEEP_BATCH,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backend: SessionCacheBackend,
    pub ttl: Duration,
    pub reconcile_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: SessionCacheBackend::Memory,
            ttl: Duration::from_secs(DEFAULT_HUMAN_SESSION_TTL_SECS),
            reconcile_interval: Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub port: u16,
    pub database_url: String,
    pub wukongim_url: String,
    pub wukongim_api_key: String,
    pub request_timeout: Duration,
    pub log_level: String,
    pub queue: QueueConfig,
    pub session: SessionConfig,
}

impl HandoffConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| HandoffError::Config(format!("PORT is not a valid port: {raw}")))?,
            None => DEFAULT_PORT,
        };

        let queue = QueueConfig {
            expiry: Duration::from_secs(
                positive_or(&get, "QUEUE_EXPIRY_MINUTES", DEFAULT_QUEUE_EXPIRY_MINUTES as i64)?
                    as u64
                    * 60,
            ),
            sweep_interval: Duration::from_secs(
                positive_or(
                    &get,
                    "QUEUE_SWEEP_INTERVAL_MINUTES",
                    DEFAULT_QUEUE_SWEEP_INTERVAL_MINUTES as i64,
                )? as u64
                    * 60,
            ),
            sweep_batch: positive_or(&get, "QUEUE_SWEEP_BATCH", DEFAULT_QUEUE_SWEEP_BATCH)?,
        };

        let backend_raw = get("SESSION_CACHE").unwrap_or_default();
        let backend = SessionCacheBackend::parse(&backend_raw).ok_or_else(|| {
            HandoffError::Config(format!(
                "SESSION_CACHE must be one of memory, postgres, off (got {backend_raw})"
            ))
        })?;
        let session = SessionConfig {
            backend,
            ttl: Duration::from_secs(positive_or(
                &get,
                "HUMAN_SESSION_TTL_SECS",
                DEFAULT_HUMAN_SESSION_TTL_SECS as i64,
            )? as u64),
            reconcile_interval: Duration::from_secs(positive_or(
                &get,
                "SESSION_RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL_SECS as i64,
            )? as u64),
        };

        Ok(Self {
            port,
            database_url: resolve_database_url(&get),
            wukongim_url: get("WUKONGIM_URL")
                .unwrap_or_else(|| DEFAULT_WUKONGIM_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            wukongim_api_key: get("WUKONGIM_API_KEY").unwrap_or_default(),
            request_timeout: Duration::from_secs(positive_or(
                &get,
                "REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS as i64,
            )? as u64),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            queue,
            session,
        })
    }
}

fn positive_or<G>(get: &G, key: &str, default: i64) -> Result<i64>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let value = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| HandoffError::Config(format!("{key} must be an integer (got {raw})")))?;
    Ok(if value <= 0 { default } else { value })
}

fn resolve_database_url<G>(get: &G) -> String
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(url) = get("DATABASE_URL") {
        return url;
    }
    let pick = |primary: &str, fallback: &str, default: &str| {
        get(primary)
            .or_else(|| get(fallback))
            .unwrap_or_else(|| default.to_string())
    };
    let host = pick("POSTGRES_HOST", "PGHOST", "localhost");
    let port = pick("POSTGRES_PORT", "PGPORT", "5432");
    let user = pick("POSTGRES_USER", "PGUSER", "postgres");
    let password = pick("POSTGRES_PASSWORD", "PGPASSWORD", "postgres");
    let db = pick("POSTGRES_DB", "PGDATABASE", "handoff");
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}
