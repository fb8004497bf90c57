//! Human-session liveness: a TTL key per visitor whose presence means a staff
//! member is currently handling the conversation.
//!
//! Expiry is silent. Nothing is notified when a key lapses; the reconciler
//! polls `is_live` to notice.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::{sync::Mutex, time::Instant};
use uuid::Uuid;

use crate::error::Result;

const SESSION_KEY_PREFIX: &str = "human_session:";

fn session_key(visitor_id: Uuid) -> String {
    format!("{SESSION_KEY_PREFIX}{visitor_id}")
}

/// Minimal TTL key-value contract the session manager needs.
#[async_trait]
pub trait LivenessCache: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Resets the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

/// Process-local cache driven by the tokio clock, so paused-time tests can
/// move it forward with `tokio::time::advance`.
#[derive(Default)]
pub struct MemoryLivenessCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLivenessCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LivenessCache for MemoryLivenessCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(key) {
            Some((value, deadline)) if *deadline > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get_mut(key) {
            Some((_, deadline)) if *deadline > now => {
                *deadline = now + ttl;
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, (_, deadline)| *deadline > now);
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Liveness keys kept in the `human_sessions` table. Expiry is judged against
/// the database clock so every replica agrees on it.
pub struct PgLivenessCache {
    db: PgPool,
}

impl PgLivenessCache {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LivenessCache for PgLivenessCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO human_sessions (key, value, expires_at) \
             VALUES ($1, $2, NOW() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT value FROM human_sessions WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE human_sessions SET expires_at = NOW() + make_interval(secs => $2) \
             WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM human_sessions WHERE key = $1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        // Lapsed rows are pruned lazily here; nothing else reads them.
        sqlx::query("DELETE FROM human_sessions WHERE expires_at <= NOW()")
            .execute(&self.db)
            .await?;
        let rows = sqlx::query(
            "SELECT key FROM human_sessions WHERE key LIKE $1 || '%' AND expires_at > NOW()",
        )
        .bind(prefix)
        .fetch_all(&self.db)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(Into::into))
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1 FROM human_sessions LIMIT 1")
            .fetch_optional(&self.db)
            .await?;
        Ok(())
    }
}

/// Starts, refreshes and ends human sessions on top of a [`LivenessCache`].
pub struct SessionManager {
    cache: Arc<dyn LivenessCache>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(cache: Arc<dyn LivenessCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn start_session(&self, visitor_id: Uuid, staff_id: Uuid) -> Result<()> {
        self.cache
            .set(&session_key(visitor_id), &staff_id.to_string(), self.ttl)
            .await
    }

    /// Extends a live session. Returns false, touching nothing, when no
    /// session is live for the visitor.
    pub async fn refresh_session(&self, visitor_id: Uuid) -> Result<bool> {
        self.cache.expire(&session_key(visitor_id), self.ttl).await
    }

    pub async fn end_session(&self, visitor_id: Uuid) -> Result<()> {
        self.cache.delete(&session_key(visitor_id)).await
    }

    pub async fn is_live(&self, visitor_id: Uuid) -> Result<bool> {
        self.cache.exists(&session_key(visitor_id)).await
    }

    pub async fn staff_for(&self, visitor_id: Uuid) -> Result<Option<Uuid>> {
        let value = self.cache.get(&session_key(visitor_id)).await?;
        Ok(value.and_then(|raw| Uuid::parse_str(&raw).ok()))
    }

    /// Visitor ids with a live session. Diagnostic only.
    pub async fn live_sessions(&self) -> Result<Vec<Uuid>> {
        let keys = self.cache.keys(SESSION_KEY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(SESSION_KEY_PREFIX))
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .collect())
    }
}
