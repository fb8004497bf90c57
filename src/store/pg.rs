use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{QueueStore, StaffDirectory, VisitorStore};
use crate::error::{HandoffError, Result};
use crate::types::{QueueCounts, QueueStatus, ServiceStatus, Staff, Visitor, WaitingQueueEntry};

const ENTRY_COLUMNS: &str = "id, project_id, visitor_id, channel_id, status, priority, source, \
     wait_started_at, assigned_to, assigned_at";

/// Opens the pool and applies embedded migrations.
pub async fn connect(database_url: &str, acquire_timeout: Duration) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn visitor_from_row(row: &PgRow) -> Result<Visitor> {
    let raw: String = row.try_get("service_status")?;
    let service_status = ServiceStatus::parse(&raw)
        .ok_or_else(|| HandoffError::upstream("database", format!("unknown service_status {raw}")))?;
    Ok(Visitor {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        external_id: row.try_get("external_id")?,
        service_status,
        assigned_staff_id: row.try_get("assigned_staff_id")?,
        ai_enabled: row.try_get("ai_enabled")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<WaitingQueueEntry> {
    let raw: String = row.try_get("status")?;
    let status = QueueStatus::parse(&raw)
        .ok_or_else(|| HandoffError::upstream("database", format!("unknown queue status {raw}")))?;
    Ok(WaitingQueueEntry {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        visitor_id: row.try_get("visitor_id")?,
        channel_id: row.try_get("channel_id")?,
        status,
        priority: row.try_get("priority")?,
        source: row.try_get("source")?,
        wait_started_at: row.try_get("wait_started_at")?,
        assigned_to: row.try_get("assigned_to")?,
        assigned_at: row.try_get("assigned_at")?,
    })
}

fn staff_from_row(row: &PgRow) -> Result<Staff> {
    Ok(Staff {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        username: row.try_get("username")?,
        nickname: row.try_get("nickname")?,
        is_active: row.try_get("is_active")?,
        service_paused: row.try_get("service_paused")?,
    })
}

#[async_trait]
impl VisitorStore for PgStore {
    async fn find_visitor(&self, project_id: Uuid, visitor_id: Uuid) -> Result<Option<Visitor>> {
        let row = sqlx::query(
            "SELECT id, project_id, external_id, service_status, assigned_staff_id, ai_enabled \
             FROM visitors WHERE id = $1 AND project_id = $2 AND deleted_at IS NULL",
        )
        .bind(visitor_id)
        .bind(project_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(visitor_from_row).transpose()
    }

    async fn find_visitor_by_id(&self, visitor_id: Uuid) -> Result<Option<Visitor>> {
        let row = sqlx::query(
            "SELECT id, project_id, external_id, service_status, assigned_staff_id, ai_enabled \
             FROM visitors WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(visitor_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(visitor_from_row).transpose()
    }

    async fn save_service_state(&self, visitor: &Visitor) -> Result<()> {
        sqlx::query(
            "UPDATE visitors SET service_status = $1, assigned_staff_id = $2, ai_enabled = $3, \
             updated_at = NOW() WHERE id = $4",
        )
        .bind(visitor.service_status.as_str())
        .bind(visitor.assigned_staff_id)
        .bind(visitor.ai_enabled)
        .bind(visitor.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_by_service_status(&self, status: ServiceStatus) -> Result<Vec<Visitor>> {
        let rows = sqlx::query(
            "SELECT id, project_id, external_id, service_status, assigned_staff_id, ai_enabled \
             FROM visitors WHERE service_status = $1 AND deleted_at IS NULL",
        )
        .bind(status.as_str())
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(visitor_from_row).collect()
    }

    async fn reset_to_ai_if_human(&self, visitor_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE visitors SET service_status = 'new', assigned_staff_id = NULL, \
             ai_enabled = true, updated_at = NOW() \
             WHERE id = $1 AND service_status = 'active' AND ai_enabled = false",
        )
        .bind(visitor_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_if_queued(&self, visitor_id: Uuid, to: ServiceStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE visitors SET service_status = $1, assigned_staff_id = NULL, \
             ai_enabled = true, updated_at = NOW() \
             WHERE id = $2 AND service_status = 'queued' \
               AND NOT EXISTS (SELECT 1 FROM visitor_waiting_queue q \
                               WHERE q.visitor_id = $2 AND q.status = 'waiting')",
        )
        .bind(to.as_str())
        .bind(visitor_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn create_entry(&self, entry: &WaitingQueueEntry) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO visitor_waiting_queue \
             (id, project_id, visitor_id, channel_id, status, priority, source, wait_started_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
             ON CONFLICT (visitor_id) WHERE status = 'waiting' DO NOTHING",
        )
        .bind(entry.id)
        .bind(entry.project_id)
        .bind(entry.visitor_id)
        .bind(&entry.channel_id)
        .bind(entry.status.as_str())
        .bind(entry.priority)
        .bind(&entry.source)
        .bind(entry.wait_started_at)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_entry(
        &self,
        project_id: Uuid,
        entry_id: Uuid,
    ) -> Result<Option<WaitingQueueEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM visitor_waiting_queue WHERE id = $1 AND project_id = $2"
        ))
        .bind(entry_id)
        .bind(project_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn find_waiting_by_visitor(
        &self,
        project_id: Uuid,
        visitor_id: Uuid,
    ) -> Result<Option<WaitingQueueEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM visitor_waiting_queue \
             WHERE project_id = $1 AND visitor_id = $2 AND status = 'waiting' LIMIT 1"
        ))
        .bind(project_id)
        .bind(visitor_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn position(&self, project_id: Uuid, entry_id: Uuid) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT (SELECT COUNT(*) FROM visitor_waiting_queue o \
                     WHERE o.project_id = e.project_id AND o.status = 'waiting' AND o.id <> e.id \
                       AND (o.priority > e.priority \
                            OR (o.priority = e.priority AND o.wait_started_at < e.wait_started_at))) \
                    AS ahead \
             FROM visitor_waiting_queue e WHERE e.id = $1 AND e.project_id = $2",
        )
        .bind(entry_id)
        .bind(project_id)
        .fetch_optional(&self.db)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>("ahead")? + 1)),
            None => Ok(None),
        }
    }

    async fn assign_entry(
        &self,
        project_id: Uuid,
        entry_id: Uuid,
        staff_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE visitor_waiting_queue SET status = 'assigned', assigned_to = $1, \
             assigned_at = $2 WHERE id = $3 AND project_id = $4",
        )
        .bind(staff_id)
        .bind(at)
        .bind(entry_id)
        .bind(project_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn mark_left(&self, project_id: Uuid, entry_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE visitor_waiting_queue SET status = 'left' \
             WHERE id = $1 AND project_id = $2 AND status = 'waiting'",
        )
        .bind(entry_id)
        .bind(project_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_waiting(
        &self,
        project_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WaitingQueueEntry>, i64)> {
        let total: i64 = sqlx::query(
            "SELECT COUNT(*) AS total FROM visitor_waiting_queue \
             WHERE project_id = $1 AND status = 'waiting'",
        )
        .bind(project_id)
        .fetch_one(&self.db)
        .await?
        .try_get("total")?;

        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM visitor_waiting_queue \
             WHERE project_id = $1 AND status = 'waiting' \
             ORDER BY priority DESC, wait_started_at ASC LIMIT $2 OFFSET $3"
        ))
        .bind(project_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;
        let entries = rows.iter().map(entry_from_row).collect::<Result<Vec<_>>>()?;
        Ok((entries, total))
    }

    async fn counts(&self, project_id: Uuid) -> Result<QueueCounts> {
        let row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE status = 'waiting') AS waiting, \
                    COUNT(*) FILTER (WHERE status = 'assigned') AS assigned \
             FROM visitor_waiting_queue WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_one(&self.db)
        .await?;
        Ok(QueueCounts {
            waiting: row.try_get("waiting")?,
            assigned: row.try_get("assigned")?,
        })
    }

    async fn expired_waiting(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitingQueueEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM visitor_waiting_queue \
             WHERE status = 'waiting' AND wait_started_at < $1 \
             ORDER BY wait_started_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn mark_timeout(&self, entry_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE visitor_waiting_queue SET status = 'timeout' \
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(entry_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl StaffDirectory for PgStore {
    async fn list_available(&self, project_id: Uuid) -> Result<Vec<Staff>> {
        let rows = sqlx::query(
            "SELECT id, project_id, username, nickname, is_active, service_paused FROM staff \
             WHERE project_id = $1 AND is_active = true AND service_paused = false \
               AND deleted_at IS NULL \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(staff_from_row).collect()
    }

    async fn get_by_id(&self, staff_id: Uuid) -> Result<Option<Staff>> {
        let row = sqlx::query(
            "SELECT id, project_id, username, nickname, is_active, service_paused FROM staff \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(staff_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(staff_from_row).transpose()
    }
}
