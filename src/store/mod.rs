//! Durable state the handoff controller reads and writes.
//!
//! `pg` is the production backend; `memory` keeps everything in-process for
//! tests and embedders that bring their own persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{QueueCounts, QueueStatus, ServiceStatus, Staff, Visitor, WaitingQueueEntry};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

#[async_trait]
pub trait VisitorStore: Send + Sync {
    async fn find_visitor(&self, project_id: Uuid, visitor_id: Uuid) -> Result<Option<Visitor>>;

    async fn find_visitor_by_id(&self, visitor_id: Uuid) -> Result<Option<Visitor>>;

    /// Persists `service_status`, `assigned_staff_id` and `ai_enabled`. Last write wins.
    async fn save_service_state(&self, visitor: &Visitor) -> Result<()>;

    async fn list_by_service_status(&self, status: ServiceStatus) -> Result<Vec<Visitor>>;

    /// Resets a visitor to AI mode only while it is still `active` with AI
    /// off. Returns false when the row had already moved on.
    async fn reset_to_ai_if_human(&self, visitor_id: Uuid) -> Result<bool>;

    /// Moves a `queued` visitor to `to` with AI re-enabled. Returns false
    /// when the visitor was no longer queued or has been queued again (a
    /// `waiting` entry exists for it).
    async fn release_if_queued(&self, visitor_id: Uuid, to: ServiceStatus) -> Result<bool>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Inserts a `waiting` entry. Returns false, writing nothing, when the
    /// visitor already has a waiting entry.
    async fn create_entry(&self, entry: &WaitingQueueEntry) -> Result<bool>;

    async fn find_entry(&self, project_id: Uuid, entry_id: Uuid)
        -> Result<Option<WaitingQueueEntry>>;

    async fn find_waiting_by_visitor(
        &self,
        project_id: Uuid,
        visitor_id: Uuid,
    ) -> Result<Option<WaitingQueueEntry>>;

    /// 1-based position among the project's waiting entries under
    /// `priority DESC, wait_started_at ASC`. None when the entry is unknown.
    async fn position(&self, project_id: Uuid, entry_id: Uuid) -> Result<Option<i64>>;

    async fn assign_entry(
        &self,
        project_id: Uuid,
        entry_id: Uuid,
        staff_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Marks a still-waiting entry as left. Returns false if it had already
    /// been assigned or timed out.
    async fn mark_left(&self, project_id: Uuid, entry_id: Uuid) -> Result<bool>;

    async fn list_waiting(
        &self,
        project_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WaitingQueueEntry>, i64)>;

    async fn counts(&self, project_id: Uuid) -> Result<QueueCounts>;

    /// Oldest-first batch of waiting entries that started before `older_than`.
    async fn expired_waiting(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitingQueueEntry>>;

    /// Marks a still-waiting entry as timed out. Returns false if it had
    /// already left the waiting state.
    async fn mark_timeout(&self, entry_id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait StaffDirectory: Send + Sync {
    /// Active, non-paused staff of a project in stable directory order.
    async fn list_available(&self, project_id: Uuid) -> Result<Vec<Staff>>;

    async fn get_by_id(&self, staff_id: Uuid) -> Result<Option<Staff>>;
}
