use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{QueueStore, StaffDirectory, VisitorStore};
use crate::error::Result;
use crate::types::{QueueCounts, QueueStatus, ServiceStatus, Staff, Visitor, WaitingQueueEntry};

#[derive(Default)]
struct Tables {
    visitors: HashMap<Uuid, Visitor>,
    // Insertion order doubles as the staff directory's stable iteration order.
    staff: Vec<Staff>,
    queue: Vec<WaitingQueueEntry>,
}

/// In-process implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_visitor(&self, visitor: Visitor) {
        self.tables
            .write()
            .await
            .visitors
            .insert(visitor.id, visitor);
    }

    pub async fn insert_staff(&self, staff: Staff) {
        let mut tables = self.tables.write().await;
        tables.staff.retain(|s| s.id != staff.id);
        tables.staff.push(staff);
    }

    pub async fn insert_entry(&self, entry: WaitingQueueEntry) {
        self.tables.write().await.queue.push(entry);
    }

    pub async fn visitor(&self, visitor_id: Uuid) -> Option<Visitor> {
        self.tables.read().await.visitors.get(&visitor_id).cloned()
    }

    pub async fn visitors(&self) -> Vec<Visitor> {
        self.tables.read().await.visitors.values().cloned().collect()
    }

    pub async fn entries_for_visitor(&self, visitor_id: Uuid) -> Vec<WaitingQueueEntry> {
        self.tables
            .read()
            .await
            .queue
            .iter()
            .filter(|e| e.visitor_id == visitor_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl VisitorStore for MemoryStore {
    async fn find_visitor(&self, project_id: Uuid, visitor_id: Uuid) -> Result<Option<Visitor>> {
        Ok(self
            .tables
            .read()
            .await
            .visitors
            .get(&visitor_id)
            .filter(|v| v.project_id == project_id)
            .cloned())
    }

    async fn find_visitor_by_id(&self, visitor_id: Uuid) -> Result<Option<Visitor>> {
        Ok(self.visitor(visitor_id).await)
    }

    async fn save_service_state(&self, visitor: &Visitor) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.visitors.get_mut(&visitor.id) {
            row.service_status = visitor.service_status;
            row.assigned_staff_id = visitor.assigned_staff_id;
            row.ai_enabled = visitor.ai_enabled;
        }
        Ok(())
    }

    async fn list_by_service_status(&self, status: ServiceStatus) -> Result<Vec<Visitor>> {
        Ok(self
            .tables
            .read()
            .await
            .visitors
            .values()
            .filter(|v| v.service_status == status)
            .cloned()
            .collect())
    }

    async fn reset_to_ai_if_human(&self, visitor_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.visitors.get_mut(&visitor_id) {
            Some(v) if v.service_status == ServiceStatus::Active && !v.ai_enabled => {
                v.reset_to_ai();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_if_queued(&self, visitor_id: Uuid, to: ServiceStatus) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let still_waiting = tables
            .queue
            .iter()
            .any(|e| e.visitor_id == visitor_id && e.status == QueueStatus::Waiting);
        match tables.visitors.get_mut(&visitor_id) {
            Some(v) if v.service_status == ServiceStatus::Queued && !still_waiting => {
                v.service_status = to;
                v.assigned_staff_id = None;
                v.ai_enabled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn create_entry(&self, entry: &WaitingQueueEntry) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let duplicate = tables
            .queue
            .iter()
            .any(|e| e.visitor_id == entry.visitor_id && e.status == QueueStatus::Waiting);
        if duplicate {
            return Ok(false);
        }
        tables.queue.push(entry.clone());
        Ok(true)
    }

    async fn find_entry(
        &self,
        project_id: Uuid,
        entry_id: Uuid,
    ) -> Result<Option<WaitingQueueEntry>> {
        Ok(self
            .tables
            .read()
            .await
            .queue
            .iter()
            .find(|e| e.id == entry_id && e.project_id == project_id)
            .cloned())
    }

    async fn find_waiting_by_visitor(
        &self,
        project_id: Uuid,
        visitor_id: Uuid,
    ) -> Result<Option<WaitingQueueEntry>> {
        Ok(self
            .tables
            .read()
            .await
            .queue
            .iter()
            .find(|e| {
                e.project_id == project_id
                    && e.visitor_id == visitor_id
                    && e.status == QueueStatus::Waiting
            })
            .cloned())
    }

    async fn position(&self, project_id: Uuid, entry_id: Uuid) -> Result<Option<i64>> {
        let tables = self.tables.read().await;
        let Some(entry) = tables
            .queue
            .iter()
            .find(|e| e.id == entry_id && e.project_id == project_id)
        else {
            return Ok(None);
        };
        let ahead = tables
            .queue
            .iter()
            .filter(|other| {
                other.id != entry.id
                    && other.project_id == project_id
                    && other.status == QueueStatus::Waiting
                    && other.served_before(entry)
            })
            .count() as i64;
        Ok(Some(ahead + 1))
    }

    async fn assign_entry(
        &self,
        project_id: Uuid,
        entry_id: Uuid,
        staff_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables
            .queue
            .iter_mut()
            .find(|e| e.id == entry_id && e.project_id == project_id)
        {
            entry.status = QueueStatus::Assigned;
            entry.assigned_to = Some(staff_id);
            entry.assigned_at = Some(at);
        }
        Ok(())
    }

    async fn mark_left(&self, project_id: Uuid, entry_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables
            .queue
            .iter_mut()
            .find(|e| e.id == entry_id && e.project_id == project_id)
        {
            Some(entry) if entry.status == QueueStatus::Waiting => {
                entry.status = QueueStatus::Left;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_waiting(
        &self,
        project_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WaitingQueueEntry>, i64)> {
        let tables = self.tables.read().await;
        let mut waiting = tables
            .queue
            .iter()
            .filter(|e| e.project_id == project_id && e.status == QueueStatus::Waiting)
            .cloned()
            .collect::<Vec<_>>();
        waiting.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.wait_started_at.cmp(&b.wait_started_at))
        });
        let total = waiting.len() as i64;
        let page = waiting
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn counts(&self, project_id: Uuid) -> Result<QueueCounts> {
        let tables = self.tables.read().await;
        let mut counts = QueueCounts::default();
        for entry in tables.queue.iter().filter(|e| e.project_id == project_id) {
            match entry.status {
                QueueStatus::Waiting => counts.waiting += 1,
                QueueStatus::Assigned => counts.assigned += 1,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn expired_waiting(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitingQueueEntry>> {
        let tables = self.tables.read().await;
        let mut expired = tables
            .queue
            .iter()
            .filter(|e| e.status == QueueStatus::Waiting && e.wait_started_at < older_than)
            .cloned()
            .collect::<Vec<_>>();
        expired.sort_by_key(|e| e.wait_started_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn mark_timeout(&self, entry_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.queue.iter_mut().find(|e| e.id == entry_id) {
            Some(entry) if entry.status == QueueStatus::Waiting => {
                entry.status = QueueStatus::Timeout;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl StaffDirectory for MemoryStore {
    async fn list_available(&self, project_id: Uuid) -> Result<Vec<Staff>> {
        Ok(self
            .tables
            .read()
            .await
            .staff
            .iter()
            .filter(|s| s.project_id == project_id && s.is_available())
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, staff_id: Uuid) -> Result<Option<Staff>> {
        Ok(self
            .tables
            .read()
            .await
            .staff
            .iter()
            .find(|s| s.id == staff_id)
            .cloned())
    }
}
