#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use handoff_server::{
    assignment::AssignmentEngine,
    bus::MessageBus,
    error::{HandoffError, Result},
    liveness::{MemoryLivenessCache, SessionManager},
    store::{MemoryStore, QueueStore, StaffDirectory},
    types::{QueueCounts, QueueStatus, ServiceStatus, Staff, Visitor, WaitingQueueEntry},
};
use tokio::sync::Notify;
use uuid::Uuid;

/// Holds a call in flight: the call signals `reached`, then waits for `release`.
#[derive(Default)]
pub struct Gate {
    pub reached: Notify,
    pub release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn pass(&self) {
        self.reached.notify_one();
        self.release.notified().await;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusCall {
    CreateChannel {
        channel_id: String,
        channel_type: u8,
        subscribers: Vec<String>,
    },
    AddSubscribers {
        channel_id: String,
        channel_type: u8,
        subscribers: Vec<String>,
    },
    RemoveSubscribers {
        channel_id: String,
        channel_type: u8,
        subscribers: Vec<String>,
    },
    Send {
        from_uid: String,
        channel_id: String,
        channel_type: u8,
        content: String,
    },
}

/// Message bus double that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingBus {
    calls: Mutex<Vec<BusCall>>,
    failing: AtomicBool,
    subscribe_gate: Mutex<Option<Arc<Gate>>>,
}

impl RecordingBus {
    pub fn calls(&self) -> Vec<BusCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<BusCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BusCall::Send { .. }))
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stalls the next `add_subscribers` call on `gate`.
    pub fn stall_subscribe(&self, gate: Arc<Gate>) {
        *self.subscribe_gate.lock().unwrap() = Some(gate);
    }

    fn record(&self, call: BusCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.failing.load(Ordering::SeqCst) {
            return Err(HandoffError::upstream("message bus", "bus is down"));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn create_or_update_channel(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()> {
        self.record(BusCall::CreateChannel {
            channel_id: channel_id.to_string(),
            channel_type,
            subscribers: subscribers.to_vec(),
        })
    }

    async fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()> {
        let gate = self.subscribe_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.record(BusCall::AddSubscribers {
            channel_id: channel_id.to_string(),
            channel_type,
            subscribers: subscribers.to_vec(),
        })
    }

    async fn remove_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        subscribers: &[String],
    ) -> Result<()> {
        self.record(BusCall::RemoveSubscribers {
            channel_id: channel_id.to_string(),
            channel_type,
            subscribers: subscribers.to_vec(),
        })
    }

    async fn send_text_message(
        &self,
        from_uid: &str,
        channel_id: &str,
        channel_type: u8,
        content: &str,
    ) -> Result<()> {
        self.record(BusCall::Send {
            from_uid: from_uid.to_string(),
            channel_id: channel_id.to_string(),
            channel_type,
            content: content.to_string(),
        })
    }
}

/// Staff directory whose every lookup fails.
pub struct UnreachableDirectory;

#[async_trait]
impl StaffDirectory for UnreachableDirectory {
    async fn list_available(&self, _project_id: Uuid) -> Result<Vec<Staff>> {
        Err(HandoffError::upstream("staff directory", "connection refused"))
    }

    async fn get_by_id(&self, _staff_id: Uuid) -> Result<Option<Staff>> {
        Err(HandoffError::upstream("staff directory", "connection refused"))
    }
}

/// Queue store over a [`MemoryStore`] that can hold the caller right after a
/// timeout is written, or fail entry assignment.
pub struct ScriptedQueue {
    inner: Arc<MemoryStore>,
    timeout_gate: Mutex<Option<Arc<Gate>>>,
    fail_assign: AtomicBool,
}

impl ScriptedQueue {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            timeout_gate: Mutex::new(None),
            fail_assign: AtomicBool::new(false),
        }
    }

    pub fn pause_after_timeout(&self, gate: Arc<Gate>) {
        *self.timeout_gate.lock().unwrap() = Some(gate);
    }

    pub fn fail_assign(&self) {
        self.fail_assign.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl QueueStore for ScriptedQueue {
    async fn create_entry(&self, entry: &WaitingQueueEntry) -> Result<bool> {
        self.inner.create_entry(entry).await
    }

    async fn find_entry(
        &self,
        project_id: Uuid,
        entry_id: Uuid,
    ) -> Result<Option<WaitingQueueEntry>> {
        self.inner.find_entry(project_id, entry_id).await
    }

    async fn find_waiting_by_visitor(
        &self,
        project_id: Uuid,
        visitor_id: Uuid,
    ) -> Result<Option<WaitingQueueEntry>> {
        self.inner.find_waiting_by_visitor(project_id, visitor_id).await
    }

    async fn position(&self, project_id: Uuid, entry_id: Uuid) -> Result<Option<i64>> {
        self.inner.position(project_id, entry_id).await
    }

    async fn assign_entry(
        &self,
        project_id: Uuid,
        entry_id: Uuid,
        staff_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.fail_assign.load(Ordering::SeqCst) {
            return Err(HandoffError::upstream("database", "connection reset"));
        }
        self.inner.assign_entry(project_id, entry_id, staff_id, at).await
    }

    async fn mark_left(&self, project_id: Uuid, entry_id: Uuid) -> Result<bool> {
        self.inner.mark_left(project_id, entry_id).await
    }

    async fn list_waiting(
        &self,
        project_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WaitingQueueEntry>, i64)> {
        self.inner.list_waiting(project_id, limit, offset).await
    }

    async fn counts(&self, project_id: Uuid) -> Result<QueueCounts> {
        self.inner.counts(project_id).await
    }

    async fn expired_waiting(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WaitingQueueEntry>> {
        self.inner.expired_waiting(older_than, limit).await
    }

    async fn mark_timeout(&self, entry_id: Uuid) -> Result<bool> {
        let marked = self.inner.mark_timeout(entry_id).await?;
        let gate = self.timeout_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Ok(marked)
    }
}

pub const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

pub struct Harness {
    pub project: Uuid,
    pub store: Arc<MemoryStore>,
    pub bus: Arc<RecordingBus>,
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<AssignmentEngine>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_directory(store.clone(), store)
    }

    pub fn with_directory(store: Arc<MemoryStore>, directory: Arc<dyn StaffDirectory>) -> Self {
        Self::build(store.clone(), store.clone(), directory)
    }

    /// Engine whose queue writes go through `queue` instead of the store.
    pub fn with_queue(store: Arc<MemoryStore>, queue: Arc<dyn QueueStore>) -> Self {
        Self::build(store.clone(), queue, store)
    }

    fn build(
        store: Arc<MemoryStore>,
        queue: Arc<dyn QueueStore>,
        directory: Arc<dyn StaffDirectory>,
    ) -> Self {
        let bus = Arc::new(RecordingBus::default());
        let sessions = Arc::new(SessionManager::new(
            Arc::new(MemoryLivenessCache::new()),
            SESSION_TTL,
        ));
        let engine = AssignmentEngine::new(store.clone(), queue, directory, bus.clone())
            .with_sessions(Some(sessions.clone()));
        Self {
            project: Uuid::new_v4(),
            store,
            bus,
            sessions,
            engine: Arc::new(engine),
        }
    }

    pub async fn add_staff(&self, nickname: &str) -> Staff {
        let staff = Staff {
            id: Uuid::new_v4(),
            project_id: self.project,
            username: format!("{}-user", nickname.to_lowercase()),
            nickname: nickname.to_string(),
            is_active: true,
            service_paused: false,
        };
        self.store.insert_staff(staff.clone()).await;
        staff
    }

    pub async fn add_visitor(&self) -> Visitor {
        let mut visitor = Visitor::new(self.project);
        visitor.external_id = format!("ext_{}", visitor.id.simple());
        self.store.insert_visitor(visitor.clone()).await;
        visitor
    }

    pub async fn visitor(&self, id: Uuid) -> Visitor {
        self.store.visitor(id).await.expect("visitor exists")
    }

    /// Checks the visitor-record invariants over every stored visitor.
    pub async fn assert_invariants(&self) {
        for v in self.store.visitors().await {
            assert_eq!(
                v.assigned_staff_id.is_some(),
                v.service_status == ServiceStatus::Active,
                "staff assignment must match active status: {v:?}"
            );
            if matches!(
                v.service_status,
                ServiceStatus::Queued | ServiceStatus::Active
            ) {
                assert!(!v.ai_enabled, "AI must be off while queued or served: {v:?}");
            }
        }
        for v in self.store.visitors().await {
            let waiting = self
                .store
                .entries_for_visitor(v.id)
                .await
                .into_iter()
                .filter(|e| e.status == QueueStatus::Waiting)
                .count();
            assert!(waiting <= 1, "visitor {} has {waiting} waiting entries", v.id);
        }
    }
}
