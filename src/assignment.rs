//! Assignment engine: moves visitor conversations between AI, the waiting
//! queue and staff members.
//!
//! A hand-off starts its liveness session, then writes durable state. Bus
//! calls, queue bookkeeping and visitor notices that follow are best-effort
//! and never roll the write back.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    bus::{
        staff_uid, visitor_channel_id, visitor_uid, MessageBus, CUSTOMER_SERVICE_CHANNEL_TYPE,
        SYSTEM_UID,
    },
    error::{HandoffError, Result},
    liveness::SessionManager,
    notices::{self, Notice},
    store::{QueueStore, StaffDirectory, VisitorStore},
    types::{
        AssignmentSource, ConversationOwner, InboundOutcome, ManualServiceEventType,
        ManualServiceOutcome, QueueCounts, QueueStatus, ServiceStatus, Staff, TransferRequest,
        TransferResult, Visitor, WaitingQueueEntry,
    },
};

const HANDOVER_KEYWORDS: &[&str] = &[
    "human",
    "agent",
    "real person",
    "representative",
    "转人工",
    "人工客服",
];

/// True when a visitor message asks for a human.
pub fn has_handover_intent(text: &str) -> bool {
    let lowered = text.to_lowercase();
    HANDOVER_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// One async mutex per visitor id. Slots nobody holds or waits on are pruned
/// on the next acquire.
#[derive(Default)]
struct VisitorLocks {
    slots: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl VisitorLocks {
    async fn acquire(&self, visitor_id: Uuid) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(visitor_id).or_default().clone()
        };
        slot.lock_owned().await
    }
}

pub struct AssignmentEngine {
    visitors: Arc<dyn VisitorStore>,
    queue: Arc<dyn QueueStore>,
    staff: Arc<dyn StaffDirectory>,
    bus: Arc<dyn MessageBus>,
    sessions: Option<Arc<SessionManager>>,
    locks: VisitorLocks,
}

impl AssignmentEngine {
    pub fn new(
        visitors: Arc<dyn VisitorStore>,
        queue: Arc<dyn QueueStore>,
        staff: Arc<dyn StaffDirectory>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            visitors,
            queue,
            staff,
            bus,
            sessions: None,
            locks: VisitorLocks::default(),
        }
    }

    /// Without a session manager, hand-offs never time out.
    pub fn with_sessions(mut self, sessions: Option<Arc<SessionManager>>) -> Self {
        self.sessions = sessions;
        self
    }

    pub async fn transfer_to_staff(&self, req: TransferRequest) -> Result<TransferResult> {
        let _guard = self.locks.acquire(req.visitor_id).await;
        let visitor = self.load_visitor(req.project_id, req.visitor_id).await?;
        self.transfer_locked(visitor, &req).await
    }

    async fn transfer_locked(
        &self,
        mut visitor: Visitor,
        req: &TransferRequest,
    ) -> Result<TransferResult> {
        let Some(staff) = self.resolve_candidate(req).await else {
            if !req.add_to_queue_if_no_staff {
                info!(visitor_id = %visitor.id, "no staff available, not queueing");
                return Ok(TransferResult::no_staff());
            }
            let (entry, position) = self.enqueue_locked(&mut visitor, req.queue_source()).await?;
            return Ok(TransferResult::queued(entry, position));
        };

        // The liveness key goes in before the row turns active: the reconciler
        // reads an active row with no key as an expired session.
        let was_active = visitor.service_status == ServiceStatus::Active;
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.start_session(visitor.id, staff.id).await {
                warn!(visitor_id = %visitor.id, error = %e, "failed to start human session tracking");
            }
        }

        // AI stays off under a human unless the caller explicitly keeps it on.
        let ai_enabled = !req.ai_disabled.unwrap_or(true);
        visitor.assign_to(staff.id, ai_enabled);
        if let Err(e) = self.visitors.save_service_state(&visitor).await {
            if !was_active {
                if let Some(sessions) = &self.sessions {
                    let _ = sessions.end_session(visitor.id).await;
                }
            }
            return Err(e);
        }

        let channel_id = visitor_channel_id(visitor.id);
        if let Err(e) = self
            .bus
            .add_subscribers(
                &channel_id,
                CUSTOMER_SERVICE_CHANNEL_TYPE,
                &[staff_uid(staff.id)],
            )
            .await
        {
            warn!(visitor_id = %visitor.id, staff_id = %staff.id, error = %e, "failed to subscribe staff to visitor channel");
        }

        if let Err(e) = self.close_waiting_entry(req.project_id, visitor.id, staff.id).await {
            warn!(visitor_id = %visitor.id, error = %e, "failed to mark queue entry assigned");
        }

        info!(
            visitor_id = %visitor.id,
            staff_id = %staff.id,
            source = req.source.as_str(),
            "visitor transferred to staff"
        );
        Ok(TransferResult::assigned(staff.id))
    }

    async fn close_waiting_entry(
        &self,
        project_id: Uuid,
        visitor_id: Uuid,
        staff_id: Uuid,
    ) -> Result<()> {
        if let Some(entry) = self
            .queue
            .find_waiting_by_visitor(project_id, visitor_id)
            .await?
        {
            self.queue
                .assign_entry(project_id, entry.id, staff_id, Utc::now())
                .await?;
        }
        Ok(())
    }

    async fn resolve_candidate(&self, req: &TransferRequest) -> Option<Staff> {
        if let Some(target) = req.target_staff_id {
            return match self.staff.get_by_id(target).await {
                Ok(Some(staff)) if staff.is_available() && staff.project_id == req.project_id => {
                    Some(staff)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(staff_id = %target, error = %e, "staff lookup failed");
                    None
                }
            };
        }

        match self.staff.list_available(req.project_id).await {
            Ok(available) => available.into_iter().next(),
            Err(e) => {
                warn!(project_id = %req.project_id, error = %e, "staff directory unavailable");
                None
            }
        }
    }

    /// Puts the visitor in the waiting queue, or returns the entry it is
    /// already waiting in along with its current position.
    pub async fn enqueue(
        &self,
        project_id: Uuid,
        visitor_id: Uuid,
        source: &str,
    ) -> Result<(WaitingQueueEntry, i64)> {
        let _guard = self.locks.acquire(visitor_id).await;
        let mut visitor = self.load_visitor(project_id, visitor_id).await?;
        self.enqueue_locked(&mut visitor, source).await
    }

    async fn enqueue_locked(
        &self,
        visitor: &mut Visitor,
        source: &str,
    ) -> Result<(WaitingQueueEntry, i64)> {
        let project_id = visitor.project_id;
        let entry = match self
            .queue
            .find_waiting_by_visitor(project_id, visitor.id)
            .await?
        {
            Some(existing) => existing,
            None => {
                let fresh = WaitingQueueEntry::waiting(project_id, visitor.id, source, Utc::now());
                if self.queue.create_entry(&fresh).await? {
                    info!(visitor_id = %visitor.id, entry_id = %fresh.id, "visitor added to waiting queue");
                    fresh
                } else {
                    // Another writer queued this visitor between our read and insert.
                    self.queue
                        .find_waiting_by_visitor(project_id, visitor.id)
                        .await?
                        .ok_or_else(|| HandoffError::not_found("queue entry", visitor.id))?
                }
            }
        };

        if visitor.service_status != ServiceStatus::Queued || visitor.ai_enabled {
            visitor.mark_queued();
            self.visitors.save_service_state(visitor).await?;
        }

        let position = self.entry_position(project_id, entry.id).await?;
        Ok((entry, position))
    }

    pub async fn accept_from_queue(
        &self,
        project_id: Uuid,
        entry_id: Uuid,
        staff_id: Uuid,
    ) -> Result<TransferResult> {
        let entry = self.load_entry(project_id, entry_id).await?;
        let _guard = self.locks.acquire(entry.visitor_id).await;
        // Re-read under the lock; the sweeper or a leave may have won.
        let entry = self.load_entry(project_id, entry_id).await?;
        if entry.status != QueueStatus::Waiting {
            return Err(HandoffError::InvalidState(format!(
                "queue entry {entry_id} is {}",
                entry.status
            )));
        }

        let visitor = self.load_visitor(project_id, entry.visitor_id).await?;
        let req = TransferRequest {
            source: AssignmentSource::Manual,
            target_staff_id: Some(staff_id),
            add_to_queue_if_no_staff: false,
            ..TransferRequest::new(project_id, entry.visitor_id)
        };
        self.transfer_locked(visitor, &req).await
    }

    pub async fn leave_queue(&self, project_id: Uuid, entry_id: Uuid) -> Result<WaitingQueueEntry> {
        let entry = self.load_entry(project_id, entry_id).await?;
        let _guard = self.locks.acquire(entry.visitor_id).await;
        let mut entry = self.load_entry(project_id, entry_id).await?;
        // The sweeper does not take visitor locks, so the write re-checks the status.
        if entry.status != QueueStatus::Waiting
            || !self.queue.mark_left(project_id, entry_id).await?
        {
            let entry = self.load_entry(project_id, entry_id).await?;
            return Err(HandoffError::InvalidState(format!(
                "queue entry {entry_id} is {}",
                entry.status
            )));
        }
        entry.status = QueueStatus::Left;
        self.visitors
            .release_if_queued(entry.visitor_id, ServiceStatus::New)
            .await?;

        info!(visitor_id = %entry.visitor_id, entry_id = %entry_id, "visitor left waiting queue");
        Ok(entry)
    }

    pub async fn close_session(
        &self,
        project_id: Uuid,
        visitor_id: Uuid,
        closed_by_staff_id: Option<Uuid>,
    ) -> Result<Visitor> {
        let _guard = self.locks.acquire(visitor_id).await;
        let mut visitor = self.load_visitor(project_id, visitor_id).await?;
        if visitor.service_status != ServiceStatus::Active {
            return Err(HandoffError::InvalidState(format!(
                "visitor {visitor_id} is {}, not active",
                visitor.service_status
            )));
        }

        let previous_staff = visitor.assigned_staff_id;
        visitor.close();
        self.visitors.save_service_state(&visitor).await?;

        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.end_session(visitor_id).await {
                warn!(visitor_id = %visitor_id, error = %e, "failed to end human session");
            }
        }

        let channel_id = visitor_channel_id(visitor_id);
        if let Some(staff_id) = previous_staff {
            if let Err(e) = self
                .bus
                .remove_subscribers(
                    &channel_id,
                    CUSTOMER_SERVICE_CHANNEL_TYPE,
                    &[staff_uid(staff_id)],
                )
                .await
            {
                warn!(visitor_id = %visitor_id, staff_id = %staff_id, error = %e, "failed to unsubscribe staff");
            }
        }

        let closer = match closed_by_staff_id.or(previous_staff) {
            Some(id) => self.staff.get_by_id(id).await.ok().flatten(),
            None => None,
        };
        let text = notices::render(&Notice::SessionClosed {
            staff_name: closer.as_ref().map(Staff::display_name),
        });
        self.notify(&channel_id, &text).await;

        info!(visitor_id = %visitor_id, closed_by = ?closed_by_staff_id, "human session closed");
        Ok(visitor)
    }

    /// Hand-off requested by the visitor or by the AI on the visitor's behalf.
    pub async fn request_manual_service(
        &self,
        visitor_id: Uuid,
        reason: Option<String>,
    ) -> Result<ManualServiceOutcome> {
        let _guard = self.locks.acquire(visitor_id).await;
        let visitor = self
            .visitors
            .find_visitor_by_id(visitor_id)
            .await?
            .ok_or_else(|| HandoffError::not_found("visitor", visitor_id))?;
        let channel_id = visitor_channel_id(visitor_id);
        let outcome = |event_type, message: &str| ManualServiceOutcome {
            event_type,
            visitor_id,
            channel_id: channel_id.clone(),
            message: message.to_string(),
            assigned_staff_id: None,
            queue_position: None,
        };

        match visitor.service_status {
            ServiceStatus::Active => {
                return Ok(ManualServiceOutcome {
                    assigned_staff_id: visitor.assigned_staff_id,
                    ..outcome(
                        ManualServiceEventType::AlreadyTransferred,
                        "Already connected to a staff member",
                    )
                });
            }
            ServiceStatus::Queued => {
                let position = match self
                    .queue
                    .find_waiting_by_visitor(visitor.project_id, visitor_id)
                    .await?
                {
                    Some(entry) => self.queue.position(visitor.project_id, entry.id).await?,
                    None => None,
                };
                return Ok(ManualServiceOutcome {
                    queue_position: position,
                    ..outcome(
                        ManualServiceEventType::AlreadyQueued,
                        "Already waiting in the queue",
                    )
                });
            }
            ServiceStatus::New | ServiceStatus::Closed => {}
        }

        if let Err(e) = self
            .bus
            .create_or_update_channel(
                &channel_id,
                CUSTOMER_SERVICE_CHANNEL_TYPE,
                &[visitor_uid(visitor_id)],
            )
            .await
        {
            warn!(visitor_id = %visitor_id, error = %e, "failed to prepare visitor channel");
        }

        let req = TransferRequest {
            source: AssignmentSource::Manual,
            reason,
            ..TransferRequest::new(visitor.project_id, visitor_id)
        };
        let result = self.transfer_locked(visitor, &req).await?;

        let outcome = if let Some(staff_id) = result.assigned_staff_id {
            let staff = self.staff.get_by_id(staff_id).await.ok().flatten();
            let staff_name = staff.as_ref().map(Staff::display_name).unwrap_or("Support");
            let text = notices::render(&Notice::Transferred { staff_name });
            self.notify(&channel_id, &text).await;
            ManualServiceOutcome {
                assigned_staff_id: Some(staff_id),
                ..outcome(ManualServiceEventType::TransferSuccess, &text)
            }
        } else if result.success {
            let text = notices::render(&Notice::Queued {
                position: result.queue_position,
            });
            self.notify(&channel_id, &text).await;
            ManualServiceOutcome {
                queue_position: result.queue_position,
                ..outcome(ManualServiceEventType::Queued, &text)
            }
        } else {
            outcome(ManualServiceEventType::NoStaff, &result.message)
        };
        Ok(outcome)
    }

    /// Runs for every inbound visitor message: hand-off keywords trigger a
    /// manual service request and a human-served visitor keeps its session alive.
    pub async fn on_visitor_message(
        &self,
        project_id: Uuid,
        visitor_id: Uuid,
        text: &str,
    ) -> Result<InboundOutcome> {
        self.load_visitor(project_id, visitor_id).await?;

        let manual_service = if has_handover_intent(text) {
            Some(
                self.request_manual_service(visitor_id, Some("visitor_request".to_string()))
                    .await?,
            )
        } else {
            None
        };

        let visitor = self.load_visitor(project_id, visitor_id).await?;
        if visitor.service_status == ServiceStatus::Active {
            if let Some(sessions) = &self.sessions {
                if let Err(e) = sessions.refresh_session(visitor_id).await {
                    warn!(visitor_id = %visitor_id, error = %e, "failed to refresh human session");
                }
            }
        }

        let handled_by = if visitor.ai_enabled {
            ConversationOwner::Ai
        } else {
            ConversationOwner::Staff
        };
        Ok(InboundOutcome {
            handled_by,
            manual_service,
        })
    }

    pub async fn queue_position(&self, project_id: Uuid, entry_id: Uuid) -> Result<i64> {
        let entry = self.load_entry(project_id, entry_id).await?;
        if entry.status != QueueStatus::Waiting {
            return Err(HandoffError::InvalidState(format!(
                "queue entry {entry_id} is {}",
                entry.status
            )));
        }
        self.entry_position(project_id, entry_id).await
    }

    pub async fn list_queue(
        &self,
        project_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<WaitingQueueEntry>, i64)> {
        self.queue.list_waiting(project_id, limit, offset).await
    }

    pub async fn queue_stats(&self, project_id: Uuid) -> Result<QueueCounts> {
        self.queue.counts(project_id).await
    }

    async fn entry_position(&self, project_id: Uuid, entry_id: Uuid) -> Result<i64> {
        self.queue
            .position(project_id, entry_id)
            .await?
            .ok_or_else(|| HandoffError::not_found("queue entry", entry_id))
    }

    async fn load_visitor(&self, project_id: Uuid, visitor_id: Uuid) -> Result<Visitor> {
        self.visitors
            .find_visitor(project_id, visitor_id)
            .await?
            .ok_or_else(|| HandoffError::not_found("visitor", visitor_id))
    }

    async fn load_entry(&self, project_id: Uuid, entry_id: Uuid) -> Result<WaitingQueueEntry> {
        self.queue
            .find_entry(project_id, entry_id)
            .await?
            .ok_or_else(|| HandoffError::not_found("queue entry", entry_id))
    }

    async fn notify(&self, channel_id: &str, text: &str) {
        if let Err(e) = self
            .bus
            .send_text_message(SYSTEM_UID, channel_id, CUSTOMER_SERVICE_CHANNEL_TYPE, text)
            .await
        {
            warn!(channel_id, error = %e, "failed to send visitor notice");
        }
    }
}
