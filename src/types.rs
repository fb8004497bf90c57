use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    assignment::AssignmentEngine, config::HandoffConfig, liveness::SessionManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    New,
    Queued,
    Active,
    Closed,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "queued" => Some(Self::Queued),
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Waiting,
    Assigned,
    Timeout,
    Left,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Assigned => "assigned",
            Self::Timeout => "timeout",
            Self::Left => "left",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "waiting" => Some(Self::Waiting),
            "assigned" => Some(Self::Assigned),
            "timeout" => Some(Self::Timeout),
            "left" => Some(Self::Left),
            _ => None,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation participant whose ownership moves between AI and staff.
///
/// `assigned_staff_id` is set exactly when `service_status` is `Active`, and
/// AI stays off while the visitor is queued or served by a human. The
/// transition helpers below are the only writers of those three fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visitor {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Channel the visitor's own client listens on; used for out-of-band notices.
    #[serde(default)]
    pub external_id: String,
    pub service_status: ServiceStatus,
    pub assigned_staff_id: Option<Uuid>,
    pub ai_enabled: bool,
}

impl Visitor {
    pub fn new(project_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            external_id: String::new(),
            service_status: ServiceStatus::New,
            assigned_staff_id: None,
            ai_enabled: true,
        }
    }

    pub fn assign_to(&mut self, staff_id: Uuid, ai_enabled: bool) {
        self.service_status = ServiceStatus::Active;
        self.assigned_staff_id = Some(staff_id);
        self.ai_enabled = ai_enabled;
    }

    pub fn mark_queued(&mut self) {
        self.service_status = ServiceStatus::Queued;
        self.assigned_staff_id = None;
        self.ai_enabled = false;
    }

    pub fn close(&mut self) {
        self.service_status = ServiceStatus::Closed;
        self.assigned_staff_id = None;
        self.ai_enabled = true;
    }

    pub fn reset_to_ai(&mut self) {
        self.service_status = ServiceStatus::New;
        self.assigned_staff_id = None;
        self.ai_enabled = true;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingQueueEntry {
    pub id: Uuid,
    pub project_id: Uuid,
    pub visitor_id: Uuid,
    pub channel_id: String,
    pub status: QueueStatus,
    pub priority: i32,
    #[serde(default)]
    pub source: String,
    pub wait_started_at: DateTime<Utc>,
    pub assigned_to: Option<Uuid>,
    pub assigned_at: Option<DateTime<Utc>>,
}

impl WaitingQueueEntry {
    pub fn waiting(
        project_id: Uuid,
        visitor_id: Uuid,
        source: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            visitor_id,
            channel_id: crate::bus::visitor_channel_id(visitor_id),
            status: QueueStatus::Waiting,
            priority: 0,
            source: source.to_string(),
            wait_started_at: started_at,
            assigned_to: None,
            assigned_at: None,
        }
    }

    /// True when `self` is served before `other` under queue ordering
    /// (`priority DESC, wait_started_at ASC`).
    pub fn served_before(&self, other: &WaitingQueueEntry) -> bool {
        self.priority > other.priority
            || (self.priority == other.priority && self.wait_started_at < other.wait_started_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Staff {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub nickname: String,
    pub is_active: bool,
    pub service_paused: bool,
}

impl Staff {
    pub fn is_available(&self) -> bool {
        self.is_active && !self.service_paused
    }

    pub fn display_name(&self) -> &str {
        if !self.nickname.trim().is_empty() {
            &self.nickname
        } else if !self.username.trim().is_empty() {
            &self.username
        } else {
            "Support"
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub waiting: i64,
    pub assigned: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentSource {
    Manual,
    Transfer,
}

impl AssignmentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Transfer => "transfer",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub visitor_id: Uuid,
    pub project_id: Uuid,
    pub source: AssignmentSource,
    pub target_staff_id: Option<Uuid>,
    pub add_to_queue_if_no_staff: bool,
    pub ai_disabled: Option<bool>,
    /// Recorded as the queue entry's `source` when the visitor has to wait.
    pub reason: Option<String>,
}

impl TransferRequest {
    pub fn new(project_id: Uuid, visitor_id: Uuid) -> Self {
        Self {
            visitor_id,
            project_id,
            source: AssignmentSource::Transfer,
            target_staff_id: None,
            add_to_queue_if_no_staff: true,
            ai_disabled: None,
            reason: None,
        }
    }

    pub fn queue_source(&self) -> &str {
        self.reason
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(self.source.as_str())
    }
}

/// Structured outcome of a transfer; "no staff" is reported here, never as an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_staff_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting_queue: Option<WaitingQueueEntry>,
    pub message: String,
}

impl TransferResult {
    pub fn assigned(staff_id: Uuid) -> Self {
        Self {
            success: true,
            assigned_staff_id: Some(staff_id),
            queue_position: None,
            waiting_queue: None,
            message: "Transfer successful".to_string(),
        }
    }

    pub fn queued(entry: WaitingQueueEntry, position: i64) -> Self {
        Self {
            success: true,
            assigned_staff_id: None,
            queue_position: Some(position),
            waiting_queue: Some(entry),
            message: "Added to waiting queue".to_string(),
        }
    }

    pub fn no_staff() -> Self {
        Self {
            success: false,
            assigned_staff_id: None,
            queue_position: None,
            waiting_queue: None,
            message: "No available staff".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualServiceEventType {
    AlreadyTransferred,
    AlreadyQueued,
    TransferSuccess,
    Queued,
    NoStaff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualServiceOutcome {
    pub event_type: ManualServiceEventType,
    pub visitor_id: Uuid,
    pub channel_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_staff_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationOwner {
    Ai,
    Staff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundOutcome {
    pub handled_by: ConversationOwner,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_service: Option<ManualServiceOutcome>,
}

/// Events posted by the AI runtime, decoded once at the HTTP boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event_type")]
pub enum AiServiceEvent {
    #[serde(rename = "manual_service.request")]
    ManualServiceRequest {
        visitor_id: Uuid,
        #[serde(default)]
        payload: ManualServicePayload,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualServicePayload {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferBody {
    pub project_id: Uuid,
    pub visitor_id: Uuid,
    #[serde(default)]
    pub target_staff_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub add_to_queue_if_no_staff: bool,
    #[serde(default)]
    pub ai_disabled: Option<bool>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorMessageBody {
    pub text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionBody {
    #[serde(default)]
    pub closed_by_staff_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptQueueBody {
    pub staff_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct QueueListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub struct AppState {
    pub engine: Arc<AssignmentEngine>,
    pub sessions: Option<Arc<SessionManager>>,
    pub config: HandoffConfig,
}
