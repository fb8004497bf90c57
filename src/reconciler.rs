//! Detects human sessions whose liveness key lapsed and hands the visitor
//! back to the AI.
//!
//! The liveness cache never announces expiry, so this loop polls every
//! `active` visitor. The reset is a conditional write; a visitor that moved
//! on between the read and the write is left untouched.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::{MessageBus, CUSTOMER_SERVICE_CHANNEL_TYPE, SYSTEM_UID},
    error::Result,
    liveness::SessionManager,
    notices::{self, Notice},
    store::VisitorStore,
    types::{ServiceStatus, Visitor},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub reset: usize,
    pub notified: usize,
    pub failed: usize,
}

pub struct SessionReconciler {
    visitors: Arc<dyn VisitorStore>,
    sessions: Arc<SessionManager>,
    bus: Arc<dyn MessageBus>,
    interval: Duration,
}

impl SessionReconciler {
    pub fn new(
        visitors: Arc<dyn VisitorStore>,
        sessions: Arc<SessionManager>,
        bus: Arc<dyn MessageBus>,
        interval: Duration,
    ) -> Self {
        Self {
            visitors,
            sessions,
            bus,
            interval,
        }
    }

    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let active = self
            .visitors
            .list_by_service_status(ServiceStatus::Active)
            .await?;

        let mut report = ReconcileReport {
            checked: active.len(),
            ..ReconcileReport::default()
        };
        for visitor in &active {
            // AI already answers this visitor; nothing to hand back.
            if visitor.ai_enabled {
                continue;
            }
            match self.sessions.is_live(visitor.id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    // Unknown liveness is not expiry.
                    report.failed += 1;
                    warn!(visitor_id = %visitor.id, error = %e, "liveness check failed");
                    continue;
                }
            }

            match self.visitors.reset_to_ai_if_human(visitor.id).await {
                Ok(true) => {
                    report.reset += 1;
                    info!(visitor_id = %visitor.id, staff_id = ?visitor.assigned_staff_id, "human session expired, visitor returned to AI");
                    if self.notify_timeout(visitor).await {
                        report.notified += 1;
                    }
                }
                Ok(false) => debug!(visitor_id = %visitor.id, "visitor changed state before reset"),
                Err(e) => {
                    report.failed += 1;
                    warn!(visitor_id = %visitor.id, error = %e, "failed to reset visitor to AI mode");
                }
            }
        }
        Ok(report)
    }

    async fn notify_timeout(&self, visitor: &Visitor) -> bool {
        if visitor.external_id.is_empty() {
            debug!(visitor_id = %visitor.id, "visitor has no external channel, skipping timeout notice");
            return false;
        }
        let text = notices::render(&Notice::SessionTimeout);
        match self
            .bus
            .send_text_message(
                SYSTEM_UID,
                &visitor.external_id,
                CUSTOMER_SERVICE_CHANNEL_TYPE,
                &text,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(visitor_id = %visitor.id, error = %e, "failed to send session timeout notice");
                false
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            ttl_secs = self.sessions.ttl().as_secs(),
            "session reconciler started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconcile_once().await {
                        Ok(report) if report.reset == 0 && report.failed == 0 => {
                            debug!(checked = report.checked, "session reconcile found no drift");
                        }
                        Ok(report) => info!(
                            checked = report.checked,
                            reset = report.reset,
                            notified = report.notified,
                            failed = report.failed,
                            "session reconcile finished"
                        ),
                        Err(e) => warn!(error = %e, "session reconcile failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("session reconciler shutting down");
                    break;
                }
            }
        }
    }
}
