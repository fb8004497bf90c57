//! Periodic eviction of queue entries that have waited too long.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::QueueConfig,
    error::{HandoffError, Result},
    store::{QueueStore, VisitorStore},
    types::{ServiceStatus, WaitingQueueEntry},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub timed_out: usize,
    pub visitors_closed: usize,
    pub failed: usize,
}

pub struct QueueSweeper {
    visitors: Arc<dyn VisitorStore>,
    queue: Arc<dyn QueueStore>,
    config: QueueConfig,
}

impl QueueSweeper {
    pub fn new(
        visitors: Arc<dyn VisitorStore>,
        queue: Arc<dyn QueueStore>,
        config: QueueConfig,
    ) -> Self {
        Self {
            visitors,
            queue,
            config,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Times out one batch of entries that started waiting before
    /// `now - expiry`. A failing entry is logged and skipped.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expiry = chrono::Duration::from_std(self.config.expiry)
            .map_err(|e| HandoffError::Config(format!("queue expiry out of range: {e}")))?;
        let expired = self
            .queue
            .expired_waiting(now - expiry, self.config.sweep_batch)
            .await?;

        let mut report = SweepReport {
            scanned: expired.len(),
            ..SweepReport::default()
        };
        for entry in &expired {
            match self.evict(entry).await {
                Ok((timed_out, closed)) => {
                    report.timed_out += usize::from(timed_out);
                    report.visitors_closed += usize::from(closed);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(entry_id = %entry.id, visitor_id = %entry.visitor_id, error = %e, "failed to expire queue entry");
                }
            }
        }
        Ok(report)
    }

    async fn evict(&self, entry: &WaitingQueueEntry) -> Result<(bool, bool)> {
        if !self.queue.mark_timeout(entry.id).await? {
            // Assigned or left since the batch was read.
            return Ok((false, false));
        }
        let closed = self
            .visitors
            .release_if_queued(entry.visitor_id, ServiceStatus::Closed)
            .await?;
        Ok((true, closed))
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            expiry_secs = self.config.expiry.as_secs(),
            "queue sweeper started"
        );
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.scanned == 0 => debug!("queue sweep found nothing to expire"),
                        Ok(report) => info!(
                            scanned = report.scanned,
                            timed_out = report.timed_out,
                            visitors_closed = report.visitors_closed,
                            failed = report.failed,
                            "queue sweep finished"
                        ),
                        Err(e) => warn!(error = %e, "queue sweep failed"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("queue sweeper shutting down");
                    break;
                }
            }
        }
    }
}
