use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::error::SyncError;
use crate::scheduler::{Scheduler, SignalOutcome};
use crate::store::StateStore;
use crate::subscription::SubscriptionManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub renewed: usize,
    pub renew_failed: usize,
    pub queued: usize,
    /// Idle mailboxes that got no task (disabled, gone, or absorbed).
    pub skipped: usize,
    pub queue_failed: usize,
}

/// Periodic maintenance: renews subscriptions close to expiry, then queues
/// a catch-up pass for every mailbox that has not had a pass recently, in
/// case its push notifications stopped arriving.
pub struct Sweeper {
    store: Arc<dyn StateStore>,
    subscriptions: Arc<SubscriptionManager>,
    scheduler: Arc<Scheduler>,
    stale_after: Duration,
}

impl Sweeper {
    pub fn new(
        store: Arc<dyn StateStore>,
        subscriptions: Arc<SubscriptionManager>,
        scheduler: Arc<Scheduler>,
        stale_after: Duration,
    ) -> Self {
        Self {
            store,
            subscriptions,
            scheduler,
            stale_after,
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepSummary, SyncError> {
        let renewal = self.subscriptions.renew_expiring(now).await?;
        let mut summary = SweepSummary {
            renewed: renewal.renewed,
            renew_failed: renewal.failed,
            ..SweepSummary::default()
        };

        for state in self.store.list_idle_since(now - self.stale_after).await? {
            match self.scheduler.signal_at(now, &state.address, None, true).await {
                Ok(SignalOutcome::Scheduled { .. } | SignalOutcome::Folded { .. }) => {
                    tracing::info!(address = %state.address, "Queued catch-up update");
                    summary.queued += 1;
                }
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        address = %state.address,
                        error = %format!("{:#}", e),
                        "Failed to queue catch-up update"
                    );
                    summary.queue_failed += 1;
                }
            }
        }

        tracing::info!(
            renewed = summary.renewed,
            renew_failed = summary.renew_failed,
            queued = summary.queued,
            skipped = summary.skipped,
            queue_failed = summary.queue_failed,
            "Sweep complete"
        );
        Ok(summary)
    }
}
