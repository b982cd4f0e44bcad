//! One synchronization pass over a mailbox.
//!
//! A pass takes the mailbox lease, records its start, loads the owner's
//! contacts, pages through the threads changed since the watermark and
//! relabels them, advancing the watermark after every page. The lease is
//! released on every exit path, including an expired deadline and a pass
//! dropped by its caller.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{EngineConfig, ProviderConfig};
use crate::date::day_query;
use crate::error::{StoreError, SyncError};
use crate::lease::{LeaseManager, LeaseOutcome};
use crate::metrics::Counters;
use crate::models::{ContactLists, MailboxState, ManagedLabels, SyncTask};
use crate::provider::{MailProvider, ProviderConnector};
use crate::queue::TaskHandler;
use crate::reconcile::sync_thread;
use crate::store::StateStore;
use crate::subscription::SubscriptionManager;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub pages: usize,
    pub threads: usize,
    pub relabelled: usize,
    pub watermark: Option<DateTime<Utc>>,
    /// The subscription was renewed because a catch-up pass found work.
    pub renewed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// Another pass holds the mailbox.
    LeaseDenied,
    DeadlineExceeded,
    UnknownMailbox,
}

pub struct SyncDriver {
    store: Arc<dyn StateStore>,
    connector: Arc<dyn ProviderConnector>,
    subscriptions: Arc<SubscriptionManager>,
    leases: LeaseManager,
    counters: Arc<Counters>,
    debounce: Duration,
    overlap: Duration,
    backlog: Duration,
    deadline: std::time::Duration,
    contact_label: String,
    starred_label: String,
}

impl SyncDriver {
    pub fn new(
        store: Arc<dyn StateStore>,
        connector: Arc<dyn ProviderConnector>,
        subscriptions: Arc<SubscriptionManager>,
        counters: Arc<Counters>,
        engine: &EngineConfig,
        provider: &ProviderConfig,
    ) -> Self {
        Self {
            leases: LeaseManager::new(store.clone(), engine.lease_ttl()),
            store,
            connector,
            subscriptions,
            counters,
            debounce: engine.debounce(),
            overlap: engine.overlap(),
            backlog: engine.backlog(),
            deadline: engine.pass_deadline(),
            contact_label: provider.contact_label.clone(),
            starred_label: provider.starred_label.clone(),
        }
    }

    #[cfg(test)]
    pub fn with_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Runs one pass for `task`. Lease contention, an unknown mailbox and an
    /// expired deadline end the pass without an error.
    #[tracing::instrument(skip(self, task), fields(address = %task.address, catchup = task.catchup))]
    pub async fn run(&self, task: &SyncTask) -> Result<PassOutcome, SyncError> {
        let now = Utc::now();
        let lease = match self.leases.acquire(&task.address, now).await {
            Ok(LeaseOutcome::Granted { until }) => {
                tracing::debug!(%until, "Lease acquired");
                self.leases.guard(&task.address)
            }
            Ok(LeaseOutcome::AlreadyHeld { until }) => {
                tracing::info!(?until, "Mailbox is leased by another pass, skipping");
                Counters::incr(&self.counters.lease_collisions);
                return Ok(PassOutcome::LeaseDenied);
            }
            Err(StoreError::NotFound(_)) => {
                tracing::debug!("No state for mailbox, skipping");
                return Ok(PassOutcome::UnknownMailbox);
            }
            Err(e) => return Err(e.into()),
        };

        Counters::incr(&self.counters.passes);
        let started = Instant::now();
        let result = tokio::time::timeout(self.deadline, self.run_leased(task, now)).await;

        if let Err(e) = lease.release().await {
            tracing::warn!(error = %e, "Failed to release lease, it will expire on its own");
        }
        Counters::add(&self.counters.pass_millis, started.elapsed().as_millis() as u64);

        match result {
            Ok(Ok(report)) => {
                tracing::info!(
                    pages = report.pages,
                    threads = report.threads,
                    relabelled = report.relabelled,
                    watermark = ?report.watermark,
                    renewed = report.renewed,
                    "Pass complete"
                );
                Ok(PassOutcome::Completed(report))
            }
            Ok(Err(e)) => {
                Counters::incr(&self.counters.pass_errors);
                Err(e)
            }
            Err(_) => {
                tracing::warn!(deadline = ?self.deadline, "Pass deadline exceeded");
                Counters::incr(&self.counters.pass_deadlines);
                Ok(PassOutcome::DeadlineExceeded)
            }
        }
    }

    async fn run_leased(&self, task: &SyncTask, now: DateTime<Utc>) -> Result<PassReport, SyncError> {
        let address = task.address.as_str();
        let floor = now + self.debounce;
        let state = self
            .store
            .update(address, &mut |s| {
                s.last_run = Some(now);
                if s.no_runs_before.is_none_or(|t| t < floor) {
                    s.no_runs_before = Some(floor);
                }
                true
            })
            .await?;

        let provider = self.connector.connect(&state).await?;
        let contacts = ContactLists::partition(
            provider
                .list_contacts()
                .await
                .context("Failed to list contacts")?,
        );
        tracing::debug!(
            starred = contacts.starred.len(),
            unstarred = contacts.unstarred.len(),
            "Loaded contacts"
        );
        let labels = self.ensure_labels(provider.as_ref(), &state).await?;
        let query = self.scan_query(&state, task.date, now);

        let mut report = PassReport {
            watermark: state.last_thread_time,
            ..PassReport::default()
        };
        let mut page_token: Option<String> = None;
        loop {
            let page = provider
                .list_threads(&query, page_token.as_deref())
                .await
                .with_context(|| format!("Failed to list threads matching {:?}", query))?;
            report.pages += 1;

            let mut page_latest: Option<DateTime<Utc>> = None;
            for thread_id in &page.thread_ids {
                let outcome = sync_thread(provider.as_ref(), thread_id, &labels, &contacts).await?;
                report.threads += 1;
                if outcome.changed {
                    report.relabelled += 1;
                    Counters::incr(&self.counters.threads_relabelled);
                }
                page_latest = page_latest.max(outcome.latest);
            }

            if let Some(latest) = page_latest.filter(|t| report.watermark.is_none_or(|w| *t > w)) {
                self.advance_watermark(address, latest).await?;
                report.watermark = Some(latest);
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if task.catchup && report.relabelled > 0 {
            self.subscriptions.watch_with(provider.as_ref(), address).await?;
            tracing::info!("Renewed subscription after catch-up pass found changes");
            report.renewed = true;
        }
        Ok(report)
    }

    /// Returns the managed label ids, creating the labels on first use.
    async fn ensure_labels(
        &self,
        provider: &dyn MailProvider,
        state: &MailboxState,
    ) -> Result<ManagedLabels, SyncError> {
        if let Some(labels) = state.managed_labels() {
            return Ok(labels);
        }

        let contact = provider
            .ensure_label(&self.contact_label)
            .await
            .with_context(|| format!("Failed to create label {}", self.contact_label))?;
        let starred = provider
            .ensure_label(&self.starred_label)
            .await
            .with_context(|| format!("Failed to create label {}", self.starred_label))?;
        self.store
            .update(&state.address, &mut |s| {
                s.contact_label_id = Some(contact.clone());
                s.starred_label_id = Some(starred.clone());
                true
            })
            .await?;
        tracing::info!(contact = %contact, starred = %starred, "Created managed labels");
        Ok(ManagedLabels { starred, contact })
    }

    /// Provider search for the threads this pass must look at.
    fn scan_query(&self, state: &MailboxState, date: Option<NaiveDate>, now: DateTime<Utc>) -> String {
        let scope = if state.scan_all_mail { "-in:chats" } else { "in:inbox" };
        match date {
            Some(date) => format!("{} {}", scope, day_query(date)),
            None => {
                let oldest = now - self.backlog;
                let start = state
                    .last_thread_time
                    .map(|t| t - self.overlap)
                    .filter(|t| *t > oldest)
                    .unwrap_or(oldest);
                format!("{} after:{}", scope, start.timestamp())
            }
        }
    }

    /// Moves the watermark forward to `latest`, rechecking under the
    /// transaction so a concurrent pass can never move it backwards.
    async fn advance_watermark(&self, address: &str, latest: DateTime<Utc>) -> Result<(), SyncError> {
        let result = self
            .store
            .update(address, &mut |s| {
                if s.last_thread_time.is_none_or(|t| latest > t) {
                    s.last_thread_time = Some(latest);
                    true
                } else {
                    false
                }
            })
            .await;
        match result {
            Ok(_) => {
                tracing::debug!(watermark = %latest, "Advanced watermark");
                Ok(())
            }
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(watermark = %latest, "Watermark update lost to concurrent writers");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TaskHandler for SyncDriver {
    async fn handle(&self, task: &SyncTask) -> anyhow::Result<()> {
        match self.run(task).await {
            Ok(_) => Ok(()),
            // Redelivery cannot fix a mailbox that lost its credential.
            Err(SyncError::NotAuthorized(address)) => {
                tracing::warn!(address = %address, "Mailbox is not authorized, dropping task");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("Update pass failed for {}", task.address))),
        }
    }
}
