use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, stream};
use std::sync::Arc;

use crate::error::SyncError;
use crate::provider::{MailProvider, ProviderConnector};
use crate::store::StateStore;

/// Renewals run concurrently up to this many mailboxes at a time.
const RENEW_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalSummary {
    pub renewed: usize,
    pub failed: usize,
}

/// Creates, renews and cancels provider push subscriptions, keeping each
/// mailbox's `subscription_expiry` in step with the provider.
pub struct SubscriptionManager {
    store: Arc<dyn StateStore>,
    connector: Arc<dyn ProviderConnector>,
    topic: String,
    window: Duration,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        connector: Arc<dyn ProviderConnector>,
        topic: impl Into<String>,
        window: Duration,
    ) -> Self {
        Self {
            store,
            connector,
            topic: topic.into(),
            window,
        }
    }

    /// Creates or replaces the subscription for `address` and records its expiry.
    #[tracing::instrument(skip(self))]
    pub async fn watch(&self, address: &str) -> Result<DateTime<Utc>, SyncError> {
        let state = self.store.get(address).await?;
        let provider = self.connector.connect(&state).await?;
        self.watch_with(provider.as_ref(), address).await
    }

    /// Like [`watch`](Self::watch), reusing a session the caller already holds.
    pub async fn watch_with(
        &self,
        provider: &dyn MailProvider,
        address: &str,
    ) -> Result<DateTime<Utc>, SyncError> {
        let expiry = provider
            .watch(&self.topic)
            .await
            .with_context(|| format!("Failed to watch mailbox {}", address))?;
        self.store
            .update(address, &mut |s| {
                s.subscription_expiry = Some(expiry);
                true
            })
            .await?;
        tracing::info!(address, expiry = %expiry, "Subscription renewed");
        Ok(expiry)
    }

    /// Cancels the subscription for `address`, which disables the mailbox.
    #[tracing::instrument(skip(self))]
    pub async fn unwatch(&self, address: &str) -> Result<(), SyncError> {
        let state = self.store.get(address).await?;
        let provider = self.connector.connect(&state).await?;
        provider
            .stop()
            .await
            .with_context(|| format!("Failed to stop watching mailbox {}", address))?;
        self.store
            .update(address, &mut |s| s.subscription_expiry.take().is_some())
            .await?;
        tracing::info!(address, "Subscription cancelled");
        Ok(())
    }

    /// Renews every subscription expiring within the renewal window around
    /// `now`. A failure for one mailbox is logged and does not stop the rest.
    pub async fn renew_expiring(&self, now: DateTime<Utc>) -> Result<RenewalSummary, SyncError> {
        let due = self
            .store
            .list_expiring(now - self.window, now + self.window)
            .await?;

        let results: Vec<bool> = stream::iter(due)
            .map(|state| async move {
                match self.watch(&state.address).await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::error!(
                            address = %state.address,
                            error = %format!("{:#}", e),
                            "Failed to renew subscription"
                        );
                        false
                    }
                }
            })
            .buffer_unordered(RENEW_CONCURRENCY)
            .collect()
            .await;

        let renewed = results.iter().filter(|ok| **ok).count();
        Ok(RenewalSummary {
            renewed,
            failed: results.len() - renewed,
        })
    }
}
