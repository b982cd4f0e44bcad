use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::error::StoreError;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// The caller holds the mailbox until `until`.
    Granted { until: DateTime<Utc> },
    /// Another pass holds the mailbox.
    AlreadyHeld { until: Option<DateTime<Utc>> },
}

#[cfg(test)]
impl LeaseOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LeaseOutcome::Granted { .. })
    }
}

/// Time-bounded exclusive access to a mailbox, stored in its `lease_expiry`.
pub struct LeaseManager {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn acquire(&self, address: &str, now: DateTime<Utc>) -> Result<LeaseOutcome, StoreError> {
        let until = now + self.ttl;
        let mut granted = false;
        let result = self
            .store
            .update(address, &mut |s| {
                granted = !s.lease_held_at(now);
                if granted {
                    s.lease_expiry = Some(until);
                }
                granted
            })
            .await;

        match result {
            Ok(_) if granted => Ok(LeaseOutcome::Granted { until }),
            Ok(state) => Ok(LeaseOutcome::AlreadyHeld {
                until: state.lease_expiry,
            }),
            // Losing every race means other passes are taking the lease.
            Err(StoreError::Conflict(_)) => Ok(LeaseOutcome::AlreadyHeld { until: None }),
            Err(e) => Err(e),
        }
    }

    /// Takes responsibility for releasing a granted lease on `address`.
    pub fn guard(&self, address: &str) -> LeaseGuard {
        LeaseGuard {
            store: self.store.clone(),
            address: address.to_string(),
            armed: true,
        }
    }
}

/// A granted lease. [`LeaseGuard::release`] clears it; dropping the guard
/// unreleased (a cancelled pass) clears it from a background task.
pub struct LeaseGuard {
    store: Arc<dyn StateStore>,
    address: String,
    armed: bool,
}

impl LeaseGuard {
    /// Clears the lease unconditionally.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.armed = false;
        clear_lease(self.store.as_ref(), &self.address).await
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let address = std::mem::take(&mut self.address);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match clear_lease(store.as_ref(), &address).await {
                        Ok(()) => tracing::debug!(address = %address, "Released lease of cancelled pass"),
                        Err(e) => tracing::warn!(
                            address = %address,
                            error = %e,
                            "Failed to release lease of cancelled pass, it will expire on its own"
                        ),
                    }
                });
            }
            Err(_) => tracing::warn!(address = %address, "No runtime to release lease, it will expire on its own"),
        }
    }
}

async fn clear_lease(store: &dyn StateStore, address: &str) -> Result<(), StoreError> {
    store
        .update(address, &mut |s| s.lease_expiry.take().is_some())
        .await?;
    Ok(())
}
