use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{Mutation, StateStore};
use crate::error::StoreError;
use crate::models::MailboxState;

/// In-memory implementation of [`StateStore`].
///
/// A single mutex serializes every update, so updates never conflict.
#[derive(Default)]
pub struct MemoryStateStore {
    mailboxes: Mutex<HashMap<String, MailboxState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MailboxState>> {
        self.mailboxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn list_where(&self, keep: impl Fn(&MailboxState) -> bool) -> Vec<MailboxState> {
        let mut found: Vec<MailboxState> = self.lock().values().filter(|s| keep(s)).cloned().collect();
        found.sort_by(|a, b| a.address.cmp(&b.address));
        found
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, address: &str) -> Result<MailboxState, StoreError> {
        self.lock()
            .get(address)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(address.to_string()))
    }

    async fn put(&self, state: &MailboxState) -> Result<(), StoreError> {
        self.lock().insert(state.address.clone(), state.clone());
        Ok(())
    }

    async fn update(&self, address: &str, mutate: Mutation<'_>) -> Result<MailboxState, StoreError> {
        let mut mailboxes = self.lock();
        let stored = mailboxes
            .get_mut(address)
            .ok_or_else(|| StoreError::NotFound(address.to_string()))?;

        let mut next = stored.clone();
        if mutate(&mut next) && next != *stored {
            *stored = next.clone();
        }
        Ok(next)
    }

    async fn list_expiring(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<MailboxState>, StoreError> {
        Ok(self.list_where(|s| {
            s.subscription_expiry
                .is_some_and(|expiry| expiry > after && expiry < before)
        }))
    }

    async fn list_idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<MailboxState>, StoreError> {
        Ok(self.list_where(|s| s.last_run.is_none_or(|run| run < cutoff)))
    }
}
