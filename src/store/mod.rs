//! Mailbox state persistence.
//!
//! The engine only needs a per-key transactional read-modify-write store.
//! [`MemoryStateStore`] serves tests and throwaway runs; [`SqliteStateStore`]
//! persists state across restarts.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::MailboxState;

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

/// Attempts made by an optimistic update before reporting a conflict.
pub const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Mutation applied inside [`StateStore::update`].
///
/// It receives a fresh copy of the stored record and returns `true` to
/// commit its changes or `false` to leave the record untouched. It may run
/// more than once when a concurrent writer commits first, so it must derive
/// its result only from the record it is handed.
pub type Mutation<'a> = &'a mut (dyn FnMut(&mut MailboxState) -> bool + Send);

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, address: &str) -> Result<MailboxState, StoreError>;

    /// Insert or replace a record unconditionally.
    async fn put(&self, state: &MailboxState) -> Result<(), StoreError>;

    /// Read, mutate and write back the record for `address`, retrying on
    /// conflict up to [`MAX_UPDATE_ATTEMPTS`] times. Returns the record as
    /// last seen by the mutation.
    async fn update(&self, address: &str, mutate: Mutation<'_>) -> Result<MailboxState, StoreError>;

    /// Mailboxes whose subscription expires strictly between `after` and `before`.
    async fn list_expiring(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
    ) -> Result<Vec<MailboxState>, StoreError>;

    /// Mailboxes with no pass started since `cutoff`, including those that never ran.
    async fn list_idle_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<MailboxState>, StoreError>;
}
