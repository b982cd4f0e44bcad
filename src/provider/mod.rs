//! Mailbox provider capabilities.
//!
//! The engine talks to the provider only through [`MailProvider`], so it can
//! be driven by Gmail in production and by a scripted fake in tests.

mod gmail;
mod ratelimit;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::SyncError;
use crate::models::{Contact, LabelDelta, MailThread, MailboxState, ThreadPage};

pub use gmail::{GmailConnector, HttpsClient, https_client};
pub use ratelimit::RateLimiter;

#[async_trait]
pub trait MailProvider: Send + Sync {
    /// All of the owner's contacts with their starred flag.
    async fn list_contacts(&self) -> Result<Vec<Contact>>;

    /// One page of threads matching a provider search query.
    async fn list_threads(&self, query: &str, page_token: Option<&str>) -> Result<ThreadPage>;

    /// A thread with each message's `From` header, timestamp and labels.
    async fn get_thread(&self, thread_id: &str) -> Result<MailThread>;

    /// Applies a label delta. A "not modified" answer counts as success.
    async fn modify_thread(&self, thread_id: &str, delta: &LabelDelta) -> Result<()>;

    /// Returns the id of the user label called `name`, creating it if needed.
    async fn ensure_label(&self, name: &str) -> Result<String>;

    /// Creates or replaces the push subscription, returning its expiry.
    async fn watch(&self, topic: &str) -> Result<DateTime<Utc>>;

    /// Cancels the push subscription.
    async fn stop(&self) -> Result<()>;
}

/// Opens an authorized [`MailProvider`] session for one mailbox.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self, state: &MailboxState) -> Result<Arc<dyn MailProvider>, SyncError>;
}
