use crate::date::DateParseError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no state for mailbox {0}")]
    NotFound(String),
    /// Another writer committed first on every attempt.
    #[error("update conflict on mailbox {0}")]
    Conflict(String),
    #[error("corrupt state for mailbox {address}: {reason}")]
    Corrupt { address: String, reason: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("mailbox {0} has no stored credential")]
    NotAuthorized(String),
    #[error(transparent)]
    Date(#[from] DateParseError),
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}
