//! Debounced scheduling of synchronization passes.
//!
//! Signals for a mailbox are folded so that at most one task is queued per
//! debounce window. Each task is named by a hash of the mailbox and its
//! scheduled time, which lets the queue drop duplicates of a folded signal.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::error::{StoreError, SyncError};
use crate::models::SyncTask;
use crate::store::StateStore;

/// Bumped whenever the task name derivation changes, so old in-flight
/// names can never collide with new ones.
const TASK_NAME_VERSION: u8 = 1;

const ALPHABET: &[u8; 50] = b"0123456789bcdfghjklmnpqrstvwxyzBCDFGHJKLMNPQRSTVWX";

/// Length of a base-50 rendering of a 256-bit digest.
pub const TASK_NAME_LEN: usize = 46;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created,
    /// A task with this name is already known to the queue.
    AlreadyExists,
}

/// Destination of scheduled synchronization tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedules `task` to run at `at` under the idempotency key `name`.
    async fn enqueue(&self, name: &str, task: SyncTask, at: DateTime<Utc>) -> Result<EnqueueOutcome>;
}

/// Deterministic task name for a pass over `address` scheduled at `when`.
pub fn task_name(address: &str, when: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update([TASK_NAME_VERSION]);
    hasher.update(format!(
        "{} {}",
        address,
        when.to_rfc3339_opts(SecondsFormat::Nanos, true)
    ));
    encode_base50(&hasher.finalize())
}

fn encode_base50(bytes: &[u8]) -> String {
    let mut num = bytes.to_vec();
    let mut digits = Vec::with_capacity(TASK_NAME_LEN);
    while num.iter().any(|&b| b != 0) {
        let mut rem = 0u32;
        for byte in num.iter_mut() {
            let acc = (rem << 8) | u32::from(*byte);
            *byte = (acc / 50) as u8;
            rem = acc % 50;
        }
        digits.push(ALPHABET[rem as usize]);
    }
    digits.resize(digits.len().max(TASK_NAME_LEN), ALPHABET[0]);
    digits.iter().rev().map(|&d| d as char).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A new task was queued for `at`.
    Scheduled { at: DateTime<Utc> },
    /// The signal joined the task already queued for `at`.
    Folded { at: DateTime<Utc> },
    /// The mailbox has no active subscription.
    Disabled,
    UnknownMailbox,
    /// Concurrent signals won every write; theirs stands in for this one.
    Absorbed,
}

pub struct Scheduler {
    store: Arc<dyn StateStore>,
    queue: Arc<dyn TaskQueue>,
    debounce: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StateStore>, queue: Arc<dyn TaskQueue>, debounce: Duration) -> Self {
        Self {
            store,
            queue,
            debounce,
        }
    }

    pub async fn signal(
        &self,
        address: &str,
        date: Option<NaiveDate>,
        catchup: bool,
    ) -> Result<SignalOutcome, SyncError> {
        self.signal_at(Utc::now(), address, date, catchup).await
    }

    /// Schedules a pass for `address`. If `no_runs_before` lies in the future
    /// the pass is scheduled exactly then; otherwise it is scheduled now and
    /// further passes are held off for one debounce window.
    pub async fn signal_at(
        &self,
        now: DateTime<Utc>,
        address: &str,
        date: Option<NaiveDate>,
        catchup: bool,
    ) -> Result<SignalOutcome, SyncError> {
        let debounce = self.debounce;
        let mut when = now;
        let mut enabled = false;

        let result = self
            .store
            .update(address, &mut |s| {
                enabled = s.is_enabled();
                if !enabled {
                    return false;
                }
                match s.no_runs_before {
                    Some(not_before) if not_before > now => {
                        when = not_before;
                        false
                    }
                    _ => {
                        when = now;
                        s.no_runs_before = Some(now + debounce);
                        true
                    }
                }
            })
            .await;

        match result {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(address, "Ignoring signal for unknown mailbox");
                return Ok(SignalOutcome::UnknownMailbox);
            }
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(address, "Signal absorbed by a concurrent update");
                return Ok(SignalOutcome::Absorbed);
            }
            Err(e) => return Err(e.into()),
        }

        if !enabled {
            tracing::info!(address, "Not queueing update for disabled mailbox");
            return Ok(SignalOutcome::Disabled);
        }

        let name = task_name(address, when);
        let task = SyncTask {
            date,
            catchup,
            ..SyncTask::new(address)
        };
        let outcome = self
            .queue
            .enqueue(&name, task, when)
            .await
            .with_context(|| format!("Failed to enqueue update task for {} at {}", address, when))?;

        Ok(match outcome {
            EnqueueOutcome::Created => {
                tracing::info!(address, at = %when, catchup, "Queued update task");
                SignalOutcome::Scheduled { at: when }
            }
            EnqueueOutcome::AlreadyExists => {
                tracing::debug!(address, at = %when, "Deduplicated update task");
                SignalOutcome::Folded { at: when }
            }
        })
    }
}
