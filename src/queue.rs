use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::QueueConfig;
use crate::models::SyncTask;
use crate::scheduler::{EnqueueOutcome, TaskQueue};

/// Executes a delivered task. An error asks the queue to redeliver it.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &SyncTask) -> Result<()>;
}

/// In-process delayed task queue.
///
/// Task names are remembered for `retention` after they are enqueued and a
/// repeated name is reported as [`EnqueueOutcome::AlreadyExists`]. Delivery
/// is at-least-once: a failing task is retried with exponential backoff
/// until `max_attempts` is reached.
#[derive(Clone)]
pub struct LocalTaskQueue {
    handler: Arc<dyn TaskHandler>,
    /// Maps task name -> when it was enqueued.
    names: Arc<Mutex<HashMap<String, Instant>>>,
    retention: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl LocalTaskQueue {
    pub fn new(handler: Arc<dyn TaskHandler>, config: &QueueConfig) -> Self {
        Self {
            handler,
            names: Arc::new(Mutex::new(HashMap::new())),
            retention: Duration::from_secs(config.retention_secs),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_secs(config.retry_backoff_secs),
        }
    }

    fn names(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget names older than the retention period.
    fn cleanup_expired(&self, names: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        names.retain(|_, &mut enqueued| now.duration_since(enqueued) < self.retention);
    }

    #[cfg(test)]
    pub fn remembered(&self) -> usize {
        let mut names = self.names();
        self.cleanup_expired(&mut names);
        names.len()
    }

    async fn deliver(self, name: String, task: SyncTask) {
        tracing::debug!(task = %name, url = %task.url(), "Delivering task");
        let mut delay = self.backoff;
        for attempt in 1..=self.max_attempts {
            match self.handler.handle(&task).await {
                Ok(()) => return,
                Err(e) if attempt < self.max_attempts => {
                    tracing::warn!(
                        task = %name,
                        address = %task.address,
                        attempt,
                        error = %format!("{:#}", e),
                        "Task failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    tracing::error!(
                        task = %name,
                        address = %task.address,
                        attempts = attempt,
                        error = %format!("{:#}", e),
                        "Task failed, giving up"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, name: &str, task: SyncTask, at: DateTime<Utc>) -> Result<EnqueueOutcome> {
        {
            let mut names = self.names();
            self.cleanup_expired(&mut names);
            if names.contains_key(name) {
                return Ok(EnqueueOutcome::AlreadyExists);
            }
            names.insert(name.to_string(), Instant::now());
        }

        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let queue = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            queue.deliver(name, task).await;
        });
        Ok(EnqueueOutcome::Created)
    }
}
