use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, served as JSON at `GET /vars`.
#[derive(Debug, Default)]
pub struct Counters {
    pub push_calls: AtomicU64,
    pub push_errors: AtomicU64,
    /// Passes that found the mailbox leased by another pass.
    pub lease_collisions: AtomicU64,
    pub passes: AtomicU64,
    pub pass_errors: AtomicU64,
    pub pass_deadlines: AtomicU64,
    pub threads_relabelled: AtomicU64,
    pub pass_millis: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub push_calls: u64,
    pub push_errors: u64,
    pub lease_collisions: u64,
    pub passes: u64,
    pub pass_errors: u64,
    pub pass_deadlines: u64,
    pub threads_relabelled: u64,
    pub pass_millis: u64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CountersSnapshot {
            push_calls: get(&self.push_calls),
            push_errors: get(&self.push_errors),
            lease_collisions: get(&self.lease_collisions),
            passes: get(&self.passes),
            pass_errors: get(&self.pass_errors),
            pass_deadlines: get(&self.pass_deadlines),
            threads_relabelled: get(&self.threads_relabelled),
            pass_millis: get(&self.pass_millis),
        }
    }
}
