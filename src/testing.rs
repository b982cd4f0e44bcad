//! Scripted collaborators shared by the unit tests.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::checks::TokenVerifier;
use crate::error::SyncError;
use crate::models::{
    Contact, LabelDelta, MailThread, MailboxState, SyncTask, ThreadMessage, ThreadPage,
};
use crate::provider::{MailProvider, ProviderConnector};
use crate::scheduler::{EnqueueOutcome, TaskQueue};

/// In-memory mailbox provider. Label mutations are applied to the stored
/// threads so repeated passes observe their own effects.
#[derive(Default)]
pub struct FakeProvider {
    contacts: Mutex<Vec<Contact>>,
    pages: Mutex<Vec<Vec<String>>>,
    threads: Mutex<HashMap<String, MailThread>>,
    labels: Mutex<HashMap<String, String>>,
    queries: Mutex<Vec<String>>,
    modifications: Mutex<Vec<(String, LabelDelta)>>,
    failing_threads: Mutex<HashSet<String>>,
    fail_contacts: Mutex<bool>,
    fail_watch: Mutex<bool>,
    watch_expiry: Mutex<Option<DateTime<Utc>>>,
    list_delay: Mutex<Option<std::time::Duration>>,
    watch_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

pub fn message(from: &str, at: DateTime<Utc>, labels: &[&str]) -> ThreadMessage {
    ThreadMessage {
        from: Some(from.to_string()),
        internal_date: at,
        label_ids: labels.iter().map(|l| l.to_string()).collect(),
    }
}

pub fn contact(address: &str, starred: bool) -> Contact {
    Contact {
        addresses: vec![address.to_string()],
        starred,
    }
}

impl FakeProvider {
    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        *self.contacts.lock().unwrap() = contacts;
    }

    /// Stores a thread and appends it to a single search page.
    pub fn add_thread(&self, thread: MailThread) {
        let mut pages = self.pages.lock().unwrap();
        if pages.is_empty() {
            pages.push(Vec::new());
        }
        if let Some(page) = pages.last_mut() {
            page.push(thread.id.clone());
        }
        self.threads.lock().unwrap().insert(thread.id.clone(), thread);
    }

    /// Replaces the search results with explicit pages of thread ids.
    pub fn set_pages(&self, pages: Vec<Vec<&str>>) {
        *self.pages.lock().unwrap() = pages
            .into_iter()
            .map(|p| p.into_iter().map(str::to_string).collect())
            .collect();
    }

    pub fn insert_thread(&self, thread: MailThread) {
        self.threads.lock().unwrap().insert(thread.id.clone(), thread);
    }

    pub fn thread(&self, id: &str) -> Option<MailThread> {
        self.threads.lock().unwrap().get(id).cloned()
    }

    pub fn fail_thread(&self, id: &str) {
        self.failing_threads.lock().unwrap().insert(id.to_string());
    }

    pub fn fail_contacts(&self) {
        *self.fail_contacts.lock().unwrap() = true;
    }

    pub fn fail_watch(&self) {
        *self.fail_watch.lock().unwrap() = true;
    }

    pub fn set_watch_expiry(&self, expiry: DateTime<Utc>) {
        *self.watch_expiry.lock().unwrap() = Some(expiry);
    }

    pub fn set_list_delay(&self, delay: std::time::Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn modifications(&self) -> Vec<(String, LabelDelta)> {
        self.modifications.lock().unwrap().clone()
    }

    pub fn labels(&self) -> HashMap<String, String> {
        self.labels.lock().unwrap().clone()
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        if *self.fail_contacts.lock().unwrap() {
            bail!("contacts unavailable");
        }
        Ok(self.contacts.lock().unwrap().clone())
    }

    async fn list_threads(&self, query: &str, page_token: Option<&str>) -> Result<ThreadPage> {
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.queries.lock().unwrap().push(query.to_string());

        let index: usize = match page_token {
            Some(token) => token.parse()?,
            None => 0,
        };
        let pages = self.pages.lock().unwrap();
        let thread_ids = pages.get(index).cloned().unwrap_or_default();
        let next_page_token = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(ThreadPage {
            thread_ids,
            next_page_token,
        })
    }

    async fn get_thread(&self, thread_id: &str) -> Result<MailThread> {
        if self.failing_threads.lock().unwrap().contains(thread_id) {
            bail!("thread {} unavailable", thread_id);
        }
        self.thread(thread_id)
            .ok_or_else(|| anyhow!("no thread {}", thread_id))
    }

    async fn modify_thread(&self, thread_id: &str, delta: &LabelDelta) -> Result<()> {
        self.modifications
            .lock()
            .unwrap()
            .push((thread_id.to_string(), delta.clone()));
        let mut threads = self.threads.lock().unwrap();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| anyhow!("no thread {}", thread_id))?;
        for message in &mut thread.messages {
            message.label_ids.retain(|l| !delta.remove.contains(l));
            for label in &delta.add {
                if !message.label_ids.contains(label) {
                    message.label_ids.push(label.clone());
                }
            }
        }
        Ok(())
    }

    async fn ensure_label(&self, name: &str) -> Result<String> {
        let mut labels = self.labels.lock().unwrap();
        let next = format!("Label_{}", labels.len() + 1);
        Ok(labels.entry(name.to_string()).or_insert(next).clone())
    }

    async fn watch(&self, _topic: &str) -> Result<DateTime<Utc>> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_watch.lock().unwrap() {
            bail!("watch refused");
        }
        let configured = *self.watch_expiry.lock().unwrap();
        Ok(configured.unwrap_or_else(|| Utc::now() + Duration::days(7)))
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the same [`FakeProvider`] to every authorized mailbox.
pub struct FakeConnector {
    provider: Arc<FakeProvider>,
}

impl FakeConnector {
    pub fn new(provider: Arc<FakeProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ProviderConnector for FakeConnector {
    async fn connect(&self, state: &MailboxState) -> Result<Arc<dyn MailProvider>, SyncError> {
        if state.credential_token.is_none() {
            return Err(SyncError::NotAuthorized(state.address.clone()));
        }
        Ok(self.provider.clone())
    }
}

/// Accepts exactly one bearer token.
pub struct StaticVerifier {
    token: String,
}

impl StaticVerifier {
    pub fn accepting(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<()> {
        if token == self.token {
            Ok(())
        } else {
            bail!("unknown token")
        }
    }
}

/// Task queue that records what it is handed and deduplicates by name.
#[derive(Default)]
pub struct RecordingQueue {
    names: Mutex<HashSet<String>>,
    tasks: Mutex<Vec<(String, SyncTask, DateTime<Utc>)>>,
    fail: Mutex<bool>,
}

impl RecordingQueue {
    pub fn enqueued(&self) -> Vec<(String, SyncTask, DateTime<Utc>)> {
        self.tasks.lock().unwrap().clone()
    }

    pub fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, name: &str, task: SyncTask, at: DateTime<Utc>) -> Result<EnqueueOutcome> {
        if *self.fail.lock().unwrap() {
            bail!("queue unavailable");
        }
        if !self.names.lock().unwrap().insert(name.to_string()) {
            return Ok(EnqueueOutcome::AlreadyExists);
        }
        self.tasks
            .lock()
            .unwrap()
            .push((name.to_string(), task, at));
        Ok(EnqueueOutcome::Created)
    }
}

/// An enabled, authorized mailbox with a subscription a week out.
pub fn enabled_mailbox(address: &str) -> MailboxState {
    let mut state = MailboxState::new(address);
    state.credential_token = Some("{}".to_string());
    state.subscription_expiry = Some(Utc::now() + Duration::days(7));
    state
}
