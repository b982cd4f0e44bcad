use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::classify::{Classification, classify, parse_sender};
use crate::models::{Contact, ContactLists, LabelDelta, MailThread, ManagedLabels};
use crate::provider::MailProvider;

/// What one thread needs, and the newest message it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadReconciliation {
    pub latest: Option<DateTime<Utc>>,
    pub delta: LabelDelta,
}

/// Computes the label delta that brings `thread` in line with the
/// classification of its first sender found in either contact list.
///
/// Every message is scanned for the newest timestamp and for the managed
/// labels it carries, even after a classifying sender has been found.
/// Senders that fail to parse are skipped.
pub fn reconcile(
    thread: &MailThread,
    labels: &ManagedLabels,
    starred: &[Contact],
    unstarred: &[Contact],
) -> ThreadReconciliation {
    let mut latest: Option<DateTime<Utc>> = None;
    let mut has_starred = false;
    let mut has_contact = false;
    let mut found = Classification::None;

    for message in &thread.messages {
        latest = latest.max(Some(message.internal_date));
        has_starred |= message.label_ids.iter().any(|l| *l == labels.starred);
        has_contact |= message.label_ids.iter().any(|l| *l == labels.contact);

        if found.is_contact() {
            continue;
        }
        let Some(header) = message.from.as_deref() else {
            continue;
        };
        match parse_sender(header) {
            Ok(address) => found = classify(&address, starred, unstarred),
            Err(e) => tracing::debug!(thread = %thread.id, error = %e, "Skipping sender"),
        }
    }

    let delta = match found {
        Classification::Starred if !has_starred => LabelDelta {
            add: vec![labels.starred.clone()],
            remove: vec![labels.contact.clone()],
        },
        Classification::Unstarred if !has_contact => LabelDelta {
            add: vec![labels.contact.clone()],
            remove: vec![labels.starred.clone()],
        },
        Classification::None if has_starred || has_contact => LabelDelta {
            add: Vec::new(),
            remove: vec![labels.starred.clone(), labels.contact.clone()],
        },
        _ => LabelDelta::default(),
    };

    ThreadReconciliation { latest, delta }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadOutcome {
    pub latest: Option<DateTime<Utc>>,
    /// A label mutation was sent to the provider.
    pub changed: bool,
}

/// Fetches one thread, reconciles it and applies the delta if there is one.
pub async fn sync_thread(
    provider: &dyn MailProvider,
    thread_id: &str,
    labels: &ManagedLabels,
    contacts: &ContactLists,
) -> Result<ThreadOutcome> {
    let thread = provider
        .get_thread(thread_id)
        .await
        .with_context(|| format!("Failed to fetch thread {}", thread_id))?;
    let result = reconcile(&thread, labels, &contacts.starred, &contacts.unstarred);

    if result.delta.is_noop() {
        return Ok(ThreadOutcome {
            latest: result.latest,
            changed: false,
        });
    }

    tracing::info!(
        thread = %thread_id,
        add = ?result.delta.add,
        remove = ?result.delta.remove,
        "Relabelling thread"
    );
    provider
        .modify_thread(thread_id, &result.delta)
        .await
        .with_context(|| format!("Failed to relabel thread {}", thread_id))?;

    Ok(ThreadOutcome {
        latest: result.latest,
        changed: true,
    })
}
