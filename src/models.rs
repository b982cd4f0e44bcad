use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stored state for one monitored mailbox, keyed by address.
///
/// Every mutation goes through [`crate::store::StateStore::update`], which
/// applies it as an optimistic read-compute-write transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxState {
    pub address: String,
    /// Serialized OAuth token; `None` means the mailbox is not authorized.
    pub credential_token: Option<String>,
    /// Scan all non-chat mail instead of only the inbox.
    pub scan_all_mail: bool,
    pub starred_label_id: Option<String>,
    pub contact_label_id: Option<String>,
    /// Latest message timestamp already reconciled. Never moves backwards.
    pub last_thread_time: Option<DateTime<Utc>>,
    /// No update task may be scheduled before this time. A task is not
    /// necessarily pending at this time; signals arriving earlier fold into
    /// a task scheduled exactly here.
    pub no_runs_before: Option<DateTime<Utc>>,
    /// When a synchronization pass last started.
    pub last_run: Option<DateTime<Utc>>,
    /// Expiry of the provider push subscription; `None` means disabled.
    pub subscription_expiry: Option<DateTime<Utc>>,
    /// A pass holds the mailbox while this lies in the future.
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl MailboxState {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credential_token: None,
            scan_all_mail: false,
            starred_label_id: None,
            contact_label_id: None,
            last_thread_time: None,
            no_runs_before: None,
            last_run: None,
            subscription_expiry: None,
            lease_expiry: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.subscription_expiry.is_some()
    }

    pub fn lease_held_at(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry.is_some_and(|expiry| expiry > now)
    }

    pub fn managed_labels(&self) -> Option<ManagedLabels> {
        match (&self.starred_label_id, &self.contact_label_id) {
            (Some(starred), Some(contact)) => Some(ManagedLabels {
                starred: starred.clone(),
                contact: contact.clone(),
            }),
            _ => None,
        }
    }
}

/// Provider ids of the two labels this service owns in a mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedLabels {
    pub starred: String,
    pub contact: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub addresses: Vec<String>,
    pub starred: bool,
}

/// A mailbox owner's contacts, split by the starred flag.
#[derive(Debug, Clone, Default)]
pub struct ContactLists {
    pub starred: Vec<Contact>,
    pub unstarred: Vec<Contact>,
}

impl ContactLists {
    /// Splits contacts by their starred flag, dropping contacts that carry
    /// no usable address.
    pub fn partition(contacts: impl IntoIterator<Item = Contact>) -> Self {
        let mut lists = Self::default();
        for contact in contacts {
            if !contact.addresses.iter().any(|a| !a.trim().is_empty()) {
                continue;
            }
            if contact.starred {
                lists.starred.push(contact);
            } else {
                lists.unstarred.push(contact);
            }
        }
        lists
    }
}

/// One message of a conversation thread, reduced to what labelling needs.
#[derive(Debug, Clone)]
pub struct ThreadMessage {
    /// Raw `From` header, if present.
    pub from: Option<String>,
    pub internal_date: DateTime<Utc>,
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MailThread {
    pub id: String,
    pub messages: Vec<ThreadMessage>,
}

/// One page of a thread search.
#[derive(Debug, Clone, Default)]
pub struct ThreadPage {
    pub thread_ids: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Labels to add to and remove from a thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl LabelDelta {
    pub fn is_noop(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// A deferred synchronization request for one mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTask {
    pub address: String,
    /// Scan exactly this calendar day instead of the watermark window.
    pub date: Option<NaiveDate>,
    /// Triggered by the sweep rather than by a push notification.
    pub catchup: bool,
}

impl SyncTask {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            date: None,
            catchup: false,
        }
    }

    /// Relative URL of the task execution endpoint carrying this task.
    pub fn url(&self) -> String {
        let mut url = format!("/t/update?email={}", urlencoding::encode(&self.address));
        if let Some(date) = self.date {
            url.push_str(&format!("&date={}", date.format("%Y-%m-%d")));
        }
        if self.catchup {
            url.push_str("&catchup=true");
        }
        url
    }
}
