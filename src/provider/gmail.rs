use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::Gmail;
use google_gmail1::api::{Label, ModifyThreadRequest, WatchRequest};
use hyper::client::HttpConnector;
use hyper::{Body, Request, header};
use hyper_rustls::HttpsConnector;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use yup_oauth2::authenticator::Authenticator;
use yup_oauth2::authorized_user::AuthorizedUserSecret;
use yup_oauth2::storage::TokenInfo;
use yup_oauth2::{ApplicationSecret, AuthorizedUserAuthenticator};

use super::{MailProvider, ProviderConnector, RateLimiter};
use crate::auth::MailboxTokenStorage;
use crate::error::SyncError;
use crate::models::{Contact, LabelDelta, MailThread, MailboxState, ThreadMessage, ThreadPage};
use crate::store::StateStore;

pub type HttpsClient = hyper::Client<HttpsConnector<HttpConnector>>;

const PEOPLE_CONNECTIONS_URL: &str = "https://people.googleapis.com/v1/people/me/connections";
const STARRED_GROUP: &str = "starred";

const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/contacts.readonly",
    "https://www.googleapis.com/auth/gmail.labels",
    "https://www.googleapis.com/auth/gmail.modify",
];

pub fn https_client() -> Result<HttpsClient> {
    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("Failed to load native roots")?
        .https_only()
        .enable_http1()
        .build();
    Ok(hyper::Client::builder().build(connector))
}

/// Gmail and People API session for one mailbox. Every request it sends
/// takes a token from the shared limiter first.
#[derive(Clone)]
pub struct GmailProvider {
    hub: Gmail<HttpsConnector<HttpConnector>>,
    auth: Authenticator<HttpsConnector<HttpConnector>>,
    http: HttpsClient,
    limiter: Arc<RateLimiter>,
}

impl GmailProvider {
    pub fn new(
        http: HttpsClient,
        auth: Authenticator<HttpsConnector<HttpConnector>>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let hub = Gmail::new(http.clone(), auth.clone());
        Self {
            hub,
            auth,
            http,
            limiter,
        }
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .auth
            .token(SCOPES)
            .await
            .context("Failed to obtain access token")?;
        token
            .token()
            .map(str::to_string)
            .context("Access token response carried no token")
    }

    async fn connections_page(&self, access_token: &str, page_token: Option<&str>) -> Result<ConnectionsPage> {
        let mut url = format!("{PEOPLE_CONNECTIONS_URL}?personFields=emailAddresses,memberships&pageSize=1000");
        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let req = Request::get(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .body(Body::empty())
            .context("Failed to build connections request")?;
        let resp = self
            .http
            .request(req)
            .await
            .context("Failed to list connections")?;

        let status = resp.status();
        let body = hyper::body::to_bytes(resp.into_body())
            .await
            .context("Failed to read connections response")?;
        if !status.is_success() {
            bail!(
                "Listing connections failed with {}: {}",
                status,
                String::from_utf8_lossy(&body)
            );
        }
        serde_json::from_slice(&body).context("Failed to parse connections response")
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        let access_token = self.access_token().await?;
        collect_contacts(&self.limiter, |page_token| {
            let access_token = access_token.as_str();
            async move { self.connections_page(access_token, page_token.as_deref()).await }
        })
        .await
    }

    async fn list_threads(&self, query: &str, page_token: Option<&str>) -> Result<ThreadPage> {
        let mut req = self.hub.users().threads_list("me").q(query);
        if let Some(token) = page_token {
            req = req.page_token(token);
        }

        self.limiter.acquire().await;
        let (_, list) = req.doit().await.context("Failed to list threads")?;

        let thread_ids = list
            .threads
            .unwrap_or_default()
            .into_iter()
            .filter_map(|t| t.id)
            .collect();

        Ok(ThreadPage {
            thread_ids,
            next_page_token: list.next_page_token,
        })
    }

    async fn get_thread(&self, thread_id: &str) -> Result<MailThread> {
        self.limiter.acquire().await;
        let (_, thread) = self
            .hub
            .users()
            .threads_get("me", thread_id)
            .format("metadata")
            .add_metadata_headers("From")
            .doit()
            .await
            .context(format!("Failed to get thread {}", thread_id))?;

        let messages = thread
            .messages
            .unwrap_or_default()
            .into_iter()
            .map(|msg| {
                let from = msg
                    .payload
                    .as_ref()
                    .and_then(|p| p.headers.as_ref())
                    .and_then(|headers| {
                        headers
                            .iter()
                            .find(|h| h.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case("From")))
                    })
                    .and_then(|h| h.value.clone());

                ThreadMessage {
                    from,
                    internal_date: DateTime::from_timestamp_millis(msg.internal_date.unwrap_or(0))
                        .unwrap_or_default(),
                    label_ids: msg.label_ids.unwrap_or_default(),
                }
            })
            .collect();

        Ok(MailThread {
            id: thread_id.to_string(),
            messages,
        })
    }

    async fn modify_thread(&self, thread_id: &str, delta: &LabelDelta) -> Result<()> {
        let req = ModifyThreadRequest {
            add_label_ids: Some(delta.add.clone()),
            remove_label_ids: Some(delta.remove.clone()),
        };
        self.limiter.acquire().await;
        match self.hub.users().threads_modify(req, "me", thread_id).doit().await {
            Ok(_) => Ok(()),
            Err(e) if has_status(&e, 304) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to modify thread {}", thread_id))),
        }
    }

    async fn ensure_label(&self, name: &str) -> Result<String> {
        let label = Label {
            name: Some(name.to_string()),
            label_list_visibility: Some("labelShow".to_string()),
            message_list_visibility: Some("show".to_string()),
            type_: Some("user".to_string()),
            ..Default::default()
        };
        self.limiter.acquire().await;
        match self.hub.users().labels_create(label, "me").doit().await {
            Ok((_, created)) => {
                if let Some(id) = created.id {
                    return Ok(id);
                }
            }
            Err(e) if has_status(&e, 409) || has_status(&e, 304) => {}
            Err(e) => return Err(anyhow::Error::new(e).context(format!("Failed to create label {}", name))),
        }

        self.limiter.acquire().await;
        let (_, label_list) = self
            .hub
            .users()
            .labels_list("me")
            .doit()
            .await
            .context("Failed to list labels")?;

        label_list
            .labels
            .unwrap_or_default()
            .into_iter()
            .find(|l| l.name.as_deref() == Some(name))
            .and_then(|l| l.id)
            .with_context(|| format!("Label {} missing after create", name))
    }

    async fn watch(&self, topic: &str) -> Result<DateTime<Utc>> {
        let req = WatchRequest {
            topic_name: Some(topic.to_string()),
            ..Default::default()
        };
        self.limiter.acquire().await;
        let (_, resp) = self
            .hub
            .users()
            .watch(req, "me")
            .doit()
            .await
            .context("Failed to subscribe to push notifications")?;

        let millis = resp.expiration.context("Watch response carried no expiration")?;
        DateTime::from_timestamp_millis(millis).context("Watch expiration out of range")
    }

    async fn stop(&self) -> Result<()> {
        self.limiter.acquire().await;
        self.hub
            .users()
            .stop("me")
            .doit()
            .await
            .context("Failed to unsubscribe from push notifications")?;
        Ok(())
    }
}

/// Follows `next_page_token` until the last page, taking a limiter token
/// before each page request.
async fn collect_contacts<F, Fut>(limiter: &RateLimiter, mut fetch: F) -> Result<Vec<Contact>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<ConnectionsPage>>,
{
    let mut contacts = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        limiter.acquire().await;
        let page = fetch(page_token.take()).await?;
        contacts.extend(page.connections.into_iter().map(Person::into_contact));
        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    Ok(contacts)
}

fn has_status(err: &google_gmail1::Error, code: u16) -> bool {
    match err {
        google_gmail1::Error::Failure(resp) => resp.status().as_u16() == code,
        google_gmail1::Error::BadRequest(body) => {
            body.pointer("/error/code").and_then(|c| c.as_u64()) == Some(u64::from(code))
        }
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionsPage {
    #[serde(default)]
    connections: Vec<Person>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Person {
    #[serde(default)]
    email_addresses: Vec<PersonEmail>,
    #[serde(default)]
    memberships: Vec<Membership>,
}

#[derive(Debug, Deserialize)]
struct PersonEmail {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Membership {
    contact_group_membership: Option<GroupMembership>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupMembership {
    contact_group_id: Option<String>,
}

impl Person {
    fn into_contact(self) -> Contact {
        let starred = self.memberships.iter().any(|m| {
            m.contact_group_membership
                .as_ref()
                .and_then(|g| g.contact_group_id.as_deref())
                == Some(STARRED_GROUP)
        });
        Contact {
            addresses: self
                .email_addresses
                .into_iter()
                .map(|e| e.value)
                .filter(|v| !v.is_empty())
                .collect(),
            starred,
        }
    }
}

/// Opens [`GmailProvider`] sessions from the OAuth token stored with each
/// mailbox. Refreshed tokens are written back through the state store.
pub struct GmailConnector {
    secret: ApplicationSecret,
    http: HttpsClient,
    store: Arc<dyn StateStore>,
    limiter: Arc<RateLimiter>,
}

impl GmailConnector {
    pub fn new(
        secret: ApplicationSecret,
        http: HttpsClient,
        store: Arc<dyn StateStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            secret,
            http,
            store,
            limiter,
        }
    }
}

#[async_trait]
impl ProviderConnector for GmailConnector {
    async fn connect(&self, state: &MailboxState) -> Result<Arc<dyn MailProvider>, SyncError> {
        let not_authorized = || SyncError::NotAuthorized(state.address.clone());

        let raw = state.credential_token.as_deref().ok_or_else(not_authorized)?;
        let token: TokenInfo =
            serde_json::from_str(raw).context(format!("Failed to decode stored token for {}", state.address))?;
        let refresh_token = token.refresh_token.clone().ok_or_else(not_authorized)?;

        let secret = AuthorizedUserSecret {
            client_id: self.secret.client_id.clone(),
            client_secret: self.secret.client_secret.clone(),
            refresh_token,
            key_type: "authorized_user".to_string(),
        };
        let storage = MailboxTokenStorage::new(state.address.clone(), token, self.store.clone());

        let auth = AuthorizedUserAuthenticator::builder(secret)
            .hyper_client(self.http.clone())
            .with_storage(Box::new(storage))
            .build()
            .await
            .context("Failed to build authenticator")?;

        Ok(Arc::new(GmailProvider::new(
            self.http.clone(),
            auth,
            self.limiter.clone(),
        )))
    }
}
