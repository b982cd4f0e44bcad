use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{ApplicationSecret, read_application_secret};

use crate::store::StateStore;

/// Token storage backed by a mailbox's `credential_token` field.
///
/// The authenticator reads the token handed over at connect time; refreshed
/// tokens are persisted so the next pass starts from a valid access token.
pub struct MailboxTokenStorage {
    address: String,
    current: Mutex<TokenInfo>,
    store: Arc<dyn StateStore>,
}

impl MailboxTokenStorage {
    pub fn new(address: String, token: TokenInfo, store: Arc<dyn StateStore>) -> Self {
        Self {
            address,
            current: Mutex::new(token),
            store,
        }
    }
}

#[async_trait]
impl TokenStorage for MailboxTokenStorage {
    async fn set(&self, _scopes: &[&str], mut token: TokenInfo) -> Result<()> {
        let mut current = self.current.lock().await;
        // Refresh responses usually omit the refresh token.
        if token.refresh_token.is_none() {
            token.refresh_token = current.refresh_token.clone();
        }

        let serialized = serde_json::to_string(&token).context("Failed to serialize token")?;
        self.store
            .update(&self.address, &mut |s| {
                s.credential_token = Some(serialized.clone());
                true
            })
            .await
            .with_context(|| format!("Failed to store refreshed token for {}", self.address))?;

        *current = token;
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        Some(self.current.lock().await.clone())
    }
}

pub async fn load_secret<P: AsRef<Path>>(path: P) -> Result<ApplicationSecret> {
    read_application_secret(path)
        .await
        .context("Failed to read application secret")
}
