//! Authenticity checks for the inbound endpoints.
//!
//! Each endpoint accepts its own caller identity (push bearer token, cron
//! header, task queue header) or the operator key as a bypass.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use hyper::HeaderMap;
use hyper::{Body, Request};
use serde::Deserialize;
use std::sync::Arc;

use crate::config::AuthConfig;
use crate::provider::HttpsClient;

pub const OPERATOR_KEY_HEADER: &str = "x-labeld-key";

const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("no operator key supplied")]
    NoKey,
    #[error("wrong operator key supplied")]
    WrongKey,
    #[error("no Authorization header")]
    NoAuthorization,
    #[error("malformed Authorization header: {0}")]
    MalformedAuthorization(String),
    #[error("bearer token rejected: {0:#}")]
    InvalidToken(anyhow::Error),
    #[error("header {name} is {found:?}, want {want:?}")]
    WrongCaller {
        name: String,
        found: String,
        want: String,
    },
}

/// Validates the bearer token attached to push notifications.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<()>;
}

/// Verifies Google-signed ID tokens with the `tokeninfo` endpoint, checking
/// the audience when one is configured.
pub struct GoogleTokenVerifier {
    http: HttpsClient,
    audience: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenInfoResponse {
    aud: Option<String>,
}

impl GoogleTokenVerifier {
    pub fn new(http: HttpsClient, audience: Option<String>) -> Self {
        Self { http, audience }
    }
}

#[async_trait]
impl TokenVerifier for GoogleTokenVerifier {
    async fn verify(&self, token: &str) -> Result<()> {
        let url = format!("{TOKENINFO_URL}?id_token={}", urlencoding::encode(token));
        let req = Request::get(&url)
            .body(Body::empty())
            .context("Failed to build tokeninfo request")?;
        let resp = self.http.request(req).await.context("Failed to call tokeninfo")?;
        let status = resp.status();
        let body = hyper::body::to_bytes(resp.into_body())
            .await
            .context("Failed to read tokeninfo response")?;
        if !status.is_success() {
            bail!("tokeninfo answered {}", status);
        }

        let info: TokenInfoResponse =
            serde_json::from_slice(&body).context("Failed to parse tokeninfo response")?;
        if let Some(want) = &self.audience {
            if info.aud.as_deref() != Some(want.as_str()) {
                bail!("token audience {:?} does not match {}", info.aud, want);
            }
        }
        Ok(())
    }
}

pub struct CallerChecks {
    config: AuthConfig,
    verifier: Arc<dyn TokenVerifier>,
}

impl CallerChecks {
    pub fn new(config: AuthConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { config, verifier }
    }

    /// Accepts requests carrying the configured operator key.
    pub fn check_operator_key(&self, headers: &HeaderMap) -> Result<(), CheckError> {
        let supplied = header_str(headers, OPERATOR_KEY_HEADER);
        if supplied.is_empty() {
            return Err(CheckError::NoKey);
        }
        match self.config.operator_key.as_deref() {
            Some(key) if !key.is_empty() && key == supplied => Ok(()),
            _ => Err(CheckError::WrongKey),
        }
    }

    /// Push notifications must carry a valid bearer token. This check is
    /// enforced even when caller checks are otherwise relaxed.
    pub async fn check_push(&self, headers: &HeaderMap) -> Result<(), CheckError> {
        if self.check_operator_key(headers).is_ok() {
            return Ok(());
        }

        let auth = header_str(headers, "authorization");
        if auth.is_empty() {
            return Err(CheckError::NoAuthorization);
        }
        let parts: Vec<&str> = auth.split_whitespace().collect();
        if parts.len() != 2 {
            return Err(CheckError::MalformedAuthorization(format!(
                "{} part(s), want 2",
                parts.len()
            )));
        }
        if !parts[0].eq_ignore_ascii_case("bearer") {
            return Err(CheckError::MalformedAuthorization(format!(
                "type {}, want Bearer",
                parts[0]
            )));
        }
        self.verifier
            .verify(parts[1])
            .await
            .map_err(CheckError::InvalidToken)
    }

    pub fn check_cron(&self, headers: &HeaderMap) -> Result<(), CheckError> {
        if !self.config.enforce_caller_checks || self.check_operator_key(headers).is_ok() {
            return Ok(());
        }
        expect_header(headers, &self.config.cron_header, "true")
    }

    pub fn check_task_queue(&self, headers: &HeaderMap) -> Result<(), CheckError> {
        if !self.config.enforce_caller_checks || self.check_operator_key(headers).is_ok() {
            return Ok(());
        }
        expect_header(headers, &self.config.queue_header, &self.config.queue_name)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
}

fn expect_header(headers: &HeaderMap, name: &str, want: &str) -> Result<(), CheckError> {
    let found = header_str(headers, name);
    if found == want {
        Ok(())
    } else {
        Err(CheckError::WrongCaller {
            name: name.to_string(),
            found: found.to_string(),
            want: want.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticVerifier;
    use hyper::header::HeaderValue;

    fn checks(enforce: bool) -> CallerChecks {
        let config = AuthConfig {
            operator_key: Some("sekrit".to_string()),
            enforce_caller_checks: enforce,
            ..AuthConfig::default()
        };
        CallerChecks::new(config, Arc::new(StaticVerifier::accepting("good-token")))
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for &(name, value) in pairs {
            map.insert(name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_operator_key() {
        let c = checks(true);
        assert!(c.check_operator_key(&headers(&[(OPERATOR_KEY_HEADER, " sekrit ")])).is_ok());
        assert!(matches!(
            c.check_operator_key(&headers(&[(OPERATOR_KEY_HEADER, "nope")])),
            Err(CheckError::WrongKey)
        ));
        assert!(matches!(c.check_operator_key(&HeaderMap::new()), Err(CheckError::NoKey)));
    }

    #[test]
    fn test_unset_operator_key_never_matches() {
        let c = CallerChecks::new(AuthConfig::default(), Arc::new(StaticVerifier::accepting("t")));
        assert!(c.check_operator_key(&headers(&[(OPERATOR_KEY_HEADER, "")])).is_err());
        assert!(c.check_operator_key(&headers(&[(OPERATOR_KEY_HEADER, "x")])).is_err());
    }

    #[tokio::test]
    async fn test_push_bearer_token() {
        let c = checks(true);
        assert!(c.check_push(&headers(&[("authorization", "Bearer good-token")])).await.is_ok());
        assert!(c.check_push(&headers(&[("authorization", "bearer good-token")])).await.is_ok());
        assert!(matches!(
            c.check_push(&headers(&[("authorization", "Bearer bad-token")])).await,
            Err(CheckError::InvalidToken(_))
        ));
        assert!(matches!(
            c.check_push(&headers(&[("authorization", "Basic good-token")])).await,
            Err(CheckError::MalformedAuthorization(_))
        ));
        assert!(matches!(
            c.check_push(&headers(&[("authorization", "good-token")])).await,
            Err(CheckError::MalformedAuthorization(_))
        ));
        assert!(matches!(c.check_push(&HeaderMap::new()).await, Err(CheckError::NoAuthorization)));
        assert!(c.check_push(&headers(&[(OPERATOR_KEY_HEADER, "sekrit")])).await.is_ok());
    }

    #[tokio::test]
    async fn test_push_enforced_without_caller_checks() {
        let c = checks(false);
        assert!(c.check_push(&HeaderMap::new()).await.is_err());
    }

    #[test]
    fn test_cron_and_queue_headers() {
        let c = checks(true);
        assert!(c.check_cron(&headers(&[("x-appengine-cron", "true")])).is_ok());
        assert!(c.check_cron(&headers(&[("x-appengine-cron", "false")])).is_err());
        assert!(c.check_cron(&headers(&[(OPERATOR_KEY_HEADER, "sekrit")])).is_ok());

        assert!(c.check_task_queue(&headers(&[("x-appengine-queuename", "update")])).is_ok());
        assert!(c.check_task_queue(&headers(&[("x-appengine-queuename", "other")])).is_err());
        assert!(c.check_task_queue(&HeaderMap::new()).is_err());
    }

    #[test]
    fn test_relaxed_checks_admit_everyone() {
        let c = checks(false);
        assert!(c.check_cron(&HeaderMap::new()).is_ok());
        assert!(c.check_task_queue(&HeaderMap::new()).is_ok());
    }
}
