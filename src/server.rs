//! Inbound HTTP endpoints.
//!
//! - `POST /push`: provider change notification, schedules an update.
//! - `GET|POST /t/update`: task execution, runs one pass.
//! - `GET|POST /t/cron`: periodic renewal and catch-up sweep.
//! - `GET /vars`: counters as JSON.

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode, header};
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::checks::{CallerChecks, CheckError};
use crate::date::parse_date;
use crate::driver::{PassOutcome, SyncDriver};
use crate::error::SyncError;
use crate::metrics::Counters;
use crate::models::SyncTask;
use crate::scheduler::{Scheduler, SignalOutcome};
use crate::sweep::Sweeper;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Unauthorized(#[from] CheckError),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Date(e) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self, path: &str) -> Response<Body> {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(e) => {
                tracing::error!(path, error = %format!("{:#}", e), "Request failed");
                "internal error".to_string()
            }
            other => {
                tracing::warn!(path, status = status.as_u16(), error = %other, "Request rejected");
                other.to_string()
            }
        };
        text_response(status, message)
    }
}

pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub driver: Arc<SyncDriver>,
    pub sweeper: Arc<Sweeper>,
    pub checks: Arc<CallerChecks>,
    pub counters: Arc<Counters>,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    message: PushData,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushData {
    data: String,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "emailAddress")]
    email_address: String,
}

pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(state, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind {}", addr))?
        .serve(make_svc);
    tracing::info!(%addr, "Listening");
    server
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

pub async fn route(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    tracing::debug!(method = %req.method(), path = %path, "Request");

    let result = match path.as_str() {
        "/push" => push(&state, req).await,
        "/t/update" => update(&state, req).await,
        "/t/cron" => cron(&state, req).await,
        "/vars" => vars(&state, req),
        _ => Err(ApiError::NotFound),
    };
    result.unwrap_or_else(|e| e.into_response(&path))
}

async fn push(state: &AppState, req: Request<Body>) -> Result<Response<Body>, ApiError> {
    Counters::incr(&state.counters.push_calls);
    let result = handle_push(state, req).await;
    if result.is_err() {
        Counters::incr(&state.counters.push_errors);
    }
    result
}

async fn handle_push(state: &AppState, req: Request<Body>) -> Result<Response<Body>, ApiError> {
    if req.method() != Method::POST {
        return Err(ApiError::MethodNotAllowed);
    }
    let content_type = header_value(&req, header::CONTENT_TYPE.as_str());
    let media_type = content_type.split(';').next().unwrap_or("").trim();
    if !media_type.eq_ignore_ascii_case("application/json") {
        return Err(ApiError::BadRequest(format!(
            "content type {:?} not allowed",
            content_type
        )));
    }

    state.checks.check_push(req.headers()).await?;

    let body = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| ApiError::BadRequest(format!("reading request body: {}", e)))?;
    let msg: PushMessage = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("decoding request body: {}", e)))?;
    let decoded = BASE64
        .decode(msg.message.data.as_bytes())
        .map_err(|e| ApiError::BadRequest(format!("decoding request payload: {}", e)))?;
    let payload: PushPayload = serde_json::from_slice(&decoded)
        .map_err(|e| ApiError::BadRequest(format!("decoding request payload: {}", e)))?;
    let date = match msg.date.as_deref().filter(|d| !d.is_empty()) {
        Some(d) => Some(parse_date(d).map_err(|e| ApiError::BadRequest(e.to_string()))?),
        None => None,
    };

    tracing::info!(address = %payload.email_address, "Got push");
    let outcome = state
        .scheduler
        .signal(&payload.email_address, date, false)
        .await?;
    match outcome {
        SignalOutcome::Scheduled { at } | SignalOutcome::Folded { at } => {
            tracing::debug!(address = %payload.email_address, %at, "Update queued");
        }
        other => tracing::debug!(address = %payload.email_address, outcome = ?other, "Push absorbed"),
    }
    Ok(no_content())
}

async fn update(state: &AppState, req: Request<Body>) -> Result<Response<Body>, ApiError> {
    if req.method() != Method::GET && req.method() != Method::POST {
        return Err(ApiError::MethodNotAllowed);
    }
    state.checks.check_task_queue(req.headers())?;

    let params = query_params(req.uri().query().unwrap_or(""));
    let address = params
        .get("email")
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing email parameter".to_string()))?;
    let date = match params.get("date").map(String::as_str).filter(|d| !d.is_empty()) {
        Some(d) => Some(parse_date(d).map_err(|e| ApiError::BadRequest(e.to_string()))?),
        None => None,
    };
    let catchup = params.get("catchup").is_some_and(|c| parse_bool(c));

    let task = SyncTask {
        date,
        catchup,
        ..SyncTask::new(address)
    };
    match state.driver.run(&task).await {
        Ok(PassOutcome::UnknownMailbox) => {
            tracing::info!(address, "Ignoring update for unknown mailbox");
            Ok(no_content())
        }
        Ok(_) => Ok(no_content()),
        Err(e) => Err(e.into()),
    }
}

async fn cron(state: &AppState, req: Request<Body>) -> Result<Response<Body>, ApiError> {
    if req.method() != Method::GET && req.method() != Method::POST {
        return Err(ApiError::MethodNotAllowed);
    }
    state.checks.check_cron(req.headers())?;
    state.sweeper.run(Utc::now()).await?;
    Ok(no_content())
}

fn vars(state: &AppState, req: Request<Body>) -> Result<Response<Body>, ApiError> {
    if req.method() != Method::GET {
        return Err(ApiError::MethodNotAllowed);
    }
    let body = serde_json::to_vec(&state.counters.snapshot()).context("Failed to encode counters")?;
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .context("Failed to build response")
        .map_err(ApiError::from)
}

fn header_value<'a>(req: &'a Request<Body>, name: &str) -> &'a str {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Parses an `application/x-www-form-urlencoded` query string. The last
/// occurrence of a repeated key wins.
fn query_params(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| urlencoding::decode(&s.replace('+', " ")).ok().map(|d| d.into_owned());
            Some((decode(key)?, decode(value)?))
        })
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(s, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

fn no_content() -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::NO_CONTENT;
    resp
}

fn text_response(status: StatusCode, message: String) -> Response<Body> {
    let mut resp = Response::new(Body::from(message));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::OPERATOR_KEY_HEADER;
    use crate::config::{AuthConfig, EngineConfig, ProviderConfig};
    use crate::provider::ProviderConnector;
    use crate::store::{MemoryStateStore, StateStore};
    use crate::subscription::SubscriptionManager;
    use crate::testing::{
        FakeConnector, FakeProvider, RecordingQueue, StaticVerifier, enabled_mailbox,
    };
    use chrono::Duration;

    struct Harness {
        state: Arc<AppState>,
        store: Arc<MemoryStateStore>,
        queue: Arc<RecordingQueue>,
        fake: Arc<FakeProvider>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStateStore::new());
        store.put(&enabled_mailbox("a@example.com")).await.unwrap();
        let fake = Arc::new(FakeProvider::default());
        let connector: Arc<dyn ProviderConnector> = Arc::new(FakeConnector::new(fake.clone()));
        let queue = Arc::new(RecordingQueue::default());
        let counters = Arc::new(Counters::default());

        let subscriptions = Arc::new(SubscriptionManager::new(
            store.clone(),
            connector.clone(),
            "projects/p/topics/mail",
            Duration::days(1),
        ));
        let scheduler = Arc::new(Scheduler::new(store.clone(), queue.clone(), Duration::minutes(1)));
        let driver = Arc::new(SyncDriver::new(
            store.clone(),
            connector,
            subscriptions.clone(),
            counters.clone(),
            &EngineConfig::default(),
            &ProviderConfig::default(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            subscriptions,
            scheduler.clone(),
            Duration::hours(24),
        ));
        let checks = Arc::new(CallerChecks::new(
            AuthConfig {
                operator_key: Some("sekrit".to_string()),
                ..AuthConfig::default()
            },
            Arc::new(StaticVerifier::accepting("good-token")),
        ));

        Harness {
            state: Arc::new(AppState {
                scheduler,
                driver,
                sweeper,
                checks,
                counters,
            }),
            store,
            queue,
            fake,
        }
    }

    fn push_body(address: &str, date: Option<&str>) -> String {
        let data = BASE64.encode(format!(r#"{{"emailAddress":"{}","historyId":"42"}}"#, address));
        match date {
            Some(d) => format!(r#"{{"message":{{"data":"{}"}},"date":"{}"}}"#, data, d),
            None => format!(r#"{{"message":{{"data":"{}"}},"subscription":"s"}}"#, data),
        }
    }

    fn push_request(body: String) -> Request<Body> {
        Request::post("/push")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer good-token")
            .body(Body::from(body))
            .unwrap()
    }

    async fn status(h: &Harness, req: Request<Body>) -> StatusCode {
        route(h.state.clone(), req).await.status()
    }

    #[tokio::test]
    async fn test_push_schedules_update() {
        let h = harness().await;
        let resp = status(&h, push_request(push_body("a@example.com", None))).await;
        assert_eq!(resp, StatusCode::NO_CONTENT);

        let tasks = h.queue.enqueued();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].1, SyncTask::new("a@example.com"));
        assert_eq!(h.state.counters.snapshot().push_calls, 1);
    }

    #[tokio::test]
    async fn test_push_with_date_override() {
        let h = harness().await;
        let resp = status(&h, push_request(push_body("a@example.com", Some("2024-02-29")))).await;
        assert_eq!(resp, StatusCode::NO_CONTENT);
        assert_eq!(
            h.queue.enqueued()[0].1.date,
            chrono::NaiveDate::from_ymd_opt(2024, 2, 29)
        );

        let resp = status(&h, push_request(push_body("a@example.com", Some("2023-02-29")))).await;
        assert_eq!(resp, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_push_for_unknown_mailbox_is_accepted() {
        let h = harness().await;
        let resp = status(&h, push_request(push_body("nobody@example.com", None))).await;
        assert_eq!(resp, StatusCode::NO_CONTENT);
        assert!(h.queue.enqueued().is_empty());
    }

    #[tokio::test]
    async fn test_push_rejections() {
        let h = harness().await;

        let get = Request::get("/push").body(Body::empty()).unwrap();
        assert_eq!(status(&h, get).await, StatusCode::METHOD_NOT_ALLOWED);

        let text = Request::post("/push")
            .header(header::CONTENT_TYPE, "text/plain")
            .header(header::AUTHORIZATION, "Bearer good-token")
            .body(Body::from(push_body("a@example.com", None)))
            .unwrap();
        assert_eq!(status(&h, text).await, StatusCode::BAD_REQUEST);

        let unauthenticated = Request::post("/push")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(push_body("a@example.com", None)))
            .unwrap();
        assert_eq!(status(&h, unauthenticated).await, StatusCode::UNAUTHORIZED);

        let bad_token = Request::post("/push")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer forged")
            .body(Body::from(push_body("a@example.com", None)))
            .unwrap();
        assert_eq!(status(&h, bad_token).await, StatusCode::UNAUTHORIZED);

        assert_eq!(status(&h, push_request("{not json".to_string())).await, StatusCode::BAD_REQUEST);
        assert_eq!(
            status(&h, push_request(r#"{"message":{"data":"%%%"}}"#.to_string())).await,
            StatusCode::BAD_REQUEST
        );
        let not_json = BASE64.encode("hello");
        assert_eq!(
            status(&h, push_request(format!(r#"{{"message":{{"data":"{}"}}}}"#, not_json))).await,
            StatusCode::BAD_REQUEST
        );

        assert!(h.queue.enqueued().is_empty());
        assert_eq!(h.state.counters.snapshot().push_errors, 7);
    }

    #[tokio::test]
    async fn test_push_accepts_operator_key_and_charset() {
        let h = harness().await;
        let req = Request::post("/push")
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .header(OPERATOR_KEY_HEADER, "sekrit")
            .body(Body::from(push_body("a@example.com", None)))
            .unwrap();
        assert_eq!(status(&h, req).await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_update_runs_pass() {
        let h = harness().await;
        let req = Request::get("/t/update?email=a%40example.com&catchup=true")
            .header("x-appengine-queuename", "update")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(&h, req).await, StatusCode::NO_CONTENT);
        assert_eq!(h.fake.queries().len(), 1);
        assert!(h.store.get("a@example.com").await.unwrap().last_run.is_some());
    }

    #[tokio::test]
    async fn test_update_rejections() {
        let h = harness().await;

        let no_header = Request::get("/t/update?email=a%40example.com").body(Body::empty()).unwrap();
        assert_eq!(status(&h, no_header).await, StatusCode::UNAUTHORIZED);

        let no_email = Request::get("/t/update")
            .header("x-appengine-queuename", "update")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(&h, no_email).await, StatusCode::BAD_REQUEST);

        let bad_date = Request::get("/t/update?email=a%40example.com&date=2024-13-01")
            .header("x-appengine-queuename", "update")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(&h, bad_date).await, StatusCode::BAD_REQUEST);

        let put = Request::put("/t/update").body(Body::empty()).unwrap();
        assert_eq!(status(&h, put).await, StatusCode::METHOD_NOT_ALLOWED);
        assert!(h.fake.queries().is_empty());
    }

    #[tokio::test]
    async fn test_update_provider_failure_is_internal_error() {
        let h = harness().await;
        h.fake.fail_contacts();
        let req = Request::post("/t/update?email=a%40example.com")
            .header(OPERATOR_KEY_HEADER, "sekrit")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(&h, req).await, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.store.get("a@example.com").await.unwrap().lease_expiry, None);
    }

    #[tokio::test]
    async fn test_cron() {
        let h = harness().await;
        let denied = Request::get("/t/cron").body(Body::empty()).unwrap();
        assert_eq!(status(&h, denied).await, StatusCode::UNAUTHORIZED);

        let req = Request::get("/t/cron")
            .header("x-appengine-cron", "true")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(&h, req).await, StatusCode::NO_CONTENT);
        // The mailbox never ran, so it gets a catch-up task.
        let tasks = h.queue.enqueued();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].1.catchup);
    }

    #[tokio::test]
    async fn test_vars_and_unknown_paths() {
        let h = harness().await;
        let resp = route(h.state.clone(), Request::get("/vars").body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["push_calls"], 0);

        let missing = Request::get("/nowhere").body(Body::empty()).unwrap();
        assert_eq!(status(&h, missing).await, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_query_params() {
        let params = query_params("email=a%2Bb%40example.com&date=2024-02-29&catchup=true&x");
        assert_eq!(params["email"], "a+b@example.com");
        assert_eq!(params["date"], "2024-02-29");
        assert_eq!(params["x"], "");
        assert!(parse_bool(&params["catchup"]));
        assert!(!parse_bool("yes"));
    }
}
