//! OData Client module
//!
//! Query engine for SAP Gateway OData v2 services. Requests go through the
//! authenticated [`Session`]; transient failures are retried with backoff and
//! an expired session is re-authenticated exactly once per request.

use super::session::{is_session_rejection, AuthContext, Session};
use crate::auth::{CredentialError, CredentialSet};
use crate::catalog::KeyKind;
use crate::config::RuntimeConfig;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Upper bound for the exponential backoff between attempts
const MAX_BACKOFF_MS: u64 = 30_000;

/// Upper bound for honouring a `Retry-After` header
const MAX_RATE_LIMIT_WAIT_SECS: u64 = 60;

/// OData client errors
#[derive(Error, Debug)]
pub enum ODataError {
    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Rate limited (429): retry after {0} seconds")]
    RateLimited(u64),

    #[error("Server error ({0}): {1}")]
    ServerError(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ODataError {
    /// Timeouts and connection failures that may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpError(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimited(_) => true,
            Self::ServerError(status, _) => *status >= 500,
            _ => false,
        }
    }
}

/// Query options for OData requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    pub filter: Option<String>,
    /// `Some(0)` is an explicit "no rows" request; `None` means no limit
    pub top: Option<u32>,
    pub skip: Option<u32>,
    pub orderby: Option<String>,
    pub expand: Option<Vec<String>>,
}

impl QueryOptions {
    /// OData system query options as name/value pairs
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();

        if let Some(ref filter) = self.filter {
            params.push(("$filter".to_string(), filter.clone()));
        }

        if let Some(ref select) = self.select {
            if let Some(joined) = join_fields(select) {
                params.push(("$select".to_string(), joined));
            }
        }

        if let Some(top) = self.top {
            params.push(("$top".to_string(), top.to_string()));
        }

        if let Some(skip) = self.skip {
            params.push(("$skip".to_string(), skip.to_string()));
        }

        if let Some(ref orderby) = self.orderby {
            params.push(("$orderby".to_string(), orderby.clone()));
        }

        if let Some(ref expand) = self.expand {
            if let Some(joined) = join_fields(expand) {
                params.push(("$expand".to_string(), joined));
            }
        }

        params
    }
}

fn join_fields(fields: &[String]) -> Option<String> {
    let fields: Vec<&str> = fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.is_empty() {
        None
    } else {
        Some(fields.join(","))
    }
}

/// Render an entity key as an OData v2 key literal.
///
/// Numeric keys stay bare; everything else is single-quoted with embedded
/// quotes doubled. Input that is already quoted is left alone.
pub fn format_key_literal(key: &str, kind: KeyKind) -> String {
    let key = key.trim();

    let already_quoted = key.len() >= 2 && key.starts_with('\'') && key.ends_with('\'');
    if already_quoted {
        return key.to_string();
    }

    let numeric = !key.is_empty() && key.chars().all(|c| c.is_ascii_digit());
    match kind {
        KeyKind::Numeric => key.to_string(),
        KeyKind::Auto if numeric => key.to_string(),
        _ => format!("'{}'", key.replace('\'', "''")),
    }
}

/// Key predicate path segment, e.g. `('91000092')` percent-encoded
pub fn key_segment(key: &str, kind: KeyKind) -> String {
    format!("({})", urlencoding::encode(&format_key_literal(key, kind)))
}

/// SAP Gateway OData v2 client
#[derive(Debug)]
pub struct SapClient {
    session: Session,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl SapClient {
    /// Create a client and its (not yet authenticated) session
    pub fn new(credentials: CredentialSet, runtime: &RuntimeConfig) -> Result<Self, ODataError> {
        let max_retries = credentials.retry_attempts.max(1);
        let session = Session::new(credentials, &runtime.auth_path)?;
        Ok(Self {
            session,
            max_retries,
            retry_delay_ms: runtime.retry_delay_ms,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run the CSRF handshake explicitly
    pub async fn authenticate(&self) -> Result<bool, ODataError> {
        self.session.authenticate().await
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Absolute URL of an entity set under a service path
    pub fn entity_set_url(&self, service_path: &str, entity_set: &str) -> String {
        let base = self.session.base_url().as_str().trim_end_matches('/');
        let service_path = service_path.trim_matches('/');
        let entity_set = entity_set.trim_matches('/');
        format!("{}/{}/{}", base, service_path, entity_set)
    }

    /// Query an entity set
    pub async fn query_entity_set(
        &self,
        service_path: &str,
        entity_set: &str,
        options: &QueryOptions,
    ) -> Result<Value, ODataError> {
        let url = self.entity_set_url(service_path, entity_set);
        self.execute(&url, &options.to_query_pairs()).await
    }

    /// Get single entity by key
    pub async fn get_entity(
        &self,
        service_path: &str,
        entity_set: &str,
        entity_key: &str,
        key_kind: KeyKind,
        select_fields: Option<&[String]>,
    ) -> Result<Value, ODataError> {
        let url = format!(
            "{}{}",
            self.entity_set_url(service_path, entity_set),
            key_segment(entity_key, key_kind)
        );

        let mut params = Vec::new();
        if let Some(joined) = select_fields.and_then(join_fields) {
            params.push(("$select".to_string(), joined));
        }

        self.execute(&url, &params).await
    }

    /// Execute a read, re-authenticating once if SAP rejects the session.
    /// The lazy token fetch shares the retry budget of the request.
    async fn execute(&self, url: &str, params: &[(String, String)]) -> Result<Value, ODataError> {
        let session = &self.session;
        let ctx = self
            .retry_transient("CSRF token fetch", move || session.ensure_authenticated())
            .await?;

        match self.fetch(url, params, &ctx).await {
            Err(ODataError::SessionExpired(reason)) => {
                tracing::warn!("Session rejected ({}), re-authenticating once", reason);
                let seen = ctx.generation;
                let ctx = self
                    .retry_transient("CSRF token refetch", move || session.reauthenticate(seen))
                    .await?;
                self.fetch(url, params, &ctx).await
            }
            other => other,
        }
    }

    /// GET with `$format=json`, retried on transient failures
    async fn fetch(
        &self,
        url: &str,
        params: &[(String, String)],
        ctx: &AuthContext,
    ) -> Result<Value, ODataError> {
        let session = &self.session;
        self.retry_transient(url, move || async move {
            let request = session
                .apply(session.http_client().get(url), ctx)
                .query(params)
                .query(&[("$format", "json")]);

            match request.send().await {
                Ok(response) => Self::handle_response(response).await,
                Err(e) => Err(ODataError::HttpError(e)),
            }
        })
        .await
    }

    /// Run `op` up to `max_retries` times while it fails transiently
    async fn retry_transient<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ODataError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ODataError>>,
    {
        let mut attempt = 0;
        let mut delay = self.retry_delay_ms;

        loop {
            attempt += 1;

            tracing::debug!("{} (attempt {}/{})", what, attempt, self.max_retries);

            match op().await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let wait = retry_wait(&e, delay);
                    tracing::warn!(
                        "{}, attempt {}/{}, retrying in {:?}",
                        e,
                        attempt,
                        self.max_retries,
                        wait
                    );
                    sleep(wait).await;
                    delay = next_backoff(delay);
                }
                other => return other,
            }
        }
    }

    async fn handle_response(response: Response) -> Result<Value, ODataError> {
        let status = response.status();

        if is_session_rejection(status, response.headers()) {
            return Err(ODataError::SessionExpired(status.to_string()));
        }

        match status {
            s if s.is_success() => {
                let body = response.text().await?;
                serde_json::from_str(&body).map_err(|e| {
                    ODataError::ParseError(format!("Failed to parse OData response: {}", e))
                })
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(1);
                Err(ODataError::RateLimited(retry_after))
            }
            StatusCode::NOT_FOUND => {
                let body = response.text().await.unwrap_or_default();
                Err(ODataError::NotFound(error_message(&body)))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ODataError::ServerError(status.as_u16(), error_message(&body)))
            }
        }
    }
}

/// Pause before the next attempt; rate limits use the server's hint
fn retry_wait(error: &ODataError, delay_ms: u64) -> Duration {
    match error {
        ODataError::RateLimited(secs) => Duration::from_secs((*secs).min(MAX_RATE_LIMIT_WAIT_SECS)),
        _ => Duration::from_millis(delay_ms.min(MAX_BACKOFF_MS)),
    }
}

fn next_backoff(delay_ms: u64) -> u64 {
    delay_ms.saturating_mul(2).min(MAX_BACKOFF_MS)
}

/// Pull `error.message.value` out of an OData v2 error body, falling back to
/// the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message/value")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_string())
}
