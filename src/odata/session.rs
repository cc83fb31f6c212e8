//! SAP Gateway session
//!
//! Owns the HTTP transport, the CSRF token and the session cookies SAP hands
//! out on the token fetch. Authentication is serialized through a mutex;
//! established sessions are shared by concurrent readers.

use super::client::ODataError;
use crate::auth::CredentialSet;
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    /// A token fetch is in flight
    Authenticating,
    Authenticated {
        token: String,
        cookies: Option<String>,
        since: Instant,
    },
    /// SAP rejected the cached token or session
    Expired,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Authenticated { .. } => "authenticated",
            Self::Expired => "expired",
            Self::Closed => "closed",
        }
    }
}

/// Token and cookies to attach to one request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token: String,
    pub cookies: Option<String>,
    /// Bumped on every successful authentication
    pub generation: u64,
}

/// One authenticated session against a SAP Gateway host
#[derive(Debug)]
pub struct Session {
    credentials: CredentialSet,
    base_url: Url,
    auth_path: String,
    http_client: Client,
    state: RwLock<SessionState>,
    auth_lock: Mutex<()>,
    generation: AtomicU64,
    created_at: Instant,
}

impl Session {
    /// Create an unauthenticated session. No network traffic happens here.
    pub fn new(credentials: CredentialSet, auth_path: &str) -> Result<Self, ODataError> {
        let base_url = credentials.base_url()?;

        let http_client = Client::builder()
            .timeout(credentials.timeout())
            .danger_accept_invalid_certs(!credentials.verify_ssl)
            .build()?;

        Ok(Self {
            credentials,
            base_url,
            auth_path: auth_path.to_string(),
            http_client,
            state: RwLock::new(SessionState::Unauthenticated),
            auth_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            created_at: Instant::now(),
        })
    }

    pub fn credentials(&self) -> &CredentialSet {
        &self.credentials
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current state. A handshake in flight reports `Authenticating`; the
    /// stored state is only written once a response arrives, so a cancelled
    /// handshake leaves the previous state intact.
    pub async fn state(&self) -> SessionState {
        let stored = self.state.read().await.clone();
        let in_flight = self.auth_lock.try_lock().is_err();
        match stored {
            SessionState::Unauthenticated | SessionState::Expired if in_flight => {
                SessionState::Authenticating
            }
            other => other,
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        matches!(*self.state.read().await, SessionState::Authenticated { .. })
    }

    /// Fetch a CSRF token and session cookies.
    ///
    /// Returns `Ok(false)` when SAP rejects the credentials; only transport
    /// failures are errors.
    pub async fn authenticate(&self) -> Result<bool, ODataError> {
        let _guard = self.auth_lock.lock().await;
        self.handshake().await
    }

    /// Token and cookies for a request, authenticating first if needed
    pub async fn ensure_authenticated(&self) -> Result<AuthContext, ODataError> {
        if let Some(ctx) = self.current_context().await? {
            return Ok(ctx);
        }

        let _guard = self.auth_lock.lock().await;
        // Another task may have finished the handshake while we waited
        if let Some(ctx) = self.current_context().await? {
            return Ok(ctx);
        }

        self.handshake_or_fail().await
    }

    /// Re-authenticate after a request using `seen_generation` was rejected.
    /// Callers that lost the race reuse the session the winner established.
    pub async fn reauthenticate(&self, seen_generation: u64) -> Result<AuthContext, ODataError> {
        let _guard = self.auth_lock.lock().await;

        if self.generation.load(Ordering::SeqCst) != seen_generation {
            if let Some(ctx) = self.current_context().await? {
                tracing::debug!("Session already re-authenticated by another request");
                return Ok(ctx);
            }
        }

        {
            let mut state = self.state.write().await;
            if matches!(*state, SessionState::Authenticated { .. }) {
                *state = SessionState::Expired;
            }
        }

        tracing::info!("SAP session expired, re-authenticating");
        self.handshake_or_fail().await
    }

    /// Release the session. Later requests fail with `SessionClosed`.
    pub async fn close(&self) {
        let _guard = self.auth_lock.lock().await;
        let mut state = self.state.write().await;
        if *state != SessionState::Closed {
            tracing::debug!("Closing SAP session");
        }
        *state = SessionState::Closed;
    }

    /// Attach credentials, token, cookies and JSON headers
    pub fn apply(&self, builder: RequestBuilder, ctx: &AuthContext) -> RequestBuilder {
        let mut builder = self
            .authorize(builder)
            .header(CSRF_HEADER, &ctx.token)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");

        if let Some(ref cookies) = ctx.cookies {
            builder = builder.header(COOKIE, cookies);
        }

        builder
    }

    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .query(&[("sap-client", self.credentials.client.as_str())])
    }

    async fn current_context(&self) -> Result<Option<AuthContext>, ODataError> {
        match &*self.state.read().await {
            SessionState::Authenticated { token, cookies, .. } => Ok(Some(AuthContext {
                token: token.clone(),
                cookies: cookies.clone(),
                generation: self.generation.load(Ordering::SeqCst),
            })),
            SessionState::Closed => Err(ODataError::SessionClosed),
            _ => Ok(None),
        }
    }

    async fn handshake_or_fail(&self) -> Result<AuthContext, ODataError> {
        if !self.handshake().await? {
            return Err(ODataError::AuthenticationFailed(format!(
                "SAP Gateway at {} rejected the credentials for user {}",
                self.base_url, self.credentials.username
            )));
        }

        self.current_context().await?.ok_or_else(|| {
            ODataError::AuthenticationFailed("Session not authenticated after handshake".to_string())
        })
    }

    /// Caller must hold `auth_lock`.
    async fn handshake(&self) -> Result<bool, ODataError> {
        if *self.state.read().await == SessionState::Closed {
            return Err(ODataError::SessionClosed);
        }

        let url = self.base_url.join(&self.auth_path).map_err(|e| {
            ODataError::ParseError(format!("Invalid auth path '{}': {}", self.auth_path, e))
        })?;

        tracing::debug!("Fetching CSRF token from {}", url);

        let response = self
            .authorize(self.http_client.get(url))
            .header(CSRF_HEADER, "Fetch")
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let token = response
            .headers()
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("required"))
            .map(String::from);

        let mut state = self.state.write().await;

        match (status.is_success(), token) {
            (true, Some(token)) => {
                let cookies = collect_cookies(response.headers());
                *state = SessionState::Authenticated {
                    token,
                    cookies,
                    since: Instant::now(),
                };
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(
                    "Authenticated with SAP Gateway {} (client {}, generation {})",
                    self.base_url,
                    self.credentials.client,
                    generation
                );
                Ok(true)
            }
            (true, None) => {
                *state = SessionState::Unauthenticated;
                tracing::warn!("SAP Gateway returned {} without a CSRF token", status);
                Ok(false)
            }
            _ => {
                *state = SessionState::Unauthenticated;
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    tracing::warn!("SAP Gateway rejected authentication: {}", status);
                } else {
                    tracing::warn!("CSRF token fetch failed with status {}", status);
                }
                Ok(false)
            }
        }
    }
}

/// True for responses meaning the token or session is no longer valid
pub fn is_session_rejection(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return true;
    }
    headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("required"))
        .unwrap_or(false)
}

/// Fold `Set-Cookie` headers into a single `Cookie` header value
fn collect_cookies(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect();

    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}
