//! HTTP request pipeline for the marketplace API.
//!
//! Every call goes through [`ApiClient::send`], which attaches the stored
//! bearer token and handles expired tokens:
//!
//! - a 401 suspends the request on the pending queue;
//! - the first suspended request starts the one refresh for that expiry
//!   on a detached task, later ones just wait for it;
//! - when the refresh settles, queued requests are resumed in the order they
//!   joined, each replaying its call once with the new token;
//! - a second 401 or a failed refresh ends the session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, warn};

use super::request::{ApiRequest, RefreshRequest, RefreshResponse, REFRESH_PATH};
use super::ApiError;
use crate::auth::CredentialStore;
use crate::config::Config;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Capacity of the auth event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session-level outcomes of the pipeline's token handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    TokensRefreshed,
    /// Credentials were cleared; the user must sign in again.
    SessionExpired,
}

type Waiter = oneshot::Sender<Result<String, ()>>;

/// Requests suspended until the in-flight refresh settles.
#[derive(Default)]
struct PendingRequestQueue {
    refreshing: bool,
    waiters: VecDeque<Waiter>,
}

enum RefreshFailure {
    /// The refresh itself failed; the session is over.
    Rejected(ApiError),
    /// The stored credential changed under the refresh (logout or a new
    /// login). Nothing to clear, the waiting requests just fail.
    Superseded,
}

struct ClientInner {
    http: Client,
    base_url: String,
    credentials: CredentialStore,
    pending: Mutex<PendingRequestQueue>,
    events: broadcast::Sender<AuthEvent>,
    initial_backoff: Duration,
}

/// API client for the marketplace backend.
/// Clone is cheap - all clones share the connection pool, the credential
/// store and the pending queue.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    /// Create a client for the configured server.
    pub fn new(config: &Config, credentials: CredentialStore) -> Result<Self, ApiError> {
        Self::build(&config.api_base_url, config.request_timeout(), credentials)
    }

    pub fn build(
        base_url: &str,
        timeout: Duration,
        credentials: CredentialStore,
    ) -> Result<Self, ApiError> {
        Self::build_with_backoff(
            base_url,
            timeout,
            Duration::from_millis(INITIAL_BACKOFF_MS),
            credentials,
        )
    }

    pub(crate) fn build_with_backoff(
        base_url: &str,
        timeout: Duration,
        initial_backoff: Duration,
        credentials: CredentialStore,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
                credentials,
                pending: Mutex::new(PendingRequestQueue::default()),
                events,
                initial_backoff,
            }),
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn notify(&self, event: AuthEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.inner.base_url, path)
        } else {
            format!("{}/{}", self.inner.base_url, path)
        }
    }

    // ===== Pipeline =====

    /// Send a request, refreshing the access token once if it has expired.
    ///
    /// Non-2xx responses are mapped to [`ApiError`].
    pub async fn send(&self, request: ApiRequest) -> Result<Response, ApiError> {
        let mut request = request;
        let mut token = if request.attach_token {
            self.stored_access_token().await?
        } else {
            None
        };

        loop {
            let response = self.dispatch(&request, token.as_deref()).await?;

            if response.status() != StatusCode::UNAUTHORIZED || !request.refresh_on_401 {
                return Self::check_response(response, request.form).await;
            }

            if request.retried {
                warn!(path = %request.path, "Still unauthorized after token refresh");
                self.expire_session().await;
                return Err(ApiError::AuthExpired);
            }

            request.retried = true;
            debug!(path = %request.path, "Unauthorized, waiting for token refresh");
            token = Some(self.refreshed_token(token.as_deref()).await?);
        }
    }

    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ApiError> {
        let path = request.path.clone();
        let response = self.send(request).await?;
        response.json().await.map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }

    /// Read the access token for the request transform. Storage failures
    /// fail closed.
    async fn stored_access_token(&self) -> Result<Option<String>, ApiError> {
        match self.inner.credentials.access_token().await {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!(error = %e, "Cannot read credentials, ending session");
                self.expire_session().await;
                Err(ApiError::Storage(e))
            }
        }
    }

    /// Send one attempt, backing off on 429 responses.
    async fn dispatch(&self, request: &ApiRequest, token: Option<&str>) -> Result<Response, ApiError> {
        let url = self.url(&request.path);
        let mut retries = 0;
        let mut backoff = self.inner.initial_backoff;

        loop {
            let mut builder = self
                .inner
                .http
                .request(request.method.clone(), &url)
                .headers(request.headers.clone());
            if let Some(token) = token {
                builder = builder.bearer_auth(token);
            }
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                debug!(url = %url, error = %e, "Request failed");
                ApiError::from(e)
            })?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response, form: bool) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if form {
                Err(ApiError::from_form_status(status, &body))
            } else {
                Err(ApiError::from_status(status, &body))
            }
        }
    }

    // ===== Refresh =====

    /// Wait for a token newer than `stale`, starting a refresh if none is
    /// in flight.
    async fn refreshed_token(&self, stale: Option<&str>) -> Result<String, ApiError> {
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;

            if !pending.refreshing {
                // A refresh may have finished after this request went out.
                if let Some(current) = self.stored_access_token().await? {
                    if Some(current.as_str()) != stale {
                        debug!("Token already refreshed, replaying");
                        return Ok(current);
                    }
                }

                pending.refreshing = true;
                pending.waiters.push_back(tx);

                // Detached so that callers giving up cannot cancel a refresh
                // other requests are queued on.
                let client = self.clone();
                tokio::spawn(async move { client.run_refresh().await });
            } else {
                pending.waiters.push_back(tx);
                debug!(queued = pending.waiters.len(), "Joined pending refresh");
            }
        }

        match rx.await {
            Ok(Ok(token)) => Ok(token),
            _ => Err(ApiError::AuthExpired),
        }
    }

    async fn run_refresh(self) {
        let outcome = self.exchange_refresh_token().await;

        let result = match outcome {
            Ok(token) => {
                info!("Access token refreshed");
                self.notify(AuthEvent::TokensRefreshed);
                Ok(token)
            }
            Err(RefreshFailure::Rejected(e)) => {
                warn!(error = %e, "Token refresh failed, ending session");
                self.expire_session().await;
                Err(())
            }
            Err(RefreshFailure::Superseded) => {
                debug!("Credential changed during refresh, dropping result");
                Err(())
            }
        };

        let waiters = {
            let mut pending = self.inner.pending.lock().await;
            pending.refreshing = false;
            std::mem::take(&mut pending.waiters)
        };

        debug!(count = waiters.len(), "Resuming queued requests");
        for waiter in waiters {
            // Callers that went away have dropped their receiver.
            let _ = waiter.send(result.clone());
        }
    }

    async fn exchange_refresh_token(&self) -> Result<String, RefreshFailure> {
        let refresh_token = self
            .inner
            .credentials
            .refresh_token()
            .await
            .map_err(|e| RefreshFailure::Rejected(e.into()))?
            .ok_or_else(|| {
                RefreshFailure::Rejected(ApiError::Unauthorized(Default::default()))
            })?;

        let request = ApiRequest::post(REFRESH_PATH)
            .json(&RefreshRequest {
                refresh: &refresh_token,
            })
            .map_err(RefreshFailure::Rejected)?
            .anonymous();

        // Sent outside the pipeline: a 401 here is final.
        let response = self
            .dispatch(&request, None)
            .await
            .map_err(RefreshFailure::Rejected)?;
        let response = Self::check_response(response, false)
            .await
            .map_err(RefreshFailure::Rejected)?;
        let refreshed: RefreshResponse = response.json().await.map_err(|e| {
            RefreshFailure::Rejected(ApiError::InvalidResponse(format!(
                "Failed to parse refresh response: {}",
                e
            )))
        })?;

        match self
            .inner
            .credentials
            .rotate(&refresh_token, &refreshed.access, refreshed.refresh.as_deref())
            .await
        {
            Ok(Some(credential)) => Ok(credential.access_token),
            Ok(None) => Err(RefreshFailure::Superseded),
            Err(e) => Err(RefreshFailure::Rejected(e.into())),
        }
    }

    /// Clear credentials and tell the session manager the user is signed out.
    async fn expire_session(&self) {
        if let Err(e) = self.inner.credentials.clear().await {
            warn!(error = %e, "Failed to clear credentials");
        }
        self.notify(AuthEvent::SessionExpired);
    }
}
