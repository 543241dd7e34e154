//! Session state and the operations that change it.
//!
//! [`SessionManager`] owns the single authoritative [`SessionState`] and
//! publishes every change on a `watch` channel. Screens subscribe instead of
//! polling; route guards evaluate [`decide`](super::decide) against the
//! current value.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use super::credentials::CachedProfile;
use super::registration::normalize_email;
use super::{decide, Credential, GuardDecision, Identity, Registration, Role, SessionState};
use crate::api::request::{
    AuthResponse, LoginRequest, LogoutRequest, PasswordResetRequest, LOGIN_PATH, LOGOUT_PATH,
    ME_PATH, PASSWORD_RESET_PATH, REGISTER_PATH,
};
use crate::api::{ApiClient, ApiError, ApiRequest, AuthEvent};

/// Upper bound on the advisory logout call.
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

pub type LoginError = ApiError;
pub type RegisterError = ApiError;

type BootstrapOutcome = Shared<BoxFuture<'static, SessionState>>;

struct SessionInner {
    api: ApiClient,
    state: watch::Sender<SessionState>,
    bootstrap: Mutex<Option<BootstrapOutcome>>,
}

impl SessionInner {
    /// Publish a new state. Subscribers are only woken on a real change.
    fn commit(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = %current, to = %next, "Session state changed");
            *current = next;
            true
        });
    }

    /// Leave `Unknown`. Does nothing if another transition got there first.
    fn settle(&self, next: SessionState) -> SessionState {
        self.state.send_if_modified(|current| {
            if !current.is_unknown() {
                return false;
            }
            info!(to = %next, "Session settled");
            *current = next;
            true
        });
        self.state.borrow().clone()
    }
}

/// Owner of the current identity. Clone is cheap and shares state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Create a manager in the `Unknown` state.
    ///
    /// Must be called from within a Tokio runtime: it starts the task that
    /// turns pipeline expiry events into `Anonymous` transitions.
    pub fn new(api: ApiClient) -> Self {
        let (state, _) = watch::channel(SessionState::Unknown);
        let events = api.subscribe_events();
        let inner = Arc::new(SessionInner {
            api,
            state,
            bootstrap: Mutex::new(None),
        });
        spawn_expiry_listener(Arc::downgrade(&inner), events);
        Self { inner }
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn current(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Guard decision for a screen requiring `required_role`.
    pub fn guard(&self, required_role: Option<Role>) -> GuardDecision {
        decide(&self.inner.state.borrow(), required_role)
    }

    // ===== Bootstrap =====

    /// Resolve the startup state from the stored credential.
    ///
    /// Runs at most once per manager. Concurrent and later callers get the
    /// outcome of the first call; the check itself runs on its own task and
    /// finishes even if every caller stops waiting.
    pub async fn bootstrap(&self) -> SessionState {
        let outcome = {
            let mut slot = self.inner.bootstrap.lock().await;
            slot.get_or_insert_with(|| {
                let task = tokio::spawn(self.clone().run_bootstrap());
                let manager = self.clone();
                async move {
                    match task.await {
                        Ok(state) => state,
                        Err(e) => {
                            warn!(error = %e, "Bootstrap task failed");
                            manager.clear_local().await;
                            manager.inner.settle(SessionState::Anonymous)
                        }
                    }
                }
                .boxed()
                .shared()
            })
            .clone()
        };
        outcome.await
    }

    async fn run_bootstrap(self) -> SessionState {
        match self.inner.api.credentials().load().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!("No stored credential");
                return self.inner.settle(SessionState::Anonymous);
            }
            Err(e) => {
                warn!(error = %e, "Cannot read stored credential");
                self.clear_local().await;
                return self.inner.settle(SessionState::Anonymous);
            }
        }

        match self.fetch_identity().await {
            Ok(identity) => self.inner.settle(SessionState::Authenticated(identity)),
            Err(e) => {
                warn!(error = %e, "Stored session is no longer valid");
                self.clear_local().await;
                self.inner.settle(SessionState::Anonymous)
            }
        }
    }

    // ===== Sign in / out =====

    pub async fn login(&self, email: &str, password: &str) -> Result<Identity, LoginError> {
        let email = normalize_email(email);
        let request = ApiRequest::post(LOGIN_PATH)
            .json(&LoginRequest {
                email: &email,
                password,
            })?
            .anonymous()
            .form();

        let auth: AuthResponse = self.inner.api.send_json(request).await?;

        let identity = self.establish(auth, None).await?;
        info!(user_id = identity.id(), role = %identity.role(), "Signed in");
        Ok(identity)
    }

    /// Create an account and sign into it in one step.
    pub async fn register(&self, registration: &Registration) -> Result<Identity, RegisterError> {
        let role = registration.role();
        let body = registration
            .body()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to encode registration: {}", e)))?;
        let request = ApiRequest::post(format!("{}/{}", REGISTER_PATH, role))
            .json(&body)?
            .anonymous()
            .form();

        let auth: AuthResponse = self.inner.api.send_json(request).await?;

        let identity = self.establish(auth, Some(role)).await?;
        info!(user_id = identity.id(), role = %role, "Registered");
        Ok(identity)
    }

    /// Sign out. Local state is cleared first; telling the server is
    /// best-effort and carries on even if the caller stops waiting.
    pub async fn logout(&self) {
        let credential = match self.inner.api.credentials().load().await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Cannot read credential for logout");
                None
            }
        };

        self.clear_local().await;
        self.inner.commit(SessionState::Anonymous);
        info!("Signed out");

        match credential {
            Some(credential) => {
                let revoke = tokio::spawn(revoke_remote(self.inner.api.clone(), credential));
                let _ = revoke.await;
            }
            None => debug!("No stored credential to revoke"),
        }
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<(), ApiError> {
        let email = normalize_email(email);
        let request = ApiRequest::post(PASSWORD_RESET_PATH)
            .json(&PasswordResetRequest { email: &email })?
            .anonymous()
            .form();

        self.inner.api.send(request).await?;
        info!("Password reset requested");
        Ok(())
    }

    /// Last identity seen on this device, for display while offline.
    pub async fn cached_identity(&self) -> Option<CachedProfile> {
        match self.inner.api.credentials().load_profile().await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "Failed to read cached profile");
                None
            }
        }
    }

    // ===== Helpers =====

    /// Store freshly issued tokens and resolve the identity behind them.
    /// On any failure nothing is left stored.
    async fn establish(
        &self,
        auth: AuthResponse,
        expected_role: Option<Role>,
    ) -> Result<Identity, ApiError> {
        self.inner
            .api
            .credentials()
            .store(&Credential::new(auth.access, auth.refresh))
            .await?;

        let identity = match auth.user {
            Some(identity) => {
                self.cache_profile(&identity).await;
                Ok(identity)
            }
            None => self.fetch_identity().await,
        };

        let identity = match identity {
            Ok(identity) => match expected_role {
                Some(role) if identity.role() != role => Err(ApiError::InvalidResponse(format!(
                    "registered as {} but server reports {}",
                    role,
                    identity.role()
                ))),
                _ => Ok(identity),
            },
            Err(e) => Err(e),
        };

        match identity {
            Ok(identity) => {
                self.inner
                    .commit(SessionState::Authenticated(identity.clone()));
                Ok(identity)
            }
            Err(e) => {
                self.clear_local().await;
                Err(e)
            }
        }
    }

    async fn fetch_identity(&self) -> Result<Identity, ApiError> {
        let identity: Identity = self.inner.api.get_json(ME_PATH).await?;
        self.cache_profile(&identity).await;
        Ok(identity)
    }

    async fn cache_profile(&self, identity: &Identity) {
        if let Err(e) = self.inner.api.credentials().store_profile(identity).await {
            warn!(error = %e, "Failed to cache user profile");
        }
    }

    async fn clear_local(&self) {
        if let Err(e) = self.inner.api.credentials().clear().await {
            warn!(error = %e, "Failed to clear stored credentials");
        }
    }
}

/// Tell the server to drop the session behind an already cleared credential.
async fn revoke_remote(api: ApiClient, credential: Credential) {
    let request = match ApiRequest::post(LOGOUT_PATH).json(&LogoutRequest {
        refresh: &credential.refresh_token,
    }) {
        Ok(request) => request.anonymous(),
        Err(e) => {
            warn!(error = %e, "Failed to build logout request");
            return;
        }
    };
    // The store is already empty, so the bearer goes on by hand.
    let request = match HeaderValue::from_str(&format!("Bearer {}", credential.access_token)) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.header(AUTHORIZATION, value)
        }
        Err(e) => {
            warn!(error = %e, "Access token is not a valid header value");
            request
        }
    };

    match tokio::time::timeout(LOGOUT_TIMEOUT, api.send(request)).await {
        Ok(Ok(_)) => debug!("Server session revoked"),
        Ok(Err(e)) => warn!(error = %e, "Remote logout failed"),
        Err(_) => warn!("Remote logout timed out"),
    }
}

/// Commit `Anonymous` whenever the pipeline gives up on the session.
fn spawn_expiry_listener(inner: Weak<SessionInner>, mut events: broadcast::Receiver<AuthEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AuthEvent::SessionExpired) => {
                    let Some(inner) = inner.upgrade() else { break };
                    // A sign-in may have completed since the store was cleared.
                    if let Ok(Some(_)) = inner.api.credentials().load().await {
                        debug!("Ignoring expiry, a newer credential is stored");
                        continue;
                    }
                    warn!("Session expired");
                    inner.commit(SessionState::Anonymous);
                }
                Ok(AuthEvent::TokensRefreshed) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let Some(inner) = inner.upgrade() else { break };
                    warn!(skipped, "Missed auth events, rechecking credentials");
                    if let Ok(None) = inner.api.credentials().load().await {
                        if inner.state.borrow().is_authenticated() {
                            inner.commit(SessionState::Anonymous);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
