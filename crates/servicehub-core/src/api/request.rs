use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ApiError;
use crate::auth::Identity;

// ============================================================================
// Endpoints
// ============================================================================

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const ME_PATH: &str = "/auth/me";
pub const REFRESH_PATH: &str = "/auth/token/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const PASSWORD_RESET_PATH: &str = "/auth/password/reset";

/// A replayable description of one API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) body: Option<Value>,
    pub(crate) headers: HeaderMap,
    pub(crate) attach_token: bool,
    pub(crate) refresh_on_401: bool,
    pub(crate) retried: bool,
    pub(crate) form: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
            attach_token: true,
            refresh_on_401: true,
            retried: false,
            form: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to encode request body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// A 401 on this request is returned to the caller instead of
    /// triggering a token refresh.
    pub fn without_refresh(mut self) -> Self {
        self.refresh_on_401 = false;
        self
    }

    /// Send without a bearer token. Implies [`ApiRequest::without_refresh`].
    pub fn anonymous(mut self) -> Self {
        self.attach_token = false;
        self.refresh_on_401 = false;
        self
    }

    /// Report any 4xx other than 429 as [`ApiError::Validation`] so a form
    /// can show the server's messages next to its fields.
    pub fn form(mut self) -> Self {
        self.form = true;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

// ============================================================================
// Auth endpoint payloads
// ============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct LogoutRequest<'a> {
    pub refresh: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct PasswordResetRequest<'a> {
    pub email: &'a str,
}

/// Tokens issued by login and registration.
#[derive(Deserialize)]
pub(crate) struct AuthResponse {
    pub access: String,
    pub refresh: String,
    #[serde(default)]
    pub user: Option<Identity>,
}

#[derive(Deserialize)]
pub(crate) struct RefreshResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}
