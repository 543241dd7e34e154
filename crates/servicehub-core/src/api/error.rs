use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::auth::StorageError;

/// Key used for messages that are not tied to a single form field.
pub const NON_FIELD_ERRORS: &str = "non_field_errors";

#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Validation failed: {0}")]
    Validation(FieldErrors),

    #[error("Session expired - please sign in again")]
    AuthExpired,

    #[error("Secure storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Unauthorized: {0}")]
    Unauthorized(FieldErrors),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            400 | 409 | 422 => ApiError::Validation(FieldErrors::from_body(body)),
            401 => ApiError::Unauthorized(FieldErrors::from_body(body)),
            403 => ApiError::AccessDenied(Self::truncate_body(body)),
            404 => ApiError::NotFound(Self::truncate_body(body)),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(Self::truncate_body(body)),
            _ => ApiError::InvalidResponse(format!(
                "Status {}: {}",
                status,
                Self::truncate_body(body)
            )),
        }
    }

    /// Errors that must end the session rather than be retried.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::AuthExpired | ApiError::Storage(_))
    }

    /// Mapping for form submissions: every client error except 429 carries
    /// messages the form shows next to its fields.
    pub fn from_form_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            ApiError::Validation(FieldErrors::from_body(body))
        } else {
            Self::from_status(status, body)
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else if err.is_timeout() {
            ApiError::NetworkUnavailable(format!("request timed out: {}", err))
        } else {
            ApiError::NetworkUnavailable(err.to_string())
        }
    }
}

/// Server-reported validation messages keyed by form field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    /// Parse a DRF-style error body (`{"email": ["..."], "detail": "..."}`).
    ///
    /// Anything that is not a JSON object ends up as a single
    /// `non_field_errors` message so the caller always has something to show.
    pub fn from_body(body: &str) -> Self {
        let mut errors = FieldErrors::default();

        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => {
                for (key, value) in map {
                    let field = match key.as_str() {
                        "detail" => NON_FIELD_ERRORS.to_string(),
                        _ => key,
                    };
                    for message in Self::messages_from(&value) {
                        errors.push(&field, message);
                    }
                }
            }
            _ => {
                let trimmed = body.trim();
                if !trimmed.is_empty() {
                    errors.push(NON_FIELD_ERRORS, ApiError::truncate_body(trimmed));
                }
            }
        }

        errors
    }

    fn messages_from(value: &Value) -> Vec<String> {
        match value {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items.iter().flat_map(Self::messages_from).collect(),
            Value::Null => Vec::new(),
            Value::Object(_) => vec![value.to_string()],
            other => vec![other.to_string()],
        }
    }

    pub fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    /// Messages for one field, empty if the server reported none.
    pub fn field(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<String>> {
        self.0
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no details provided");
        }
        let mut first = true;
        for (field, messages) in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{}: {}", field, messages.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_field_errors_from_drf_body() {
        let body = r#"{"email": ["Enter a valid email address."], "password": ["Too short.", "Too common."]}"#;
        let errors = FieldErrors::from_body(body);

        assert_eq!(errors.field("email"), ["Enter a valid email address."]);
        assert_eq!(errors.field("password").len(), 2);
        assert!(errors.field("phone").is_empty());
    }

    #[test]
    fn test_field_errors_detail_maps_to_non_field() {
        let body = r#"{"detail": "No active account found with the given credentials"}"#;
        let errors = FieldErrors::from_body(body);

        assert_eq!(
            errors.field(NON_FIELD_ERRORS),
            ["No active account found with the given credentials"]
        );
    }

    #[test]
    fn test_field_errors_plain_text_body() {
        let errors = FieldErrors::from_body("Bad Request");
        assert_eq!(errors.field(NON_FIELD_ERRORS), ["Bad Request"]);

        assert!(FieldErrors::from_body("").is_empty());
    }

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_REQUEST, "{}"),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, "{}"),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::NOT_FOUND, "missing"),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, ""),
            ApiError::ServerError(_)
        ));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("truncated, 520 total bytes"));
    }

    #[test]
    fn test_form_status_mapping() {
        match ApiError::from_form_status(StatusCode::UNAUTHORIZED, r#"{"detail": "nope"}"#) {
            ApiError::Validation(fields) => assert_eq!(fields.field(NON_FIELD_ERRORS), ["nope"]),
            other => panic!("expected validation error, got {other:?}"),
        }
        match ApiError::from_form_status(StatusCode::FORBIDDEN, r#"{"email": ["Account disabled."]}"#) {
            ApiError::Validation(fields) => assert_eq!(fields.field("email"), ["Account disabled."]),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(matches!(
            ApiError::from_form_status(StatusCode::NOT_FOUND, ""),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from_form_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_form_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            ApiError::ServerError(_)
        ));
    }
}
