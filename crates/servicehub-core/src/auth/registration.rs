//! Account creation payloads for `POST /auth/register/{role}`.

use serde::Serialize;

use super::Role;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerRegistration {
    pub username: String,
    pub email: String,
    pub phone: String,
    pub password: String,
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderRegistration {
    pub email: String,
    pub phone: String,
    pub password: String,
    pub business_name: String,
    pub owner_name: String,
    pub category: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub pincode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gst: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Registration {
    Consumer(ConsumerRegistration),
    Provider(ProviderRegistration),
}

impl Registration {
    pub fn role(&self) -> Role {
        match self {
            Registration::Consumer(_) => Role::Consumer,
            Registration::Provider(_) => Role::Provider,
        }
    }

    /// Request body with the email normalized the way the backend stores it.
    pub(crate) fn body(&self) -> Result<serde_json::Value, serde_json::Error> {
        let mut body = match self {
            Registration::Consumer(payload) => serde_json::to_value(payload)?,
            Registration::Provider(payload) => serde_json::to_value(payload)?,
        };
        if let Some(email) = body.get_mut("email") {
            if let Some(raw) = email.as_str() {
                *email = serde_json::Value::String(normalize_email(raw));
            }
        }
        Ok(body)
    }
}

/// Emails are matched case-insensitively by the backend.
pub(crate) fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}
