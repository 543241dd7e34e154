use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marketplace role an account is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Consumer,
    Provider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Consumer => "consumer",
            Role::Provider => "provider",
        }
    }

    /// Landing screen for this role.
    pub fn home_route(&self) -> &'static str {
        match self {
            Role::Consumer => "/(consumer)/home",
            Role::Provider => "/(provider)/dashboard",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "consumer" => Ok(Role::Consumer),
            "provider" => Ok(Role::Provider),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Role-specific profile data attached to an account.
///
/// The contents belong to the screens that render them, so they stay as
/// raw JSON here.
#[derive(Debug, Clone, PartialEq)]
pub enum Profile {
    Consumer(Value),
    Provider(Value),
}

/// The authenticated user as reported by the identity endpoint.
///
/// Fields are read-only; in particular the role cannot change once the
/// identity exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "UserPayload", into = "UserPayload")]
pub struct Identity {
    id: i64,
    email: String,
    role: Role,
    phone: Option<String>,
    profile: Profile,
}

impl Identity {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }
}

/// Wire shape of a user object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserPayload {
    id: i64,
    #[serde(default)]
    email: String,
    role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    consumer_profile: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provider_profile: Option<Value>,
}

impl TryFrom<UserPayload> for Identity {
    type Error = String;

    fn try_from(payload: UserPayload) -> Result<Self, Self::Error> {
        let present = |v: &Option<Value>| matches!(v, Some(value) if !value.is_null());

        let profile = match payload.role {
            Role::Consumer => {
                if present(&payload.provider_profile) {
                    return Err(format!(
                        "user {} is a consumer but carries a provider profile",
                        payload.id
                    ));
                }
                Profile::Consumer(payload.consumer_profile.unwrap_or(Value::Null))
            }
            Role::Provider => {
                if present(&payload.consumer_profile) {
                    return Err(format!(
                        "user {} is a provider but carries a consumer profile",
                        payload.id
                    ));
                }
                Profile::Provider(payload.provider_profile.unwrap_or(Value::Null))
            }
        };

        Ok(Identity {
            id: payload.id,
            email: payload.email,
            role: payload.role,
            phone: payload.phone,
            profile,
        })
    }
}

impl From<Identity> for UserPayload {
    fn from(identity: Identity) -> Self {
        let (consumer_profile, provider_profile) = match identity.profile {
            Profile::Consumer(v) => (Some(v).filter(|v| !v.is_null()), None),
            Profile::Provider(v) => (None, Some(v).filter(|v| !v.is_null())),
        };
        UserPayload {
            id: identity.id,
            email: identity.email,
            role: identity.role,
            phone: identity.phone,
            consumer_profile,
            provider_profile,
        }
    }
}

/// Who is using the app right now.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    /// Startup identity check has not settled yet.
    #[default]
    Unknown,
    Authenticated(Identity),
    Anonymous,
}

impl SessionState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, SessionState::Unknown)
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, SessionState::Anonymous)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unknown => write!(f, "unknown"),
            SessionState::Anonymous => write!(f, "anonymous"),
            SessionState::Authenticated(identity) => write!(
                f,
                "signed in as {} (#{}, {})",
                identity.email, identity.id, identity.role
            ),
        }
    }
}
