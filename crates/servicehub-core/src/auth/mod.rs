//! Authentication module: credentials, identity and session state.
//!
//! This module provides:
//! - `CredentialStore`: token pair storage in the OS keychain via keyring
//! - `SessionManager`: the current `SessionState` and the operations that
//!   change it (bootstrap, login, register, logout)
//! - `decide`: the route guard for role-gated screens

pub mod credentials;
pub mod guard;
pub mod identity;
pub mod registration;
pub mod session;

pub use credentials::{
    CachedProfile, Credential, CredentialStore, KeyringBackend, MemoryBackend, SecretBackend,
    StorageError, DEFAULT_SERVICE_NAME,
};
pub use guard::{decide, GuardDecision, LOGIN_ROUTE};
pub use identity::{Identity, Profile, Role, SessionState};
pub use registration::{ConsumerRegistration, ProviderRegistration, Registration};
pub use session::{LoginError, RegisterError, SessionManager};
