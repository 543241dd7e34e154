//! Core library for servicehub.
//!
//! Authenticated session handling for the marketplace client: secure
//! credential storage, the API request pipeline with single-flight token
//! refresh, the session state machine and role-based route guards.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, AuthEvent, FieldErrors};
pub use auth::{
    decide, CredentialStore, GuardDecision, Identity, Registration, Role, SessionManager,
    SessionState,
};
pub use config::Config;
