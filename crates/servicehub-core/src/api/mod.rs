//! REST API client module for the marketplace backend.
//!
//! This module provides the `ApiClient` request pipeline. Requests carry
//! the stored JWT bearer token; expired tokens are refreshed once per
//! expiry through the `/auth/token/refresh` endpoint and the failed
//! requests are replayed.

pub mod client;
pub mod error;
pub mod request;

pub use client::{ApiClient, AuthEvent};
pub use error::{ApiError, FieldErrors};
pub use request::ApiRequest;
