//! REST client for the authentication backend.
//!
//! This module provides the `AuthBackend` seam used by the session core
//! (refresh, verify, profile) and `HttpAuthBackend`, its reqwest
//! implementation.
//!
//! The API uses JWT bearer tokens minted by `/token/` and rotated through
//! `/token/refresh/`.

pub mod backend;
pub mod client;
pub mod error;

pub use backend::{AuthBackend, RefreshResponse};
pub use client::HttpAuthBackend;
pub use error::ApiError;
