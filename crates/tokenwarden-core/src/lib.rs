//! Tokenwarden core: session and token lifecycle for API clients that use
//! short-lived access tokens and longer-lived refresh tokens.
//!
//! The entry point is `SessionManager`. It stores the token pair, refreshes
//! it single-flight, attaches it to outgoing requests through
//! `RequestPipeline`, and keeps the UI's signed-in flag consistent with what
//! is actually held.

pub mod api;
pub mod auth;
pub mod config;
pub mod connections;
pub mod events;
pub mod models;
pub mod monitor;
pub mod pipeline;
pub mod session;
pub mod storage;
pub mod ui;
pub mod utils;

pub use api::{ApiError, AuthBackend, HttpAuthBackend};
pub use auth::{AuthError, SessionPhase, SignOutOutcome, Token, ValidityVerdict};
pub use config::Config;
pub use events::{AuthEvent, AuthEventKind, SignOutReason, Subscription};
pub use models::{UserProfile, UserRole};
pub use pipeline::{PipelineError, RequestPipeline};
pub use session::SessionManager;
pub use storage::{StorageKind, TokenStore};
