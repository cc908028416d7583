//! Session authentication core.
//!
//! - `token`: JWT wrapper and claims decoding
//! - `state`: the shared in-memory session state
//! - `validity`: local expiry classification and cached server verification
//! - `refresh`: single-flight token refresh
//! - `signout`: the one path that ends a session

pub mod error;
pub mod refresh;
pub mod signout;
pub mod state;
pub mod token;
pub mod validity;

#[cfg(test)]
pub mod testing;

pub use error::AuthError;
pub use refresh::RefreshCoordinator;
pub use signout::{SignOutOutcome, SignOutService};
pub use state::{SessionPhase, SessionSnapshot, SessionState, SharedState};
pub use token::{Token, TokenClaims, TokenPair};
pub use validity::{ValidityOracle, ValidityVerdict};
