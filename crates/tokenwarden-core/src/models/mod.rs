//! Data models shared between the session core and its collaborators.
//!
//! - `UserProfile`, `UserRole`: the dependent profile data resolved on
//!   sign-in and when a session is restored

pub mod profile;

pub use profile::{UserProfile, UserRole};
