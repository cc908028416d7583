//! Utility functions for human-readable output.

pub mod format;

pub use format::{format_remaining, mask_token, truncate};
