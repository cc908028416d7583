//! Token validity decisions.
//!
//! Local checks are pure functions of `(token, now)`. Remote verification
//! goes through the backend but is cached for a short window, and the cached
//! verdict is always combined with a live local expiry check so a token that
//! expired after the last server round-trip is still rejected.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use crate::api::AuthBackend;

use super::state::{ServerValidation, SharedState};
use super::token::Token;
use super::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidityVerdict {
    Valid,
    NeedsProactiveRefresh,
    Expired,
    Unparseable,
}

impl ValidityVerdict {
    /// Still accepted by the server (possibly only briefly).
    pub fn is_usable(&self) -> bool {
        matches!(self, ValidityVerdict::Valid | ValidityVerdict::NeedsProactiveRefresh)
    }
}

/// Signed milliseconds until expiry, `None` if the expiry cannot be read.
fn remaining_ms(token: &Token, now: DateTime<Utc>) -> Option<i64> {
    let expires_at = token.expires_at()?;
    Some((expires_at - now).num_milliseconds())
}

/// `expiry - now`, clamped at zero. Unparseable tokens have no time left.
pub fn time_until_expiry_at(token: &Token, now: DateTime<Utc>) -> Duration {
    match remaining_ms(token, now) {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::ZERO,
    }
}

pub fn classify_at(token: &Token, now: DateTime<Utc>, threshold: Duration) -> ValidityVerdict {
    let Some(ms) = remaining_ms(token, now) else {
        return ValidityVerdict::Unparseable;
    };
    if ms <= 0 {
        ValidityVerdict::Expired
    } else if (ms as u128) < threshold.as_millis() {
        ValidityVerdict::NeedsProactiveRefresh
    } else {
        ValidityVerdict::Valid
    }
}

pub struct ValidityOracle {
    refresh_threshold: Duration,
    cache_window: Duration,
    state: SharedState,
    backend: Arc<dyn AuthBackend>,
}

impl ValidityOracle {
    pub fn new(
        refresh_threshold: Duration,
        cache_window: Duration,
        state: SharedState,
        backend: Arc<dyn AuthBackend>,
    ) -> Self {
        Self {
            refresh_threshold,
            cache_window,
            state,
            backend,
        }
    }

    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    pub fn classify(&self, token: &Token) -> ValidityVerdict {
        classify_at(token, Utc::now(), self.refresh_threshold)
    }

    pub fn time_until_expiry(&self, token: &Token) -> Duration {
        time_until_expiry_at(token, Utc::now())
    }

    /// Ask the server whether `token` is valid, reusing a recent answer for
    /// the same token.
    pub async fn validate_remotely(&self, token: &Token) -> Result<bool, AuthError> {
        if !self.classify(token).is_usable() {
            debug!("Token locally expired or unparseable, skipping server check");
            return Ok(false);
        }

        let epoch = {
            let state = self.state.lock().await;
            if let Some(cached) = &state.last_server_validation {
                if cached.token == *token && cached.checked_at.elapsed() < self.cache_window {
                    debug!(valid = cached.valid, "Using cached server validation");
                    return Ok(cached.valid);
                }
            }
            state.epoch
        };

        let valid = self
            .backend
            .verify(token.as_str())
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.epoch == epoch {
            state.last_server_validation = Some(ServerValidation {
                token: token.clone(),
                valid,
                checked_at: Instant::now(),
            });
        }
        debug!(valid, "Server validation complete");
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::state::SessionState;
    use crate::auth::testing::{mint_token, mint_token_at, FakeBackend};
    use chrono::TimeZone;

    const THRESHOLD: Duration = Duration::from_secs(10);

    fn fixed_now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000, 0).single().expect("valid timestamp")
    }

    #[test]
    fn test_classify_near_expiry() {
        let now = fixed_now();
        let token = mint_token_at(now.timestamp() + 5);
        assert_eq!(classify_at(&token, now, THRESHOLD), ValidityVerdict::NeedsProactiveRefresh);
        // Same inputs, same verdict
        assert_eq!(classify_at(&token, now, THRESHOLD), ValidityVerdict::NeedsProactiveRefresh);
    }

    #[test]
    fn test_classify_expired_and_valid() {
        let now = fixed_now();
        assert_eq!(
            classify_at(&mint_token_at(now.timestamp() - 1), now, THRESHOLD),
            ValidityVerdict::Expired
        );
        assert_eq!(
            classify_at(&mint_token_at(now.timestamp()), now, THRESHOLD),
            ValidityVerdict::Expired
        );
        assert_eq!(
            classify_at(&mint_token_at(now.timestamp() + 600), now, THRESHOLD),
            ValidityVerdict::Valid
        );
    }

    #[test]
    fn test_classify_unparseable() {
        let now = fixed_now();
        assert_eq!(
            classify_at(&Token::new("garbage"), now, THRESHOLD),
            ValidityVerdict::Unparseable
        );
        assert_eq!(time_until_expiry_at(&Token::new("garbage"), now), Duration::ZERO);
    }

    #[test]
    fn test_time_until_expiry() {
        let now = fixed_now();
        let token = mint_token_at(now.timestamp() + 90);
        assert_eq!(time_until_expiry_at(&token, now), Duration::from_secs(90));
        let expired = mint_token_at(now.timestamp() - 90);
        assert_eq!(time_until_expiry_at(&expired, now), Duration::ZERO);
    }

    fn oracle(backend: Arc<FakeBackend>) -> ValidityOracle {
        ValidityOracle::new(
            THRESHOLD,
            Duration::from_secs(30),
            SessionState::new_shared(),
            backend,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_validation_is_cached_within_window() {
        let backend = Arc::new(FakeBackend::new());
        let oracle = oracle(Arc::clone(&backend));
        let token = mint_token(3600);

        assert!(oracle.validate_remotely(&token).await.expect("first"));
        assert!(oracle.validate_remotely(&token).await.expect("cached"));
        assert_eq!(backend.verify_calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(oracle.validate_remotely(&token).await.expect("after window"));
        assert_eq!(backend.verify_calls(), 2);
    }

    #[tokio::test]
    async fn test_remote_validation_rejects_expired_without_call() {
        let backend = Arc::new(FakeBackend::new());
        let oracle = oracle(Arc::clone(&backend));
        assert!(!oracle.validate_remotely(&mint_token(-5)).await.expect("expired"));
        assert_eq!(backend.verify_calls(), 0);
    }

    #[tokio::test]
    async fn test_server_rejection_is_cached() {
        let backend = Arc::new(FakeBackend::new());
        backend.set_verify_result(false);
        let oracle = oracle(Arc::clone(&backend));
        let token = mint_token(3600);
        assert!(!oracle.validate_remotely(&token).await.expect("rejected"));
        assert!(!oracle.validate_remotely(&token).await.expect("cached rejection"));
        assert_eq!(backend.verify_calls(), 1);
    }

    #[tokio::test]
    async fn test_cached_verdict_combined_with_live_expiry() {
        let backend = Arc::new(FakeBackend::new());
        let oracle = oracle(Arc::clone(&backend));
        // Expires in just over a second: server says valid, then it lapses
        // while the cache entry is still fresh.
        let token = mint_token_at(Utc::now().timestamp() + 2);
        assert!(oracle.validate_remotely(&token).await.expect("valid now"));
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(!oracle.validate_remotely(&token).await.expect("expired locally"));
        assert_eq!(backend.verify_calls(), 1);
    }
}
