use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::auth::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Try one refresh-and-replay cycle
    Retry,
    /// Give up and sign out
    Trip,
}

/// Consecutive-401 circuit breaker. The counters live on the session state
/// so they are cleared together with it.
#[derive(Debug, Clone, Copy)]
pub struct AuthFailureBreaker {
    max_retries: u32,
    reset_window: Duration,
}

impl AuthFailureBreaker {
    pub fn new(max_retries: u32, reset_window: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            reset_window,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Count one authorization failure seen at `now`. A failure more than
    /// the reset window after the previous one starts a fresh count.
    pub fn record_failure(&self, state: &mut SessionState, now: Instant) -> BreakerDecision {
        if let Some(last) = state.last_failure_at {
            if now.saturating_duration_since(last) > self.reset_window {
                debug!("Auth failure window elapsed, resetting count");
                state.reset_failures();
            }
        }
        state.consecutive_auth_failures += 1;
        state.last_failure_at = Some(now);

        if state.consecutive_auth_failures >= self.max_retries {
            BreakerDecision::Trip
        } else {
            BreakerDecision::Retry
        }
    }

    /// After a failed refresh: is the session one failure away from tripping?
    pub fn exhausted(&self, state: &SessionState) -> bool {
        state.consecutive_auth_failures >= self.max_retries.saturating_sub(1)
    }

    pub fn record_success(&self, state: &mut SessionState) {
        if state.consecutive_auth_failures > 0 {
            debug!(failures = state.consecutive_auth_failures, "Request succeeded, resetting auth failures");
            state.reset_failures();
        }
    }
}
