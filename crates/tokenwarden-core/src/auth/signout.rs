//! The single path that ends a session.
//!
//! User-initiated sign-out and every terminal failure go through
//! `SignOutService::sign_out`, so clearing state, cutting connections,
//! notifying listeners and navigating happen in one place.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connections::LiveConnections;
use crate::events::{AuthEvent, Listeners, SignOutReason};
use crate::monitor::BackgroundTasks;
use crate::storage::{self, TokenStore};
use crate::ui::{Navigator, UiBinding};

use super::state::{SessionPhase, SharedState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutOutcome {
    Completed,
    /// Another sign-out already ran or is running
    AlreadySigningOut,
}

pub struct SignOutService {
    state: SharedState,
    store: Arc<dyn TokenStore>,
    listeners: Arc<Listeners>,
    ui: Arc<UiBinding>,
    connections: Arc<LiveConnections>,
    navigator: Arc<dyn Navigator>,
    tasks: Arc<BackgroundTasks>,
    user_delay: Duration,
}

impl SignOutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedState,
        store: Arc<dyn TokenStore>,
        listeners: Arc<Listeners>,
        ui: Arc<UiBinding>,
        connections: Arc<LiveConnections>,
        navigator: Arc<dyn Navigator>,
        tasks: Arc<BackgroundTasks>,
        user_delay: Duration,
    ) -> Self {
        Self {
            state,
            store,
            listeners,
            ui,
            connections,
            navigator,
            tasks,
            user_delay,
        }
    }

    /// Failure-triggered sign-out.
    pub async fn force(&self, reason: SignOutReason) -> SignOutOutcome {
        warn!(%reason, "Forcing sign-out");
        self.sign_out(reason).await
    }

    /// End the session. Only the first of concurrent calls does any work,
    /// and a call with nothing left to end is a no-op. The latch is held
    /// only while the teardown runs.
    pub async fn sign_out(&self, reason: SignOutReason) -> SignOutOutcome {
        {
            let mut state = self.state.lock().await;
            if state.is_signing_out {
                debug!(%reason, "Sign-out already in progress, ignoring");
                return SignOutOutcome::AlreadySigningOut;
            }
            if state.phase == SessionPhase::Cleared && !state.has_tokens() && !self.ui.is_signed_in() {
                debug!(%reason, "Already signed out, ignoring");
                return SignOutOutcome::AlreadySigningOut;
            }
            state.is_signing_out = true;
            state.clear();
        }

        info!(%reason, "Signing out");

        let cut = self.connections.disconnect_all();
        if cut > 0 {
            debug!(connections = cut, "Live connections closed");
        }

        if let Err(e) = storage::clear_pair(self.store.as_ref()) {
            warn!(error = %e, "Failed to clear stored tokens");
        }

        self.ui.mark_signed_out();
        self.listeners.emit(&AuthEvent::sign_out(reason));

        if reason.is_user_initiated() {
            // Let in-flight UI updates settle before leaving the screen.
            let navigator = Arc::clone(&self.navigator);
            self.tasks
                .spawn_delayed("sign-out-navigation", self.user_delay, move || {
                    navigator.to_sign_in()
                });
        } else {
            self.navigator.to_sign_in();
        }

        self.state.lock().await.is_signing_out = false;
        SignOutOutcome::Completed
    }
}
