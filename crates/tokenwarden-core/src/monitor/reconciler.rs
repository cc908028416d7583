//! Periodic check that the UI's "signed in" flag matches the tokens we
//! actually hold, repairing drift in either direction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::AuthBackend;
use crate::auth::{RefreshCoordinator, SharedState, SignOutService, Token, ValidityOracle};
use crate::events::SignOutReason;
use crate::models::UserRole;
use crate::storage::{self, TokenStore};
use crate::ui::{UiAuthState, UiBinding};

use super::BackgroundTasks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Previous tick still running, or a refresh/sign-out in progress
    Skipped,
    Consistent,
    Refreshed,
    Restored(UserRole),
    SignedOut(SignOutReason),
    /// A transient failure; the next tick will look again
    Deferred,
}

struct Observed {
    access: Option<Token>,
    refresh: Option<Token>,
    epoch: u64,
    from_storage: bool,
}

pub struct ConsistencyReconciler {
    state: SharedState,
    store: Arc<dyn TokenStore>,
    backend: Arc<dyn AuthBackend>,
    oracle: Arc<ValidityOracle>,
    coordinator: Arc<RefreshCoordinator>,
    signout: Arc<SignOutService>,
    ui: Arc<UiBinding>,
    running: Mutex<()>,
}

impl ConsistencyReconciler {
    pub fn new(
        state: SharedState,
        store: Arc<dyn TokenStore>,
        backend: Arc<dyn AuthBackend>,
        oracle: Arc<ValidityOracle>,
        coordinator: Arc<RefreshCoordinator>,
        signout: Arc<SignOutService>,
        ui: Arc<UiBinding>,
    ) -> Self {
        Self {
            state,
            store,
            backend,
            oracle,
            coordinator,
            signout,
            ui,
            running: Mutex::new(()),
        }
    }

    /// Run every `interval`, and once `settle` after each change of the UI
    /// flag.
    pub fn start(
        self: &Arc<Self>,
        tasks: &BackgroundTasks,
        interval: Duration,
        settle: Duration,
        mut ui_changes: watch::Receiver<UiAuthState>,
    ) {
        let periodic = Arc::clone(self);
        tasks.spawn_periodic("reconciler", interval, move || {
            let reconciler = Arc::clone(&periodic);
            async move {
                reconciler.tick().await;
            }
        });

        let on_change = Arc::clone(self);
        tasks.spawn("reconciler-settle", async move {
            while ui_changes.changed().await.is_ok() {
                tokio::time::sleep(settle).await;
                on_change.tick().await;
            }
        });
    }

    /// Memory first; storage only when memory holds nothing.
    async fn observe(&self) -> Option<Observed> {
        let state = self.state.lock().await;
        if state.is_refreshing || state.is_signing_out {
            return None;
        }
        if state.has_tokens() {
            return Some(Observed {
                access: state.access.clone(),
                refresh: state.refresh.clone(),
                epoch: state.epoch,
                from_storage: false,
            });
        }
        let (access, refresh) = match storage::load_pair(self.store.as_ref()) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Failed to read stored tokens");
                (None, None)
            }
        };
        Some(Observed {
            access: access.and_then(|raw| Token::parse(raw).ok()),
            refresh: refresh.and_then(|raw| Token::parse(raw).ok()),
            epoch: state.epoch,
            from_storage: true,
        })
    }

    /// Put stored tokens back in memory unless the session moved on.
    async fn restore_into_memory(&self, observed: &Observed) -> bool {
        let mut state = self.state.lock().await;
        if state.epoch != observed.epoch || state.has_tokens() || state.is_signing_out {
            return false;
        }
        debug!("Reloading stored tokens into memory");
        state.install_pair(observed.access.clone(), observed.refresh.clone());
        true
    }

    fn usable(&self, token: &Option<Token>) -> bool {
        token
            .as_ref()
            .map(|t| self.oracle.classify(t).is_usable())
            .unwrap_or(false)
    }

    pub async fn tick(&self) -> ReconcileOutcome {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Reconcile already running, skipping tick");
            return ReconcileOutcome::Skipped;
        };
        let Some(observed) = self.observe().await else {
            return ReconcileOutcome::Skipped;
        };

        let has_tokens = observed.access.is_some() || observed.refresh.is_some();
        let outcome = if self.ui.is_signed_in() {
            self.reconcile_signed_in(&observed, has_tokens).await
        } else {
            self.reconcile_signed_out(&observed).await
        };
        debug!(?outcome, "Reconcile tick complete");
        outcome
    }

    async fn reconcile_signed_in(&self, observed: &Observed, has_tokens: bool) -> ReconcileOutcome {
        if !has_tokens {
            warn!("UI signed in but no tokens anywhere");
            self.signout.force(SignOutReason::StateInconsistencyNoTokens).await;
            return ReconcileOutcome::SignedOut(SignOutReason::StateInconsistencyNoTokens);
        }
        if observed.from_storage && !self.restore_into_memory(observed).await {
            return ReconcileOutcome::Skipped;
        }
        if self.usable(&observed.access) {
            return ReconcileOutcome::Consistent;
        }
        if !self.usable(&observed.refresh) {
            warn!("UI signed in but both tokens expired");
            self.signout
                .force(SignOutReason::StateInconsistencyExpiredTokens)
                .await;
            return ReconcileOutcome::SignedOut(SignOutReason::StateInconsistencyExpiredTokens);
        }
        match self.coordinator.refresh().await {
            Ok(_) => {
                info!("Reconciler refreshed expired access token");
                ReconcileOutcome::Refreshed
            }
            Err(e) => {
                warn!(error = %e, "Reconciler refresh failed");
                ReconcileOutcome::Deferred
            }
        }
    }

    async fn reconcile_signed_out(&self, observed: &Observed) -> ReconcileOutcome {
        if !self.usable(&observed.access) && !self.usable(&observed.refresh) {
            return ReconcileOutcome::Consistent;
        }
        info!("Valid tokens found while signed out, restoring session");
        if observed.from_storage && !self.restore_into_memory(observed).await {
            return ReconcileOutcome::Skipped;
        }

        let access = match &observed.access {
            Some(token) if self.usable(&observed.access) => token.clone(),
            _ => match self.coordinator.refresh().await {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "Restore refresh failed");
                    return ReconcileOutcome::Deferred;
                }
            },
        };

        match self.backend.fetch_profile(access.as_str()).await {
            Ok(profile) => {
                if self.state.lock().await.is_signing_out {
                    return ReconcileOutcome::Skipped;
                }
                info!(role = %profile.role, "Session restored");
                self.ui.mark_signed_in(profile.role);
                ReconcileOutcome::Restored(profile.role)
            }
            Err(e) => {
                warn!(error = %e, "Profile fetch failed during restore");
                ReconcileOutcome::Deferred
            }
        }
    }
}
