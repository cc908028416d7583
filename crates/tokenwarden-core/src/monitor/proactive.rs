//! Refresh the access token shortly before it lapses, so requests rarely
//! have to wait on a refresh.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::auth::{RefreshCoordinator, SharedState, ValidityOracle, ValidityVerdict};

use super::BackgroundTasks;

pub struct ProactiveRefresher {
    state: SharedState,
    oracle: Arc<ValidityOracle>,
    coordinator: Arc<RefreshCoordinator>,
}

impl ProactiveRefresher {
    pub fn new(
        state: SharedState,
        oracle: Arc<ValidityOracle>,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            state,
            oracle,
            coordinator,
        }
    }

    pub fn start(self: &Arc<Self>, tasks: &BackgroundTasks, every: Duration) {
        let refresher = Arc::clone(self);
        tasks.spawn_periodic("proactive-refresh", every, move || {
            let refresher = Arc::clone(&refresher);
            async move {
                refresher.check().await;
            }
        });
    }

    /// Returns true if a refresh ran and succeeded.
    pub async fn check(&self) -> bool {
        let (access, refresh) = {
            let state = self.state.lock().await;
            if state.is_refreshing || state.is_signing_out {
                return false;
            }
            match (state.access.clone(), state.refresh.clone()) {
                (Some(access), refresh) => (access, refresh),
                (None, _) => return false,
            }
        };

        let due = match self.oracle.classify(&access) {
            ValidityVerdict::NeedsProactiveRefresh => true,
            ValidityVerdict::Expired => refresh
                .as_ref()
                .map(|t| self.oracle.classify(t).is_usable())
                .unwrap_or(false),
            ValidityVerdict::Valid | ValidityVerdict::Unparseable => false,
        };
        if !due {
            return false;
        }

        debug!(
            remaining_ms = self.oracle.time_until_expiry(&access).as_millis() as u64,
            "Access token near expiry, refreshing"
        );
        match self.coordinator.refresh().await {
            Ok(_) => {
                info!("Proactive refresh succeeded");
                true
            }
            Err(e) => {
                warn!(error = %e, "Proactive refresh failed");
                false
            }
        }
    }
}
