//! Session lifecycle for Tokenwarden.
//!
//! `SessionManager` owns one independent session: its shared state, the
//! token store, the refresh coordinator, the request pipeline and the
//! background reconciler and proactive refresher. Nothing here is global;
//! tests build as many managers as they like.
//!
//! Lifecycle: `new` → `initialize` (restore from storage, start background
//! tasks) → ... → `teardown` (stop and join every background task).

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::AuthBackend;
use crate::auth::{
    AuthError, RefreshCoordinator, SessionPhase, SessionSnapshot, SessionState, SharedState, SignOutOutcome,
    SignOutService, Token, ValidityOracle,
};
use crate::config::{Config, SessionConfig};
use crate::connections::LiveConnections;
use crate::events::{AuthEvent, Listeners, SignOutReason, Subscription};
use crate::models::UserRole;
use crate::monitor::{BackgroundTasks, ConsistencyReconciler, ProactiveRefresher, ReconcileOutcome};
use crate::pipeline::{AuthFailureBreaker, EndpointPolicy, RequestPipeline};
use crate::storage::{self, TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
use crate::ui::{LogNavigator, Navigator, UiAuthState, UiBinding};

/// Long-lived parts every component is built from.
struct Parts {
    config: SessionConfig,
    api_base_url: String,
    client: Client,
    state: SharedState,
    store: Arc<dyn TokenStore>,
    backend: Arc<dyn AuthBackend>,
    listeners: Arc<Listeners>,
    ui: Arc<UiBinding>,
    connections: Arc<LiveConnections>,
    navigator: Arc<dyn Navigator>,
    tasks: Arc<BackgroundTasks>,
    oracle: Arc<ValidityOracle>,
}

/// Components that hold the navigator or connections; rebuilt when either
/// is swapped.
struct Wiring {
    signout: Arc<SignOutService>,
    coordinator: Arc<RefreshCoordinator>,
    reconciler: Arc<ConsistencyReconciler>,
    proactive: Arc<ProactiveRefresher>,
    pipeline: Arc<RequestPipeline>,
}

impl Wiring {
    fn build(p: &Parts) -> Self {
        let signout = Arc::new(SignOutService::new(
            Arc::clone(&p.state),
            Arc::clone(&p.store),
            Arc::clone(&p.listeners),
            Arc::clone(&p.ui),
            Arc::clone(&p.connections),
            Arc::clone(&p.navigator),
            Arc::clone(&p.tasks),
            p.config.user_sign_out_delay(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&p.state),
            Arc::clone(&p.store),
            Arc::clone(&p.backend),
            Arc::clone(&p.oracle),
            Arc::clone(&signout),
            p.config.waiter_timeout(),
        ));
        let reconciler = Arc::new(ConsistencyReconciler::new(
            Arc::clone(&p.state),
            Arc::clone(&p.store),
            Arc::clone(&p.backend),
            Arc::clone(&p.oracle),
            Arc::clone(&coordinator),
            Arc::clone(&signout),
            Arc::clone(&p.ui),
        ));
        let proactive = Arc::new(ProactiveRefresher::new(
            Arc::clone(&p.state),
            Arc::clone(&p.oracle),
            Arc::clone(&coordinator),
        ));
        let pipeline = Arc::new(RequestPipeline::new(
            p.client.clone(),
            &p.api_base_url,
            EndpointPolicy::from_config(&p.config),
            AuthFailureBreaker::new(p.config.max_auth_retries, p.config.error_reset_window()),
            Arc::clone(&p.state),
            Arc::clone(&coordinator),
            Arc::clone(&signout),
        ));
        Self {
            signout,
            coordinator,
            reconciler,
            proactive,
            pipeline,
        }
    }
}

pub struct SessionManager {
    parts: Parts,
    wiring: Wiring,
}

impl SessionManager {
    pub fn new(config: &Config, store: Arc<dyn TokenStore>, backend: Arc<dyn AuthBackend>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.session.request_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        let state = SessionState::new_shared();
        let oracle = Arc::new(ValidityOracle::new(
            config.session.refresh_threshold(),
            config.session.validation_cache_window(),
            Arc::clone(&state),
            Arc::clone(&backend),
        ));
        let parts = Parts {
            config: config.session.clone(),
            api_base_url: config.api_base_url.clone(),
            client,
            state,
            store,
            backend,
            listeners: Arc::new(Listeners::new()),
            ui: Arc::new(UiBinding::new()),
            connections: Arc::new(LiveConnections::new()),
            navigator: Arc::new(LogNavigator),
            tasks: Arc::new(BackgroundTasks::new()),
            oracle,
        };
        let wiring = Wiring::build(&parts);
        Ok(Self { parts, wiring })
    }

    pub fn with_navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.parts.navigator = navigator;
        self.wiring = Wiring::build(&self.parts);
        self
    }

    pub fn with_connections(mut self, connections: Arc<LiveConnections>) -> Self {
        self.parts.connections = connections;
        self.wiring = Wiring::build(&self.parts);
        self
    }

    /// Restore the session from storage and start background tasks.
    /// Returns the restored role, if a session could be resumed.
    pub async fn initialize(&self) -> Option<UserRole> {
        self.parts.tasks.shutdown().await;
        self.parts.state.lock().await.phase = SessionPhase::Restoring;

        let (access, refresh) = storage::load_pair(self.parts.store.as_ref()).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read stored tokens");
            (None, None)
        });
        let access = self.parse_stored(ACCESS_TOKEN_KEY, access);
        let refresh = self.parse_stored(REFRESH_TOKEN_KEY, refresh);

        let usable = |t: &Option<Token>| t.as_ref().map(|t| self.parts.oracle.classify(t).is_usable()).unwrap_or(false);
        let resumable = usable(&access) || usable(&refresh);
        {
            let mut state = self.parts.state.lock().await;
            if resumable {
                state.install_pair(access, refresh);
            } else {
                state.install_pair(None, None);
            }
        }
        if !resumable {
            if let Err(e) = storage::clear_pair(self.parts.store.as_ref()) {
                warn!(error = %e, "Failed to clear stale tokens");
            }
            info!("No session to restore");
        }

        let role = if resumable { self.resolve_role().await } else { None };

        self.wiring.reconciler.start(
            &self.parts.tasks,
            self.parts.config.reconcile_interval(),
            self.parts.config.reconcile_settle_delay(),
            self.parts.ui.subscribe(),
        );
        self.wiring
            .proactive
            .start(&self.parts.tasks, self.parts.config.proactive_check_interval());
        role
    }

    fn parse_stored(&self, key: &str, raw: Option<String>) -> Option<Token> {
        let raw = raw?;
        match Token::parse(raw) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(key, error = %e, "Discarding malformed stored token");
                if let Err(e) = self.parts.store.remove(key) {
                    warn!(key, error = %e, "Failed to remove malformed token");
                }
                None
            }
        }
    }

    async fn resolve_role(&self) -> Option<UserRole> {
        let token = self.wiring.coordinator.access_token().await?;
        match self.parts.backend.fetch_profile(token.as_str()).await {
            Ok(profile) => {
                info!(role = %profile.role, "Session restored");
                self.parts.ui.mark_signed_in(profile.role);
                Some(profile.role)
            }
            Err(e) => {
                warn!(error = %e, "Profile unavailable, reconciler will retry");
                None
            }
        }
    }

    /// Stop and join every background task.
    pub async fn teardown(&self) {
        self.parts.tasks.shutdown().await;
        debug!("Session manager torn down");
    }

    /// Start a session with a freshly issued pair and resolve the user's
    /// role.
    pub async fn sign_in(
        &self,
        access: impl Into<String>,
        refresh: impl Into<String>,
    ) -> Result<UserRole, AuthError> {
        let access = Token::parse(access)?;
        let refresh = Token::parse(refresh)?;

        self.parts.state
            .lock()
            .await
            .install_pair(Some(access.clone()), Some(refresh.clone()));
        if let Err(e) = self.parts.store.set(ACCESS_TOKEN_KEY, access.as_str()) {
            warn!(error = %e, "Failed to persist access token");
        }
        if let Err(e) = self.parts.store.set(REFRESH_TOKEN_KEY, refresh.as_str()) {
            warn!(error = %e, "Failed to persist refresh token");
        }

        let profile = self
            .parts
            .backend
            .fetch_profile(access.as_str())
            .await
            .map_err(|e| AuthError::Profile(e.to_string()))?;
        info!(role = %profile.role, "Signed in");
        self.parts.ui.mark_signed_in(profile.role);
        Ok(profile.role)
    }

    pub async fn sign_out(&self) -> SignOutOutcome {
        self.wiring.signout.sign_out(SignOutReason::UserInitiated).await
    }

    pub async fn force_sign_out(&self, reason: SignOutReason) -> SignOutOutcome {
        self.wiring.signout.force(reason).await
    }

    pub async fn get_access_token(&self) -> Option<Token> {
        self.wiring.coordinator.access_token().await
    }

    /// Whether the session is currently authenticated, asking the server
    /// when possible and falling back to local expiry when it is not
    /// reachable.
    pub async fn check_auth_status(&self) -> bool {
        let Some(token) = self.get_access_token().await else {
            return false;
        };
        match self.parts.oracle.validate_remotely(&token).await {
            Ok(valid) => valid,
            Err(e) => {
                debug!(error = %e, "Server check unavailable, using local verdict");
                self.parts.oracle.classify(&token).is_usable()
            }
        }
    }

    /// Run one reconcile pass now.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        self.wiring.reconciler.tick().await
    }

    pub fn on_auth_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        self.parts.listeners.subscribe(callback)
    }

    pub fn ui_state(&self) -> watch::Receiver<UiAuthState> {
        self.parts.ui.subscribe()
    }

    pub fn mark_ui_signed_in(&self, role: UserRole) {
        self.parts.ui.mark_signed_in(role);
    }

    pub fn mark_ui_signed_out(&self) {
        self.parts.ui.mark_signed_out();
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.wiring.pipeline
    }

    pub fn oracle(&self) -> &ValidityOracle {
        &self.parts.oracle
    }

    pub fn connections(&self) -> &Arc<LiveConnections> {
        &self.parts.connections
    }

    pub fn background_tasks(&self) -> usize {
        self.parts.tasks.active()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.parts.state.lock().await.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::auth::testing::{mint_token, FakeBackend};
    use crate::events::AuthEventKind;
    use crate::storage::MemoryStore;

    fn manager(store: Arc<MemoryStore>, backend: Arc<FakeBackend>) -> SessionManager {
        SessionManager::new(&Config::default(), store, backend).expect("manager")
    }

    #[tokio::test]
    async fn test_sign_in_then_restart_restores_same_pair() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        backend.set_role(UserRole::ServiceProvider);
        let access = mint_token(3600);
        let refresh = mint_token(86_400);

        let first = manager(Arc::clone(&store), Arc::clone(&backend));
        let role = first
            .sign_in(access.as_str(), refresh.as_str())
            .await
            .expect("sign in");
        assert_eq!(role, UserRole::ServiceProvider);
        assert!(first.ui_state().borrow().signed_in);

        // Simulated restart: a new manager over the same store.
        let second = manager(Arc::clone(&store), Arc::clone(&backend));
        assert_eq!(second.initialize().await, Some(UserRole::ServiceProvider));
        let snapshot = second.snapshot().await;
        assert_eq!(snapshot.access, Some(access));
        assert_eq!(snapshot.refresh, Some(refresh));
        assert_eq!(snapshot.phase, SessionPhase::Active);
        assert_eq!(backend.refresh_calls(), 0);
        second.teardown().await;
    }

    #[tokio::test]
    async fn test_sign_in_rejects_malformed_tokens() {
        let m = manager(Arc::new(MemoryStore::new()), Arc::new(FakeBackend::new()));
        let err = m
            .sign_in("nope", mint_token(86_400).as_str())
            .await
            .expect_err("malformed");
        assert!(matches!(err, AuthError::MalformedToken(_)));
        assert_eq!(m.snapshot().await.phase, SessionPhase::Uninitialized);
    }

    #[tokio::test]
    async fn test_profile_failure_keeps_tokens() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        backend.set_profile_fails(true);
        let m = manager(Arc::clone(&store), backend);

        let err = m
            .sign_in(mint_token(3600).as_str(), mint_token(86_400).as_str())
            .await
            .expect_err("profile fails");
        assert!(matches!(err, AuthError::Profile(_)));
        assert!(m.snapshot().await.access.is_some());
        assert!(store.get(REFRESH_TOKEN_KEY).expect("get").is_some());
        assert!(!m.ui_state().borrow().signed_in);
    }

    #[tokio::test]
    async fn test_sign_out_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let m = manager(Arc::clone(&store), Arc::new(FakeBackend::new()));
        m.sign_in(mint_token(3600).as_str(), mint_token(86_400).as_str())
            .await
            .expect("sign in");
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&kinds);
        let _sub = m.on_auth_state_change(move |e| k.lock().expect("kinds lock").push(e.kind()));

        assert_eq!(m.sign_out().await, SignOutOutcome::Completed);
        assert_eq!(m.sign_out().await, SignOutOutcome::AlreadySigningOut);
        assert_eq!(*kinds.lock().expect("kinds lock"), vec![AuthEventKind::SignedOut]);
        assert_eq!(storage::load_pair(store.as_ref()).expect("load"), (None, None));
        assert!(m.get_access_token().await.is_none());
        m.teardown().await;
    }

    #[tokio::test]
    async fn test_check_auth_status() {
        let backend = Arc::new(FakeBackend::new());
        let m = manager(Arc::new(MemoryStore::new()), Arc::clone(&backend));
        assert!(!m.check_auth_status().await);

        m.sign_in(mint_token(3600).as_str(), mint_token(86_400).as_str())
            .await
            .expect("sign in");
        assert!(m.check_auth_status().await);
        assert_eq!(backend.verify_calls(), 1);
    }

    #[tokio::test]
    async fn test_initialize_with_expired_pair_starts_clean() {
        let store = Arc::new(MemoryStore::new());
        store.set(ACCESS_TOKEN_KEY, mint_token(-60).as_str()).expect("seed");
        store.set(REFRESH_TOKEN_KEY, mint_token(-30).as_str()).expect("seed");
        let backend = Arc::new(FakeBackend::new());
        let m = manager(Arc::clone(&store), Arc::clone(&backend));

        assert_eq!(m.initialize().await, None);
        assert_eq!(m.snapshot().await.phase, SessionPhase::Cleared);
        assert_eq!(storage::load_pair(store.as_ref()).expect("load"), (None, None));
        assert_eq!(backend.refresh_calls(), 0);
        m.teardown().await;
    }

    #[tokio::test]
    async fn test_teardown_stops_background_tasks() {
        let m = manager(Arc::new(MemoryStore::new()), Arc::new(FakeBackend::new()));
        m.initialize().await;
        assert!(m.background_tasks() > 0);
        m.teardown().await;
        assert_eq!(m.background_tasks(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_catches_ui_signed_in_after_sign_out() {
        let m = manager(Arc::new(MemoryStore::new()), Arc::new(FakeBackend::new()));
        m.sign_in(mint_token(3600).as_str(), mint_token(86_400).as_str())
            .await
            .expect("sign in");
        assert_eq!(m.sign_out().await, SignOutOutcome::Completed);

        m.mark_ui_signed_in(UserRole::PetOwner);
        assert_eq!(
            m.reconcile().await,
            ReconcileOutcome::SignedOut(SignOutReason::StateInconsistencyNoTokens)
        );
        assert!(!m.ui_state().borrow().signed_in);
        m.teardown().await;
    }
}
