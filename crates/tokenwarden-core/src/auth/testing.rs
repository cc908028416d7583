//! Test helpers: token minting and a scripted backend.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use crate::api::{ApiError, AuthBackend, RefreshResponse};
use crate::models::{UserProfile, UserRole};

use super::token::Token;

static JTI: AtomicU64 = AtomicU64::new(1);

/// A syntactically valid JWT expiring at `exp` (epoch seconds). Every call
/// yields a distinct token.
pub fn mint_token_at(exp: i64) -> Token {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let jti = JTI.fetch_add(1, Ordering::Relaxed);
    let payload = serde_json::json!({
        "exp": exp,
        "jti": format!("jti-{jti}"),
        "user_id": 42,
        "token_type": "access",
    });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(b"signature");
    Token::new(format!("{header}.{payload}.{signature}"))
}

/// A token expiring `secs` seconds from now (negative for the past).
pub fn mint_token(secs: i64) -> Token {
    mint_token_at(Utc::now().timestamp() + secs)
}

/// Scripted `AuthBackend` that counts calls.
pub struct FakeBackend {
    refresh_calls: AtomicUsize,
    verify_calls: AtomicUsize,
    profile_calls: AtomicUsize,
    refresh_fails: AtomicBool,
    rotate_refresh: AtomicBool,
    verify_result: AtomicBool,
    profile_fails: AtomicBool,
    role: Mutex<UserRole>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    profile_gate: Mutex<Option<Arc<Semaphore>>>,
    issued: Mutex<Vec<Token>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            refresh_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            profile_calls: AtomicUsize::new(0),
            refresh_fails: AtomicBool::new(false),
            rotate_refresh: AtomicBool::new(false),
            verify_result: AtomicBool::new(true),
            profile_fails: AtomicBool::new(false),
            role: Mutex::new(UserRole::PetOwner),
            gate: Mutex::new(None),
            profile_gate: Mutex::new(None),
            issued: Mutex::new(Vec::new()),
        }
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn set_refresh_fails(&self, fails: bool) {
        self.refresh_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_rotate_refresh(&self, rotate: bool) {
        self.rotate_refresh.store(rotate, Ordering::SeqCst);
    }

    pub fn set_verify_result(&self, valid: bool) {
        self.verify_result.store(valid, Ordering::SeqCst);
    }

    pub fn set_profile_fails(&self, fails: bool) {
        self.profile_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_role(&self, role: UserRole) {
        *self.role.lock().expect("role lock") = role;
    }

    /// Make refresh calls block until `release_refresh` is called.
    pub fn hold_refresh(&self) {
        *self.gate.lock().expect("gate lock") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_refresh(&self) {
        if let Some(gate) = self.gate.lock().expect("gate lock").take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Make profile fetches block until `release_profile` is called.
    pub fn hold_profile(&self) {
        *self.profile_gate.lock().expect("profile gate lock") = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_profile(&self) {
        if let Some(gate) = self.profile_gate.lock().expect("profile gate lock").take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Access tokens handed out by refresh, oldest first.
    pub fn issued(&self) -> Vec<Token> {
        self.issued.lock().expect("issued lock").clone()
    }

    async fn do_refresh(&self) -> Result<RefreshResponse, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized);
        }
        let access = mint_token(300);
        self.issued.lock().expect("issued lock").push(access.clone());
        let refresh = self
            .rotate_refresh
            .load(Ordering::SeqCst)
            .then(|| mint_token(86_400).as_str().to_string());
        Ok(RefreshResponse {
            access: access.as_str().to_string(),
            refresh,
        })
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthBackend for FakeBackend {
    fn refresh<'a>(&'a self, _refresh_token: &'a str) -> BoxFuture<'a, Result<RefreshResponse, ApiError>> {
        Box::pin(self.do_refresh())
    }

    fn verify<'a>(&'a self, _token: &'a str) -> BoxFuture<'a, Result<bool, ApiError>> {
        Box::pin(async move {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verify_result.load(Ordering::SeqCst))
        })
    }

    fn fetch_profile<'a>(&'a self, _access_token: &'a str) -> BoxFuture<'a, Result<UserProfile, ApiError>> {
        Box::pin(async move {
            self.profile_calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.profile_gate.lock().expect("profile gate lock").clone();
            if let Some(gate) = gate {
                let _permit = gate.acquire().await;
            }
            if self.profile_fails.load(Ordering::SeqCst) {
                return Err(ApiError::ServerError("profile unavailable".into()));
            }
            Ok(UserProfile {
                id: 42,
                email: Some("owner@example.com".into()),
                role: *self.role.lock().expect("role lock"),
            })
        })
    }
}
