//! In-process token server for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use tokenwarden_core::config::Config;
use tokenwarden_core::storage::{MemoryStore, StorageKind};
use tokenwarden_core::{HttpAuthBackend, SessionManager, Token};

/// A syntactically valid JWT expiring `secs` from now.
pub fn mint(secs: i64) -> String {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = json!({
        "exp": chrono::Utc::now().timestamp() + secs,
        "jti": format!("it-{n}"),
        "user_id": 7,
    });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{payload}.c2ln")
}

#[derive(Default)]
pub struct ServerState {
    pub refresh_calls: AtomicUsize,
    pub protected_calls: AtomicUsize,
    pub reject_refresh: AtomicBool,
    /// Answer refresh with 400, the way a blacklisted token is reported
    pub refresh_bad_request: AtomicBool,
    /// Every protected request gets a 401
    pub reject_all: AtomicBool,
    /// Access tokens the protected route accepts
    pub accepted: Mutex<HashSet<String>>,
}

impl ServerState {
    pub fn accept(&self, token: &str) {
        self.accepted.lock().expect("accepted lock").insert(token.to_string());
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

pub struct TestServer {
    pub base_url: String,
    pub state: Arc<ServerState>,
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn obtain(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    if body["password"] != "hunter2" {
        return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "bad credentials"}))).into_response();
    }
    let access = mint(300);
    state.accept(&access);
    Json(json!({"access": access, "refresh": mint(86_400)})).into_response()
}

async fn refresh(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Response {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if state.refresh_bad_request.load(Ordering::SeqCst) {
        return (StatusCode::BAD_REQUEST, Json(json!({"detail": "Token is blacklisted"}))).into_response();
    }
    if state.reject_refresh.load(Ordering::SeqCst) || body["refresh"].as_str().is_none() {
        return (StatusCode::UNAUTHORIZED, Json(json!({"detail": "token not valid"}))).into_response();
    }
    let access = mint(300);
    state.accept(&access);
    Json(json!({"access": access})).into_response()
}

async fn verify(Json(body): Json<Value>) -> Response {
    let valid = body["token"]
        .as_str()
        .and_then(|t| Token::new(t).expires_at())
        .map(|exp| exp > chrono::Utc::now())
        .unwrap_or(false);
    if valid {
        Json(json!({})).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({"detail": "token not valid"}))).into_response()
    }
}

async fn profile(headers: HeaderMap) -> Response {
    match bearer(&headers) {
        Some(_) => Json(json!({"id": 7, "email": "sam@example.com", "role": "pet_owner"})).into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn protected(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    state.protected_calls.fetch_add(1, Ordering::SeqCst);
    if state.reject_all.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let accepted = bearer(&headers)
        .map(|t| state.accepted.lock().expect("accepted lock").contains(&t))
        .unwrap_or(false);
    if accepted {
        Json(json!({"ok": true})).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn logs() -> Response {
    StatusCode::UNAUTHORIZED.into_response()
}

async fn open(headers: HeaderMap) -> Response {
    Json(json!({"had_token": bearer(&headers).is_some()})).into_response()
}

impl TestServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/token/", post(obtain))
            .route("/token/refresh/", post(refresh))
            .route("/token/verify/", post(verify))
            .route("/users/me/", get(profile))
            .route("/bookings/", get(protected))
            .route("/logs/", post(logs))
            .route("/register/", get(open))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn backend(&self) -> Arc<HttpAuthBackend> {
        Arc::new(HttpAuthBackend::new(&self.base_url).expect("backend"))
    }

    pub fn config(&self) -> Config {
        Config {
            api_base_url: self.base_url.clone(),
            storage: StorageKind::Memory,
            ..Config::default()
        }
    }

    pub fn manager(&self) -> SessionManager {
        SessionManager::new(&self.config(), Arc::new(MemoryStore::new()), self.backend())
            .expect("manager")
    }
}
