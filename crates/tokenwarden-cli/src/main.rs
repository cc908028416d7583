//! Tokenwarden CLI - sign in to an API, inspect the stored session and
//! watch it being kept alive.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tokio::sync::watch;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenwarden_core::auth::Token;
use tokenwarden_core::storage;
use tokenwarden_core::utils::{format_remaining, mask_token, truncate};
use tokenwarden_core::{Config, HttpAuthBackend, SessionManager};

// ============================================================================
// Constants
// ============================================================================

/// Directory for daily-rolling log files; unset means stderr only
const ENV_LOG_DIR: &str = "TOKENWARDEN_LOG_DIR";

/// Longest non-JSON body `get` prints before truncating
const MAX_BODY_PREVIEW: usize = 4000;

const USAGE: &str = "\
Usage: tokenwarden [-v] <command>

Commands:
  login [username]   Sign in and store the token pair
  status             Show the stored session and whether the server accepts it
  watch              Keep the session alive until Ctrl-C
  logout             Sign out and clear stored tokens
  get <path>         Authenticated GET through the request pipeline";

enum Command {
    Login(Option<String>),
    Status,
    Watch,
    Logout,
    Get(String),
}

fn parse_args(args: &[String]) -> Result<(Command, bool)> {
    let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
    let rest: Vec<&str> = args
        .iter()
        .skip(1)
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
        .collect();

    let command = match rest.as_slice() {
        ["login"] => Command::Login(None),
        ["login", user] => Command::Login(Some(user.to_string())),
        ["status"] => Command::Status,
        ["watch"] => Command::Watch,
        ["logout"] => Command::Logout,
        ["get", path] => Command::Get(path.to_string()),
        _ => bail!("{USAGE}"),
    };
    Ok((command, verbose))
}

/// Initialize the tracing subscriber for logging.
/// RUST_LOG wins over `-v`; the file layer is only added when a log
/// directory is configured.
fn init_tracing(verbose: bool) -> Option<WorkerGuard> {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "tokenwarden.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let (command, verbose) = match parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let _log_guard = init_tracing(verbose);

    let mut config = Config::load()?;
    let store = storage::open_store(&config)?;
    let backend = Arc::new(HttpAuthBackend::with_timeout(
        &config.api_base_url,
        config.session.request_timeout(),
    )?);
    let manager = SessionManager::new(&config, store, backend.clone())?;
    info!(api = %config.api_base_url, storage = config.storage.as_str(), "Tokenwarden starting");

    let result = match command {
        Command::Login(user) => login(&manager, &backend, &mut config, user).await,
        Command::Status => status(&manager).await,
        Command::Watch => watch_session(&manager).await,
        Command::Logout => logout(&manager).await,
        Command::Get(path) => get(&manager, &path).await,
    };

    manager.teardown().await;
    result
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(
    manager: &SessionManager,
    backend: &HttpAuthBackend,
    config: &mut Config,
    user: Option<String>,
) -> Result<()> {
    let username = match user.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ")?,
    };
    if username.is_empty() {
        bail!("Username is required");
    }
    let password = rpassword::prompt_password(format!("Password for {username}: "))
        .context("Failed to read password")?;

    let pair = backend
        .obtain_tokens(&username, &password)
        .await
        .context("Sign-in failed")?;
    let role = manager
        .sign_in(pair.access, pair.refresh)
        .await
        .context("Failed to start session")?;

    config.last_username = Some(username.clone());
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to remember username");
    }
    println!("Signed in as {username} ({role})");
    Ok(())
}

fn describe(manager: &SessionManager, label: &str, token: Option<&Token>) {
    let Some(token) = token else {
        println!("{label:<9} none");
        return;
    };
    let oracle = manager.oracle();
    let expires = token
        .expires_at()
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "{label:<9} {}  {:?}, {} left (expires {})",
        mask_token(token.as_str()),
        oracle.classify(token),
        format_remaining(oracle.time_until_expiry(token)),
        expires,
    );
}

async fn status(manager: &SessionManager) -> Result<()> {
    let role = manager.initialize().await;
    let snapshot = manager.snapshot().await;

    println!("Phase:    {:?}", snapshot.phase);
    match role {
        Some(role) => println!("Role:     {role}"),
        None => println!("Role:     -"),
    }
    describe(manager, "Access:", snapshot.access.as_ref());
    describe(manager, "Refresh:", snapshot.refresh.as_ref());

    let accepted = manager.check_auth_status().await;
    println!("Server:   {}", if accepted { "accepted" } else { "not authenticated" });
    Ok(())
}

async fn watch_session(manager: &SessionManager) -> Result<()> {
    match manager.initialize().await {
        Some(role) => println!("Session restored ({role}); watching, Ctrl-C to stop"),
        None => println!("No active session; watching for changes, Ctrl-C to stop"),
    }

    let _events = manager.on_auth_state_change(|event| {
        println!(
            "[{}] {:?}: {}",
            event.timestamp().with_timezone(&Local).format("%H:%M:%S"),
            event.kind(),
            event.reason()
        );
    });
    let mut ui: watch::Receiver<_> = manager.ui_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = ui.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *ui.borrow_and_update();
                match state.role {
                    Some(role) if state.signed_in => println!("Signed in ({role})"),
                    _ => println!("Signed out"),
                }
            }
        }
    }
    println!("Stopping");
    Ok(())
}

async fn logout(manager: &SessionManager) -> Result<()> {
    manager.sign_out().await;
    println!("Signed out");
    Ok(())
}

async fn get(manager: &SessionManager, path: &str) -> Result<()> {
    manager.initialize().await;
    let pipeline = manager.pipeline();
    let request = pipeline
        .client()
        .get(pipeline.url(path))
        .header(reqwest::header::ACCEPT, "application/json")
        .build()
        .context("Failed to build request")?;

    let response = pipeline.execute(request).await?;
    let status = response.status();
    let body = response.text().await.context("Failed to read response body")?;

    println!("{status}");
    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", truncate(&body, MAX_BODY_PREVIEW)),
    }
    Ok(())
}
