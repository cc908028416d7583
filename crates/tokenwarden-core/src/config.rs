//! Application configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the API base URL, the token storage strategy and every session
//! lifecycle tunable.
//!
//! Configuration is stored at `~/.config/tokenwarden/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::StorageKind;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "tokenwarden";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default API base URL when nothing is configured
const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";

/// Environment variable overriding `api_base_url`
pub const ENV_API_URL: &str = "TOKENWARDEN_API_URL";

/// Environment variable overriding `storage` (`keyring`, `file`, `memory`)
pub const ENV_STORAGE: &str = "TOKENWARDEN_STORAGE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub storage: StorageKind,
    /// Service name for keychain entries
    pub keyring_service: String,
    pub last_username: Option<String>,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            storage: StorageKind::platform_default(),
            keyring_service: APP_NAME.to_string(),
            last_username: None,
            session: SessionConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
        if let Ok(kind) = std::env::var(ENV_STORAGE) {
            match kind.parse::<StorageKind>() {
                Ok(kind) => self.storage = kind,
                Err(e) => warn!(value = %kind, error = %e, "Ignoring invalid storage override"),
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

/// Session lifecycle tunables. All durations are stored in milliseconds so
/// the JSON file stays readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Tokens with less than this left are refreshed proactively.
    /// Must exceed expected refresh latency.
    pub refresh_threshold_ms: u64,
    pub validation_cache_window_ms: u64,
    /// Budget for a caller queued behind an in-flight refresh
    pub waiter_timeout_ms: u64,
    /// Consecutive 401s that trip the circuit breaker
    pub max_auth_retries: u32,
    pub error_reset_window_ms: u64,
    pub reconcile_interval_ms: u64,
    /// Delay before the extra reconcile pass after a sign-in state change
    pub reconcile_settle_delay_ms: u64,
    pub proactive_check_interval_ms: u64,
    /// Navigation delay for user-initiated sign-out
    pub user_sign_out_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Path prefixes that never carry a token
    pub public_paths: Vec<String>,
    /// Path prefixes whose 401s must not trigger refresh
    pub refresh_exempt_paths: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_threshold_ms: 10_000,
            validation_cache_window_ms: 30_000,
            waiter_timeout_ms: 10_000,
            max_auth_retries: 3,
            error_reset_window_ms: 60_000,
            reconcile_interval_ms: 15_000,
            reconcile_settle_delay_ms: 1_000,
            proactive_check_interval_ms: 5_000,
            user_sign_out_delay_ms: 100,
            request_timeout_secs: 30,
            public_paths: vec![
                "/token/".to_string(),
                "/register/".to_string(),
                "/password-reset/".to_string(),
            ],
            refresh_exempt_paths: vec!["/logs/".to_string(), "/telemetry/".to_string()],
        }
    }
}

impl SessionConfig {
    pub fn refresh_threshold(&self) -> Duration {
        Duration::from_millis(self.refresh_threshold_ms)
    }

    pub fn validation_cache_window(&self) -> Duration {
        Duration::from_millis(self.validation_cache_window_ms)
    }

    pub fn waiter_timeout(&self) -> Duration {
        Duration::from_millis(self.waiter_timeout_ms)
    }

    pub fn error_reset_window(&self) -> Duration {
        Duration::from_millis(self.error_reset_window_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn reconcile_settle_delay(&self) -> Duration {
        Duration::from_millis(self.reconcile_settle_delay_ms)
    }

    pub fn proactive_check_interval(&self) -> Duration {
        Duration::from_millis(self.proactive_check_interval_ms)
    }

    pub fn user_sign_out_delay(&self) -> Duration {
        Duration::from_millis(self.user_sign_out_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.refresh_threshold(), Duration::from_secs(10));
        assert_eq!(config.validation_cache_window(), Duration::from_secs(30));
        assert_eq!(config.waiter_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_auth_retries, 3);
        assert_eq!(config.error_reset_window(), Duration::from_secs(60));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"api_base_url": "https://api.example.com", "session": {"max_auth_retries": 5}}"#;
        let config: Config = serde_json::from_str(json).expect("parse partial config");
        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.session.max_auth_retries, 5);
        assert_eq!(config.session.refresh_threshold_ms, 10_000);
        assert_eq!(config.keyring_service, APP_NAME);
    }
}
