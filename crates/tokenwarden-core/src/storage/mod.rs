//! Token persistence.
//!
//! The session core only talks to `TokenStore`; which backend sits behind it
//! is decided once, at construction, from `StorageKind`:
//!
//! - `KeyringStore`: OS keychain, durable (mobile and desktop default)
//! - `FileStore`: JSON file in the cache directory, durable
//! - `MemoryStore`: lives as long as the process (web session-storage analogue)
//!
//! Memory is authoritative for the running process; storage only matters
//! across restarts, so callers treat write failures as non-fatal.

pub mod file;
pub mod keychain;
pub mod memory;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::Config;

pub use file::FileStore;
pub use keychain::KeyringStore;
pub use memory::MemoryStore;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// File name used by `FileStore` inside the cache directory
const TOKEN_FILE: &str = "tokens.json";

/// Minimal key/value contract for persisted tokens.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Keyring,
    File,
    Memory,
}

impl StorageKind {
    /// Durable keychain where the platform has one, session-scoped memory on
    /// the web, a cache file elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(target_arch = "wasm32") {
            StorageKind::Memory
        } else if cfg!(any(
            target_os = "ios",
            target_os = "android",
            target_os = "macos",
            target_os = "windows"
        )) {
            StorageKind::Keyring
        } else {
            StorageKind::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Keyring => "keyring",
            StorageKind::File => "file",
            StorageKind::Memory => "memory",
        }
    }
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(StorageKind::Keyring),
            "file" => Ok(StorageKind::File),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("unknown storage kind: {other}")),
        }
    }
}

/// Build the configured store.
pub fn open_store(config: &Config) -> Result<Arc<dyn TokenStore>> {
    let store: Arc<dyn TokenStore> = match config.storage {
        StorageKind::Keyring => Arc::new(KeyringStore::new(&config.keyring_service)),
        StorageKind::File => Arc::new(FileStore::new(config.cache_dir()?.join(TOKEN_FILE))),
        StorageKind::Memory => Arc::new(MemoryStore::new()),
    };
    tracing::debug!(kind = config.storage.as_str(), "Token store opened");
    Ok(store)
}

/// Raw values of both token keys, as persisted.
pub fn load_pair(store: &dyn TokenStore) -> Result<(Option<String>, Option<String>)> {
    Ok((store.get(ACCESS_TOKEN_KEY)?, store.get(REFRESH_TOKEN_KEY)?))
}

/// Remove both token keys; attempts both even if the first fails.
pub fn clear_pair(store: &dyn TokenStore) -> Result<()> {
    let access = store.remove(ACCESS_TOKEN_KEY);
    let refresh = store.remove(REFRESH_TOKEN_KEY);
    access.and(refresh)
}
