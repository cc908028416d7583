//! Live streaming connections (chat sockets, booking feeds) that must be
//! cut when the session ends.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Registry of cancellation tokens, one per live connection.
#[derive(Default)]
pub struct LiveConnections {
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl LiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; its task should stop when the returned token
    /// is cancelled. Re-registering a name cancels the previous token.
    pub fn register(&self, name: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    pub fn release(&self, name: &str) {
        self.active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name);
    }

    pub fn len(&self) -> usize {
        self.active.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel and forget every connection. Returns how many were cut.
    pub fn disconnect_all(&self) -> usize {
        let drained: Vec<(String, CancellationToken)> = self
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        for (name, token) in &drained {
            debug!(connection = %name, "Disconnecting live connection");
            token.cancel();
        }
        drained.len()
    }
}
