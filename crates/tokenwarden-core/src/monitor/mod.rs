//! Background activity: the consistency reconciler, the proactive refresh
//! timer, and the cancellable task set both run on.

pub mod proactive;
pub mod reconciler;

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use proactive::ProactiveRefresher;
pub use reconciler::{ConsistencyReconciler, ReconcileOutcome};

struct TaskSet {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Cancellable set of spawned tasks. `shutdown()` cancels every task and
/// waits for all of them, after which the set can be reused.
pub struct BackgroundTasks {
    inner: Mutex<TaskSet>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TaskSet {
                cancel: CancellationToken::new(),
                handles: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskSet> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Token cancelled on the next `shutdown()`.
    pub fn cancellation(&self) -> CancellationToken {
        self.lock().cancel.clone()
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        let mut set = self.lock();
        set.handles.retain(|h| !h.is_finished());
        set.handles.len()
    }

    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.lock();
        let cancel = set.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!(task = name, "Background task cancelled"),
                _ = task => debug!(task = name, "Background task finished"),
            }
        });
        set.handles.retain(|h| !h.is_finished());
        set.handles.push(handle);
    }

    /// Run `tick` every `period`, starting one period from now. A slow tick
    /// delays the next one instead of queueing a burst.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(name, async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
    }

    /// Run `task` after `delay` unless shut down first.
    pub fn spawn_delayed<F>(&self, name: &'static str, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(name, async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }

    pub async fn shutdown(&self) {
        let handles = {
            let mut set = self.lock();
            set.cancel.cancel();
            set.cancel = CancellationToken::new();
            std::mem::take(&mut set.handles)
        };
        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        debug!(tasks = count, "Background tasks stopped");
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}
