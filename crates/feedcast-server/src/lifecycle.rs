//! Cancellable task groups.
//!
//! A [`TaskGroup`] owns a child of some parent [`CancellationToken`] and the
//! join handles of every task launched under it. Cancelling the parent or
//! calling [`TaskGroup::stop_only`] signals all tasks; [`TaskGroup::stop_and_wait`]
//! additionally waits for them, bounded by a timeout.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A set of background tasks that stop together.
#[derive(Default)]
pub struct TaskGroup {
    token: OnceLock<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    /// Create an unstarted group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the group to `parent`. Returns `false` if already started.
    pub fn start(&self, parent: &CancellationToken) -> bool {
        self.token.set(parent.child_token()).is_ok()
    }

    /// Whether [`start`](Self::start) has been called.
    #[cfg(test)]
    pub(crate) fn started(&self) -> bool {
        self.token.get().is_some()
    }

    /// Spawn `f` with the group's token. Returns `false` (and spawns nothing)
    /// if the group was never started or is already stopped.
    pub fn launch<F, Fut>(&self, f: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(token) = self.token.get() else {
            return false;
        };
        if token.is_cancelled() {
            return false;
        }
        let handle = tokio::spawn(f(token.clone()));
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        true
    }

    /// Signal every task to stop without waiting.
    pub fn stop_only(&self) {
        if let Some(token) = self.token.get() {
            token.cancel();
        }
    }

    /// Whether the group's token has been cancelled, directly or through the
    /// parent.
    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        self.token.get().is_some_and(CancellationToken::is_cancelled)
    }

    /// Whether every launched task has returned.
    #[cfg(test)]
    pub(crate) fn all_finished(&self) -> bool {
        self.handles.lock().iter().all(JoinHandle::is_finished)
    }

    /// Signal stop and wait up to `timeout` for tasks to finish.
    ///
    /// Returns `true` if all tasks finished in time. Tasks still running after
    /// the timeout are left to observe cancellation on their own.
    pub async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.stop_only();
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return true;
        }
        let task_count = handles.len();
        debug!(task_count, "waiting for tasks to stop");

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(task_count, ?timeout, "tasks did not stop in time");
            return false;
        }
        true
    }
}
