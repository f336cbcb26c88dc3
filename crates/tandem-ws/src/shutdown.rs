//! Broker background tasks and their shutdown.
//!
//! The broker runs a fixed set of named tasks (acceptor, heartbeat
//! supervisor). They all watch one cancellation token; [`BrokerTasks::drain`]
//! waits for them with a deadline and aborts whatever is left.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of [`BrokerTasks::drain`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that exited before the deadline.
    pub finished: Vec<&'static str>,
    /// Tasks that had to be aborted.
    pub aborted: Vec<&'static str>,
}

impl DrainReport {
    /// Whether every task exited on its own.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Named background tasks sharing one shutdown token.
#[derive(Debug, Default)]
pub struct BrokerTasks {
    token: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl BrokerTasks {
    /// No tasks, token not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn `task` under `name`. It is expected to exit once the token fires.
    pub fn spawn(&self, name: &'static str, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        self.tasks.lock().push((name, handle));
    }

    /// Cancel the token. Returns `false` if shutdown had already begun.
    pub fn begin(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Wait up to `timeout` for every spawned task, aborting stragglers.
    ///
    /// Tasks are taken out of the set, so a second drain finds nothing.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = DrainReport::default();

        for (name, mut handle) in tasks {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_ok() {
                debug!(task = name, "task stopped");
                report.finished.push(name);
            } else {
                warn!(task = name, timeout_ms = timeout.as_millis(), "task did not stop, aborting");
                handle.abort();
                report.aborted.push(name);
            }
        }
        report
    }
}
