//! Background task handles.
//!
//! Every periodic loop in the crate (broker watchdog, bus consumer, RPC
//! dispatch, pool reaper) runs as an explicit task owned by a `TaskHandle`.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a running background task.
///
/// Dropping the handle also signals the task to stop.
#[must_use = "dropping a TaskHandle stops the task"]
pub struct TaskHandle {
    cancel: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Spawn a task that observes the returned handle's stop signal.
    pub fn spawn<F, Fut>(task: F) -> Self
    where
        F: FnOnce(Shutdown) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, rx) = watch::channel(false);
        let join = tokio::spawn(task(Shutdown(rx)));
        Self { cancel, join }
    }

    /// Signal the task to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        let _ = self.join.await;
    }
}

/// Stop signal as seen from inside a background task.
#[derive(Clone)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// Whether stop has been requested.
    pub fn is_requested(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves once stop is requested or the owning handle is dropped.
    pub async fn requested(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `delay`. Returns `false` if stop was requested first.
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.requested() => false,
        }
    }
}
