use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Cancellable deferred actions.
///
/// Each scheduled action runs on its own timer task; `cancel_all` aborts
/// every action that has not fired yet.
#[derive(Debug, Default)]
pub struct StimulusScheduler {
    pending: Vec<JoinHandle<()>>,
}

impl StimulusScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` once `delay` has elapsed.
    pub fn schedule<F>(&mut self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.retain(|task| !task.is_finished());
        self.pending.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }

    /// Actions scheduled but not yet finished.
    pub fn pending(&mut self) -> usize {
        self.pending.retain(|task| !task.is_finished());
        self.pending.len()
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.pending();
        for task in self.pending.drain(..) {
            task.abort();
        }
        if cancelled > 0 {
            debug!(cancelled, "pending stimulus actions cancelled");
        }
        cancelled
    }
}

impl Drop for StimulusScheduler {
    fn drop(&mut self) {
        for task in &self.pending {
            task.abort();
        }
    }
}
