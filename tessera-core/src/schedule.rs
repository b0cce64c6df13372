//! Cancellable delayed tasks and debouncing on the tokio runtime.
//!
//! Must be called from within a tokio runtime.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Handle to a task started by [`schedule`].
#[derive(Debug)]
pub struct TaskHandle {
    handle: JoinHandle<()>,
}

impl TaskHandle {
    /// Cancel the task. No effect once it has run.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run `task` after `delay` unless cancelled first.
pub fn schedule<F>(task: F, delay: Duration) -> TaskHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task.await;
    });
    TaskHandle { handle }
}

/// Coalesces bursts of triggers into one run after a quiet period.
///
/// Each [`trigger`](Debouncer::trigger) cancels the pending task and starts
/// a new one; only the last trigger of a burst runs.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Option<TaskHandle>,
    generation: u64,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
            generation: 0,
        }
    }

    /// Restart the quiet period with a new task.
    ///
    /// The task receives the trigger's generation; see [`is_current`](Self::is_current).
    pub fn trigger<F, Fut>(&mut self, task: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        self.pending = Some(schedule(task(self.generation), self.delay));
        self.generation
    }

    /// Drop the pending task, if any.
    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }

    /// Whether `generation` belongs to the latest trigger.
    ///
    /// A task that already finished sleeping can race a cancel; receivers
    /// use this to discard such stale runs.
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| !p.is_finished())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
