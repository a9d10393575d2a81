//! A single asynchronous unit of work on a lane.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

pub(crate) type TaskId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_task_id() -> TaskId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Terminal outcome of one task, threaded through the completion hooks
/// instead of being thrown.
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    /// The task signalled normal completion.
    Completed,
    /// Cancelled by `remove_by_id`, `clear` or engine teardown. Never
    /// surfaced to callers as an error.
    Cancelled,
    /// The timeout fired before the task signalled completion.
    TimedOut,
    /// The task resolved itself with a failure, or its body panicked.
    Failed(EngineError),
}

/// Resolves a pending task exactly once.
///
/// Held by the task body and by whatever platform-event handler completes
/// the operation; whichever calls [`TaskSignal::resolve`] first wins, and
/// every later call is a no-op.
#[derive(Clone)]
pub(crate) struct TaskSignal {
    tx: Arc<Mutex<Option<oneshot::Sender<TaskOutcome>>>>,
}

impl TaskSignal {
    pub(crate) fn new() -> (Self, oneshot::Receiver<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Delivers the outcome if nothing resolved this task yet.
    pub(crate) fn resolve(&self, outcome: TaskOutcome) -> bool {
        let Some(tx) = self.tx.lock().unwrap().take() else {
            return false;
        };
        tx.send(outcome).is_ok()
    }
}

/// Execution context handed to a task body.
#[derive(Clone)]
pub(crate) struct TaskContext {
    /// Explicit completion primitive; resolve it when the operation's true
    /// outcome is known.
    pub signal: TaskSignal,
    /// Cancelled when the task is interrupted; long waits should race it.
    pub interrupt: CancellationToken,
}

pub(crate) type TaskBody = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, ()> + Send>;
pub(crate) type InterruptHook = Box<dyn FnOnce(&TaskOutcome) + Send>;
pub(crate) type CompletionHook = Box<dyn FnOnce(TaskOutcome) + Send>;

/// One queued unit of work. Lives for a single lane slot and is destroyed
/// after its completion hook fires.
pub(crate) struct Task {
    pub id: TaskId,
    /// Deadline covering the body and any wait for the completion signal.
    pub timeout: Duration,
    /// Pacing delay honored after this task before the lane advances.
    pub interval_after: Duration,
    /// When set, the lane advances as soon as the body returns; otherwise
    /// the body (or a platform event handler) must resolve the signal.
    pub auto_advance: bool,
    pub body: TaskBody,
    pub on_interrupt: Option<InterruptHook>,
    pub on_completion: Option<CompletionHook>,
}

impl Task {
    pub(crate) fn new(timeout: Duration, auto_advance: bool, body: TaskBody) -> Self {
        Self {
            id: next_task_id(),
            timeout,
            interval_after: Duration::ZERO,
            auto_advance,
            body,
            on_interrupt: None,
            on_completion: None,
        }
    }

    pub(crate) fn with_interval_after(mut self, interval: Duration) -> Self {
        self.interval_after = interval;
        self
    }

    pub(crate) fn with_interrupt_hook(mut self, hook: InterruptHook) -> Self {
        self.on_interrupt = Some(hook);
        self
    }

    pub(crate) fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.on_completion = Some(hook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_resolves_exactly_once() {
        let (signal, rx) = TaskSignal::new();
        assert!(signal.resolve(TaskOutcome::Completed));
        assert!(!signal.resolve(TaskOutcome::TimedOut));
        assert!(matches!(rx.await, Ok(TaskOutcome::Completed)));
    }

    #[test]
    fn task_ids_are_unique() {
        let a = next_task_id();
        let b = next_task_id();
        assert_ne!(a, b);
    }
}
