//! Serial task execution lane.
//! One worker per lane pulls tasks in FIFO order and runs each to
//! completion, timeout or interruption before the next may start.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use log::{debug, error, warn};
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::queue::task::{Task, TaskContext, TaskId, TaskOutcome, TaskSignal};

struct RunningTask {
    id: TaskId,
    interrupt: CancellationToken,
}

struct LaneInner {
    label: String,
    queue: Mutex<VecDeque<Task>>,
    wakeup: Notify,
    running: Mutex<Option<RunningTask>>,
    shutdown: CancellationToken,
}

/// A single-consumer, multi-producer serial pipeline. Cheap to clone via
/// `Arc` in the owning lane set; the worker lives until [`Lane::clear`].
pub(crate) struct Lane {
    inner: Arc<LaneInner>,
}

impl Lane {
    pub(crate) fn new(label: String) -> Self {
        let inner = Arc::new(LaneInner {
            label,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            running: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run(inner.clone()));
        Self { inner }
    }

    /// Appends a task to the tail of the lane.
    pub(crate) fn enqueue(&self, task: Task) {
        if self.inner.shutdown.is_cancelled() {
            // Lane already torn down; the owner recreates lanes lazily, so
            // reaching this means the whole session is going away.
            cancel_task(&self.inner.label, task);
            return;
        }
        self.inner.queue.lock().unwrap().push_back(task);
        self.inner.wakeup.notify_one();
    }

    /// Cancels a pending task, or interrupts it if it is the one running.
    pub(crate) fn remove_by_id(&self, id: TaskId) -> bool {
        let removed = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue
                .iter()
                .position(|task| task.id == id)
                .and_then(|pos| queue.remove(pos))
        };
        if let Some(task) = removed {
            cancel_task(&self.inner.label, task);
            return true;
        }
        let running = self.inner.running.lock().unwrap();
        match running.as_ref() {
            Some(current) if current.id == id => {
                current.interrupt.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancels every pending and running task and stops the worker.
    pub(crate) fn clear(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<Task> = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        for task in drained {
            cancel_task(&self.inner.label, task);
        }
        if let Some(current) = self.inner.running.lock().unwrap().as_ref() {
            current.interrupt.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }
}

fn cancel_task(label: &str, mut task: Task) {
    debug!("lane {label}: task {} cancelled before start", task.id);
    let outcome = TaskOutcome::Cancelled;
    if let Some(hook) = task.on_interrupt.take() {
        hook(&outcome);
    }
    if let Some(hook) = task.on_completion.take() {
        hook(outcome);
    }
}

async fn run(inner: Arc<LaneInner>) {
    loop {
        let Some(mut task) = next_task(&inner).await else {
            return;
        };
        let interrupt = CancellationToken::new();
        *inner.running.lock().unwrap() = Some(RunningTask {
            id: task.id,
            interrupt: interrupt.clone(),
        });

        let id = task.id;
        let interval_after = task.interval_after;
        let on_interrupt = task.on_interrupt.take();
        let on_completion = task.on_completion.take();

        let outcome = execute(&inner, task, interrupt).await;
        *inner.running.lock().unwrap() = None;

        match &outcome {
            TaskOutcome::Completed => {}
            TaskOutcome::Cancelled => debug!("lane {}: task {id} cancelled", inner.label),
            TaskOutcome::TimedOut => warn!("lane {}: task {id} timed out", inner.label),
            TaskOutcome::Failed(err) => error!("lane {}: task {id} failed: {err}", inner.label),
        }
        if !matches!(outcome, TaskOutcome::Completed) {
            if let Some(hook) = on_interrupt {
                hook(&outcome);
            }
        }
        if let Some(hook) = on_completion {
            hook(outcome);
        }

        if inner.shutdown.is_cancelled() {
            return;
        }
        if !interval_after.is_zero() {
            sleep(interval_after).await;
        }
    }
}

async fn next_task(inner: &Arc<LaneInner>) -> Option<Task> {
    loop {
        if inner.shutdown.is_cancelled() {
            return None;
        }
        if let Some(task) = inner.queue.lock().unwrap().pop_front() {
            return Some(task);
        }
        tokio::select! {
            _ = inner.wakeup.notified() => {}
            _ = inner.shutdown.cancelled() => return None,
        }
    }
}

/// Runs one task to its terminal outcome. The execution token is released
/// on every exit path: completion, timeout, interruption and panic all end
/// here, so a misbehaving task cannot starve the lane.
async fn execute(inner: &Arc<LaneInner>, task: Task, interrupt: CancellationToken) -> TaskOutcome {
    let Task {
        timeout,
        auto_advance,
        body,
        ..
    } = task;

    let (signal, mut gate) = TaskSignal::new();
    let ctx = TaskContext {
        signal: signal.clone(),
        interrupt: interrupt.clone(),
    };
    let body_fut = AssertUnwindSafe((body)(ctx)).catch_unwind();

    tokio::select! {
        _ = interrupt.cancelled() => TaskOutcome::Cancelled,
        _ = inner.shutdown.cancelled() => TaskOutcome::Cancelled,
        _ = sleep(timeout) => TaskOutcome::TimedOut,
        outcome = async move {
            match body_fut.await {
                Err(panic) => TaskOutcome::Failed(EngineError::Internal(panic_message(&panic))),
                Ok(()) => {
                    if auto_advance {
                        match gate.try_recv() {
                            Ok(resolved) => resolved,
                            Err(_) => TaskOutcome::Completed,
                        }
                    } else {
                        match gate.await {
                            Ok(resolved) => resolved,
                            Err(_) => TaskOutcome::Failed(EngineError::Internal(
                                "completion signal dropped without resolving".into(),
                            )),
                        }
                    }
                }
            }
        } => outcome,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("task body panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("task body panicked: {message}")
    } else {
        "task body panicked".to_string()
    }
}
