//! Minimal in-process host queue driving `task-core` end to end.
//!
//! Plays the role `wf-cli` plays for `wf-runtime`: a thin binary that wires
//! a library up and runs it, not a scheduler implementation of its own.
//! `FifoHostQueue` admits every Task it is given and polls readiness on a
//! short interval — a real host queue would instead wake on dependency
//! completion, but `spec.md` §6 leaves admission/scheduling policy to the
//! host, so this is just enough to drive the demo scenarios.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;

use task_core::condition::{Condition, ConditionEvaluationContext, ConditionOutcome};
use task_core::observer::{ObserverEntry, PendingEventKind, TaskObserver};
use task_core::{HostQueue, SharedTaskError, Task, TaskBody, TaskResult};

/// Holds a `Weak` back-reference to itself so `HostQueue::enqueue` (which
/// only receives `&self`) can still hand a Task an `Arc<dyn HostQueue>`
/// pointing at this same queue — the same `Arc::new_cyclic` shape
/// `task_core::task::TaskInner` uses for its own `handle()`.
struct FifoHostQueue {
    self_ref: Weak<FifoHostQueue>,
    pending: Mutex<Vec<Task>>,
}

impl FifoHostQueue {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            pending: Mutex::new(Vec::new()),
        })
    }

    async fn admit(&self, task: Task) -> TaskResult<()> {
        let handle = self.self_ref.upgrade().expect("queue dropped while admitting");
        task.attach_to_queue(handle).await;
        self.pending.lock().await.push(task);
        Ok(())
    }

    /// Poll every admitted Task and start whichever became ready, until
    /// none are left pending. Good enough for a demo; a production host
    /// queue would drive this from dependency-completion notifications
    /// instead of polling.
    async fn run_to_completion(&self) {
        loop {
            let ready: Vec<Task> = {
                let mut pending = self.pending.lock().await;
                let (ready, still_pending): (Vec<_>, Vec<_>) =
                    pending.drain(..).partition(|t| t.is_ready());
                *pending = still_pending;
                ready
            };
            if ready.is_empty() {
                if self.pending.lock().await.is_empty() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                continue;
            }
            for task in ready {
                task.start().await;
            }
        }
    }
}

impl HostQueue for FifoHostQueue {
    fn enqueue(&self, task: Task) -> BoxFuture<'static, TaskResult<()>> {
        let handle = self.self_ref.upgrade().expect("queue dropped");
        Box::pin(async move { handle.admit(task).await })
    }
}

struct PrintTask {
    label: &'static str,
}

#[async_trait]
impl TaskBody for PrintTask {
    async fn execute(&self, task: &Task) {
        tracing::info!(task = %task.id(), label = self.label, "executing");
    }
}

struct FlakyCondition {
    satisfied: bool,
}

#[async_trait]
impl Condition for FlakyCondition {
    async fn evaluate(&self, _task: &Task, _ctx: &ConditionEvaluationContext) -> ConditionOutcome {
        if self.satisfied {
            ConditionOutcome::Satisfied
        } else {
            ConditionOutcome::NotSatisfied
        }
    }
}

struct LoggingObserver;

#[async_trait]
impl TaskObserver for LoggingObserver {
    async fn did_finish(&self, task: &Task, errors: &[SharedTaskError]) {
        tracing::info!(
            task = %task.id(),
            name = task.name(),
            error_count = errors.len(),
            "finished"
        );
    }

    async fn did_cancel(&self, task: &Task, errors: &[SharedTaskError]) {
        tracing::info!(task = %task.id(), error_count = errors.len(), "cancelled");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let queue = FifoHostQueue::new();

    let first = Task::new("first", Arc::new(PrintTask { label: "first" }));
    first
        .add_observer(ObserverEntry::new(Arc::new(LoggingObserver)))
        .unwrap();
    queue.admit(first.clone()).await.unwrap();

    let second = Task::new("second", Arc::new(PrintTask { label: "second" }));
    second.add_dependency(first.clone()).unwrap();
    second
        .add_observer(ObserverEntry::new(Arc::new(LoggingObserver)))
        .unwrap();
    queue.admit(second).await.unwrap();

    let gated = Task::new("gated", Arc::new(PrintTask { label: "gated" }));
    gated
        .add_condition(Arc::new(FlakyCondition { satisfied: false }))
        .unwrap();
    gated
        .add_observer(ObserverEntry::new(Arc::new(LoggingObserver)))
        .unwrap();
    queue.admit(gated).await.unwrap();

    queue.run_to_completion().await;

    tracing::info!(kind = ?PendingEventKind::DidFinish, "demo complete");
}
