//! The Task Core (`spec.md` §4.6, §4.7) — the public `Task` handle, the
//! pluggable `TaskBody` subclasses implement, and the internal protocols
//! that carry a Task through its seven-state lifecycle.
//!
//! The framework owns scheduling, state, and lifecycle dispatch; `TaskBody`
//! is the one seam where the embedder supplies the actual work.

mod internal;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::condition::{Condition, ConditionEvaluator};
use crate::error::{programmer_error, SharedTaskError, TaskError, TaskResult};
use crate::event_queue::{CompletionGroup, EventQueue, QueuePriority};
use crate::exclusivity::{ExclusivityRegistry, WaiterId};
use crate::log_macros::tc_warn;
use crate::observer::{ObserverEntry, PendingEventKind};
use crate::state::{StateMachine, TaskState};

static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique identity assigned at construction (`spec.md` §3),
/// grounded in `wf-runtime::engine_task`'s `static TASK_SEQ: AtomicU64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Errors and cancellation state staged for a `finish` call that arrived
/// while another finish was already in flight (`spec.md` §3:
/// `pendingFinish`/`pendingAutomaticFinish`).
#[derive(Debug, Clone, Default)]
pub(crate) struct FinishInfo {
    pub(crate) errors: Vec<SharedTaskError>,
}

/// The work a Task performs, supplied by the embedder. All hooks besides
/// `execute` default to no-ops, the same selective-override shape as
/// [`crate::observer::TaskObserver`].
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// The Task's main work. Runs once, after conditions are satisfied and
    /// dependencies have finished, on the Task's underlying queue if one is
    /// set, otherwise on the Task's own [`EventQueue`].
    async fn execute(&self, task: &Task);

    /// Called just before the Task transitions to `Finished`, with the
    /// accumulated error list. A chance to inspect but not alter them.
    async fn procedure_will_finish(&self, _task: &Task, _errors: &[SharedTaskError]) {}

    /// Called just after the Task transitions to `Finished`.
    async fn procedure_did_finish(&self, _task: &Task, _errors: &[SharedTaskError]) {}

    /// Called once cancellation has been recorded, whether or not `execute`
    /// ever ran.
    async fn procedure_did_cancel(&self, _task: &Task, _errors: &[SharedTaskError]) {}

    /// When `true`, the framework does not automatically call `finish` once
    /// `execute` returns — the body must call it itself (`spec.md` §4.7,
    /// "main path").
    fn is_automatic_finishing_disabled(&self) -> bool {
        false
    }
}

/// The host-provided scheduler a Task is handed off to via `produce`
/// (`spec.md` §6). Kept as a trait, not a concrete type, the way
/// `wf-runtime`'s lifecycle types accept a caller-owned runtime instead of
/// assuming one.
pub trait HostQueue: Send + Sync {
    fn enqueue(&self, task: Task) -> BoxFuture<'static, TaskResult<()>>;
}

/// Shared internals behind a [`Task`] handle. Never constructed directly —
/// always behind `Arc::new_cyclic` so [`TaskInner::handle`] can hand back a
/// `Task` without needing the constructing `Arc` threaded everywhere.
pub(crate) struct TaskInner {
    id: TaskId,
    name: String,
    self_ref: Weak<TaskInner>,
    state: StateMachine,
    queue: Arc<EventQueue>,
    underlying_queue: Mutex<Option<Arc<EventQueue>>>,
    body: Arc<dyn TaskBody>,
    dependencies: Mutex<Vec<Task>>,
    conditions: Mutex<Vec<Arc<dyn Condition>>>,
    observers: Mutex<Vec<ObserverEntry>>,
    evaluator: Mutex<Option<Arc<ConditionEvaluator>>>,
    condition_evaluation_done: AtomicBool,
    exclusivity: Mutex<Option<(WaiterId, Vec<String>)>>,
    exclusivity_registry: Mutex<Arc<ExclusivityRegistry>>,
    produced: Mutex<Vec<Task>>,
    host_queue: Mutex<Option<Arc<dyn HostQueue>>>,
    finished_notify: Notify,
    pending_barriers: Mutex<HashMap<PendingEventKind, CompletionGroup>>,
}

impl TaskInner {
    pub(crate) fn handle(&self) -> Task {
        Task(
            self.self_ref
                .upgrade()
                .expect("TaskInner outlived its own Arc"),
        )
    }

    pub(crate) fn conditions_snapshot(&self) -> Vec<Arc<dyn Condition>> {
        self.conditions.lock().unwrap().clone()
    }

    /// Snapshot of the direct dependencies at the moment the condition
    /// evaluator was constructed — "its dependencies mirror the parent's
    /// direct dependencies" (`spec.md` §4.5).
    pub(crate) fn dependencies_snapshot(&self) -> Vec<Task> {
        self.dependencies.lock().unwrap().clone()
    }

    pub(crate) async fn wait_until_finished(&self) {
        loop {
            if self.state.is_finished() {
                return;
            }
            let notified = self.finished_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.is_finished() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn notify_finished(&self) {
        self.finished_notify.notify_waiters();
    }

    /// The `CompletionGroup` a `produce(op, before: kind)` ticket is entered
    /// into; the dispatch site for `kind` awaits its drain immediately
    /// before firing, guaranteeing `enqueue(op)` happens-before `kind.fire`
    /// (`spec.md` §5: "`produce(op, before: E)` guarantees `op` is enqueued
    /// before the pending event `E` fires").
    pub(crate) fn barrier_for(&self, kind: PendingEventKind) -> CompletionGroup {
        self.pending_barriers
            .lock()
            .unwrap()
            .entry(kind)
            .or_insert_with(CompletionGroup::new)
            .clone()
    }

    pub(crate) fn exclusivity_registry(&self) -> Arc<ExclusivityRegistry> {
        self.exclusivity_registry.lock().unwrap().clone()
    }

    pub(crate) fn store_exclusivity_waiter(&self, id: WaiterId, categories: Vec<String>) {
        *self.exclusivity.lock().unwrap() = Some((id, categories));
    }

    pub(crate) async fn cancel_for_condition(&self, errors: Vec<TaskError>) {
        self.handle()
            .cancel(errors.into_iter().map(Arc::new).collect())
            .await;
    }

    pub(crate) async fn mark_condition_evaluation_done(&self) {
        self.condition_evaluation_done.store(true, Ordering::SeqCst);
    }
}

/// A handle to one Task. Cheap to clone — every clone shares the same
/// underlying [`TaskInner`].
#[derive(Clone)]
pub struct Task(Arc<TaskInner>);

impl Task {
    /// Construct a new Task in the `Initialized` state, wrapping `body`.
    pub fn new(name: impl Into<String>, body: Arc<dyn TaskBody>) -> Self {
        let id = TaskId(TASK_SEQ.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        let inner = Arc::new_cyclic(|self_ref| TaskInner {
            id,
            queue: Arc::new(EventQueue::new(format!("task-{id}"), QueuePriority::Normal)),
            name,
            self_ref: self_ref.clone(),
            state: StateMachine::new(),
            underlying_queue: Mutex::new(None),
            body,
            dependencies: Mutex::new(Vec::new()),
            conditions: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            evaluator: Mutex::new(None),
            condition_evaluation_done: AtomicBool::new(false),
            exclusivity: Mutex::new(None),
            exclusivity_registry: Mutex::new(Arc::new(ExclusivityRegistry::new())),
            produced: Mutex::new(Vec::new()),
            host_queue: Mutex::new(None),
            finished_notify: Notify::new(),
            pending_barriers: Mutex::new(HashMap::new()),
        });
        Task(inner)
    }

    /// Use a specific [`ExclusivityRegistry`] instead of this Task's own
    /// private one. Embedders normally want one registry shared across
    /// every Task in a queue, which is what this is for — call it before
    /// the Task is started.
    pub fn with_shared_registry(self, registry: Arc<ExclusivityRegistry>) -> Self {
        if self.0.state.state() >= TaskState::Started {
            tc_warn!(task, task_id = %self.0.id, "exclusivity registry replaced after start");
        }
        *self.0.exclusivity_registry.lock().unwrap() = registry;
        self
    }

    /// Run `body.execute` on `queue` instead of the Task's own private
    /// [`EventQueue`], the way a host queue supplies an "underlying queue"
    /// to keep heavy work off of the Task's serialization lane (`spec.md`
    /// §8 end-to-end scenario 6).
    pub fn with_underlying_queue(self, queue: Arc<EventQueue>) -> Self {
        *self.0.underlying_queue.lock().unwrap() = Some(queue);
        self
    }

    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn state(&self) -> TaskState {
        self.0.state.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.state.with_locked(|_, data| data.is_cancelled)
    }

    pub fn is_finished(&self) -> bool {
        self.0.state.is_finished()
    }

    /// Errors accumulated so far via `cancel`/`finish`/condition failures.
    pub fn accumulated_errors(&self) -> Vec<SharedTaskError> {
        self.0.state.with_locked(|_, data| data.errors.clone())
    }

    /// All dependencies have finished and, if conditions were installed,
    /// their evaluator has completed. A host queue should not call
    /// [`Task::start`] until this is `true` (`spec.md` §4.6 glossary:
    /// `isReady`).
    pub fn is_ready(&self) -> bool {
        let deps_done = self
            .0
            .dependencies
            .lock()
            .unwrap()
            .iter()
            .all(|d| d.is_finished());

        let conditions_done = self.0.evaluator.lock().unwrap().is_none()
            || self.0.condition_evaluation_done.load(Ordering::SeqCst);
        deps_done && conditions_done
    }

    /// Register a direct dependency. Legal only before `Started`
    /// (`spec.md` §4.6).
    pub fn add_dependency(&self, dependency: Task) -> TaskResult<()> {
        self.require_before_started("addDependency")?;
        self.0.dependencies.lock().unwrap().push(dependency);
        Ok(())
    }

    /// Remove a previously added dependency. Legal only before `Started`.
    pub fn remove_dependency(&self, dependency: &Task) -> TaskResult<()> {
        self.require_before_started("removeDependency")?;
        self.0
            .dependencies
            .lock()
            .unwrap()
            .retain(|d| d.id() != dependency.id());
        Ok(())
    }

    /// Register a condition. Legal only before `WillEnqueue` (`spec.md`
    /// §4.5, §4.6, §8: "Adding a condition after `willEnqueue` asserts") —
    /// tighter than `addDependency`'s `state < Started`, since the
    /// condition evaluator is installed and spawned right at the
    /// `WillEnqueue` → `Pending` transition and must see every condition.
    pub fn add_condition(&self, condition: Arc<dyn Condition>) -> TaskResult<()> {
        self.require_before_will_enqueue("addCondition")?;
        self.0.conditions.lock().unwrap().push(condition);
        Ok(())
    }

    /// Register an observer. Legal only before `Pending` (`spec.md` §4.4:
    /// "Observers added while `state ≥ Pending` are a programming error
    /// (inherent race) and must assert").
    pub fn add_observer(&self, entry: ObserverEntry) -> TaskResult<()> {
        if self.0.state.state() >= TaskState::Pending {
            return Err(programmer_error(
                "addObserver called at or after Pending",
            ));
        }
        self.0.observers.lock().unwrap().push(entry);
        Ok(())
    }

    fn require_before_started(&self, what: &str) -> TaskResult<()> {
        if self.0.state.state() >= TaskState::Started {
            return Err(programmer_error(format!(
                "{what} called after the task was started"
            )));
        }
        Ok(())
    }

    fn require_before_will_enqueue(&self, what: &str) -> TaskResult<()> {
        if self.0.state.state() >= TaskState::WillEnqueue {
            return Err(programmer_error(format!(
                "{what} called after the task reached willEnqueue"
            )));
        }
        Ok(())
    }

    pub(crate) async fn wait_until_finished(&self) {
        self.0.wait_until_finished().await;
    }

    /// Cancel the Task. Idempotent: only the first call's errors matter for
    /// the `willCancel`/`didCancel` dispatch, though every call's errors are
    /// folded into the accumulated error list (`spec.md` §4.7 cancel path).
    pub async fn cancel(&self, errors: Vec<SharedTaskError>) {
        internal::cancel_path(&self.0, errors).await;
    }

    /// Finish the Task, whether called by the framework after `execute`
    /// returns or by the body itself. Safe to call more than once; only the
    /// first call's effects apply (`spec.md` §4.7 finish path).
    pub async fn finish(&self, errors: Vec<SharedTaskError>) {
        internal::finish_path(&self.0, errors).await;
    }

    /// Attach `task` to the host queue this Task is enqueued on (if any),
    /// dispatching `willAdd`/`didAdd` around the attach (`spec.md` §8
    /// end-to-end scenario 5). `before`, if given, names a pending event
    /// this call must be enqueued ahead of — `produce(op, before: E)`
    /// guarantees `enqueue(op)` happens-before `E.fire` (`spec.md` §5) by
    /// making `E`'s dispatch site wait on this call's completion.
    pub async fn produce(&self, produced: Task, before: Option<PendingEventKind>) -> TaskResult<()> {
        internal::produce_path(&self.0, produced, before).await
    }

    /// Attach this Task to a host queue and drive it through the `start`
    /// path once it becomes ready. Exposed for host queues (and the bundled
    /// demo) to drive Tasks end to end; `spec.md` §6 leaves admission and
    /// scheduling policy to the host, so this crate only provides the
    /// mechanism.
    pub async fn attach_to_queue(&self, queue: Arc<dyn HostQueue>) {
        *self.0.host_queue.lock().unwrap() = Some(queue);
        internal::will_enqueue_path(&self.0).await;
    }

    /// Drive the Task from `Pending` through to completion. The caller
    /// (typically a [`HostQueue`]) is responsible for only calling this
    /// once [`Task::is_ready`] is `true`.
    pub async fn start(&self) {
        internal::start_path(&self.0).await;
    }

    pub(crate) fn produced_children(&self) -> Vec<Task> {
        self.0.produced.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("state", &self.0.state.state())
            .finish()
    }
}

/// Test-only seams used by this crate's own unit tests across modules.
/// Never exposed outside `#[cfg(test)]`.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;

    struct NoopBody;

    #[async_trait]
    impl TaskBody for NoopBody {
        async fn execute(&self, _task: &Task) {}
    }

    pub(crate) fn dummy_task() -> Task {
        Task::new("dummy", Arc::new(NoopBody))
    }

    pub(crate) fn dummy_task_with_registry(registry: Arc<ExclusivityRegistry>) -> Task {
        Task::new("dummy", Arc::new(NoopBody)).with_shared_registry(registry)
    }

    impl Task {
        pub(crate) fn is_condition_evaluation_done(&self) -> bool {
            self.0.condition_evaluation_done.load(Ordering::SeqCst)
        }

        pub(crate) fn install_condition_evaluator(&self) -> Arc<ConditionEvaluator> {
            let evaluator = ConditionEvaluator::new(&self.0);
            *self.0.evaluator.lock().unwrap() = Some(evaluator.clone());
            evaluator
        }
    }
}
