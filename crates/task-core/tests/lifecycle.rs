//! End-to-end lifecycle scenarios (`spec.md` §8).
//!
//! Drives real `Task`s through a minimal `HostQueue` test double and
//! asserts on the observer event sequence, the same black-box style
//! `spec.md` §8 describes its scenarios in.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use task_core::{
    Condition, ConditionEvaluationContext, ConditionOutcome, EventQueue, ExclusivityRegistry,
    HostQueue, ObserverEntry, QueuePriority, SharedTaskError, Task, TaskBody, TaskObserver,
    TaskResult,
};

/// Admits every Task it is handed and nothing more; scheduling policy is
/// explicitly left to the host by `spec.md` §6, so the tests only need
/// enough of a `HostQueue` to satisfy `attach_to_queue`/`produce`.
struct TestHostQueue {
    self_ref: Weak<TestHostQueue>,
    admitted: Mutex<Vec<Task>>,
}

impl TestHostQueue {
    fn new() -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            admitted: Mutex::new(Vec::new()),
        })
    }

    async fn admit(&self, task: Task) {
        let handle = self.self_ref.upgrade().expect("queue dropped while admitting");
        task.attach_to_queue(handle).await;
        self.admitted.lock().unwrap().push(task);
    }

    fn admitted_names(&self) -> Vec<String> {
        self.admitted
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }
}

impl HostQueue for TestHostQueue {
    fn enqueue(&self, task: Task) -> BoxFuture<'static, TaskResult<()>> {
        let handle = self.self_ref.upgrade().expect("queue dropped");
        Box::pin(async move {
            handle.admit(task).await;
            Ok(())
        })
    }
}

async fn wait_ready(task: &Task) {
    while !task.is_ready() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

async fn wait_finished(task: &Task) {
    while !task.is_finished() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingBody {
    log: Log,
    label: &'static str,
}

#[async_trait]
impl TaskBody for RecordingBody {
    async fn execute(&self, _task: &Task) {
        self.log.push(format!("{}:execute", self.label));
    }
}

struct RecordingObserver {
    log: Log,
    label: &'static str,
}

#[async_trait]
impl TaskObserver for RecordingObserver {
    async fn did_attach(&self, _task: &Task) {
        self.log.push(format!("{}:didAttach", self.label));
    }
    async fn will_execute(&self, _task: &Task) {
        self.log.push(format!("{}:willExecute", self.label));
    }
    async fn did_execute(&self, _task: &Task) {
        self.log.push(format!("{}:didExecute", self.label));
    }
    async fn will_cancel(&self, _task: &Task, errors: &[SharedTaskError]) {
        self.log.push(format!("{}:willCancel:{}", self.label, errors.len()));
    }
    async fn did_cancel(&self, _task: &Task, errors: &[SharedTaskError]) {
        self.log.push(format!("{}:didCancel:{}", self.label, errors.len()));
    }
    async fn will_add(&self, _task: &Task, _produced: &Task) {
        self.log.push(format!("{}:willAdd", self.label));
    }
    async fn did_add(&self, _task: &Task, _produced: &Task) {
        self.log.push(format!("{}:didAdd", self.label));
    }
    async fn will_finish(&self, _task: &Task, errors: &[SharedTaskError]) {
        self.log.push(format!("{}:willFinish:{}", self.label, errors.len()));
    }
    async fn did_finish(&self, _task: &Task, errors: &[SharedTaskError]) {
        self.log.push(format!("{}:didFinish:{}", self.label, errors.len()));
    }
}

fn recording_task(log: &Log, label: &'static str) -> Task {
    let task = Task::new(label, Arc::new(RecordingBody { log: log.clone(), label }));
    task.add_observer(ObserverEntry::new(Arc::new(RecordingObserver {
        log: log.clone(),
        label,
    })))
    .unwrap();
    task
}

// Scenario 1: happy path.
#[tokio::test]
async fn happy_path_runs_full_observer_sequence_with_no_errors() {
    let log = Log::default();
    let queue = TestHostQueue::new();
    let task = recording_task(&log, "t1");

    queue.admit(task.clone()).await;
    wait_ready(&task).await;
    task.start().await;
    wait_finished(&task).await;

    assert_eq!(
        log.snapshot(),
        vec![
            "t1:didAttach",
            "t1:willExecute",
            "t1:execute",
            "t1:didExecute",
            "t1:willFinish:0",
            "t1:didFinish:0",
        ]
    );
    assert!(task.accumulated_errors().is_empty());
}

// Scenario 2: cancel before start.
#[tokio::test]
async fn cancel_before_start_skips_execute_and_carries_the_error_through() {
    let log = Log::default();
    let queue = TestHostQueue::new();
    let task = recording_task(&log, "t2");
    queue.admit(task.clone()).await;

    let e1 = Arc::new(task_core::error::user_error("E1"));
    task.cancel(vec![e1]).await;

    wait_ready(&task).await;
    task.start().await;
    wait_finished(&task).await;

    assert_eq!(
        log.snapshot(),
        vec![
            "t2:didAttach",
            "t2:willCancel:1",
            "t2:didCancel:1",
            "t2:willFinish:1",
            "t2:didFinish:1",
        ]
    );
    assert_eq!(task.accumulated_errors().len(), 1);
}

struct NeverSatisfied;

#[async_trait]
impl Condition for NeverSatisfied {
    async fn evaluate(&self, _task: &Task, _ctx: &ConditionEvaluationContext) -> ConditionOutcome {
        ConditionOutcome::NotSatisfied
    }
}

// Scenario 3: condition fails with ignored error.
#[tokio::test]
async fn unsatisfied_condition_cancels_silently_without_running_execute() {
    let log = Log::default();
    let queue = TestHostQueue::new();
    let task = recording_task(&log, "t3");
    task.add_condition(Arc::new(NeverSatisfied)).unwrap();
    queue.admit(task.clone()).await;

    wait_ready(&task).await;
    task.start().await;
    wait_finished(&task).await;

    assert_eq!(
        log.snapshot(),
        vec![
            "t3:didAttach",
            "t3:willCancel:0",
            "t3:didCancel:0",
            "t3:willFinish:0",
            "t3:didFinish:0",
        ]
    );
    assert!(task.accumulated_errors().is_empty());
}

struct ExclusiveCondition {
    category: &'static str,
}

#[async_trait]
impl Condition for ExclusiveCondition {
    async fn evaluate(&self, _task: &Task, _ctx: &ConditionEvaluationContext) -> ConditionOutcome {
        ConditionOutcome::Satisfied
    }
    fn mutually_exclusive_category(&self) -> Option<String> {
        Some(self.category.to_string())
    }
}

// Scenario 4: exclusivity serializes two tasks sharing a category.
#[tokio::test]
async fn tasks_sharing_a_category_never_execute_concurrently() {
    let log = Log::default();
    let registry = Arc::new(ExclusivityRegistry::new());
    let queue = TestHostQueue::new();

    let t1 = recording_task(&log, "t1").with_shared_registry(registry.clone());
    t1.add_condition(Arc::new(ExclusiveCondition { category: "disk" })).unwrap();
    let t2 = recording_task(&log, "t2").with_shared_registry(registry.clone());
    t2.add_condition(Arc::new(ExclusiveCondition { category: "disk" })).unwrap();

    queue.admit(t1.clone()).await;
    queue.admit(t2.clone()).await;

    // Drive both the moment each becomes ready, simulating a host queue that
    // submits them back to back.
    let t1b = t1.clone();
    let t2b = t2.clone();
    let h1 = tokio::spawn(async move {
        wait_ready(&t1b).await;
        t1b.start().await;
    });
    let h2 = tokio::spawn(async move {
        wait_ready(&t2b).await;
        t2b.start().await;
    });
    h1.await.unwrap();
    h2.await.unwrap();
    wait_finished(&t1).await;
    wait_finished(&t2).await;

    let snap = log.snapshot();
    let pos = |needle: &str| snap.iter().position(|e| e == needle).unwrap();
    // Whichever task acquires "disk" first must fully finish (releasing the
    // category) before the other's willExecute can run.
    let (first, second) = if pos("t1:willExecute") < pos("t2:willExecute") {
        ("t1", "t2")
    } else {
        ("t2", "t1")
    };
    assert!(pos(&format!("{first}:didFinish:0")) < pos(&format!("{second}:willExecute")));
}

struct ProducingBody {
    log: Log,
    child: Mutex<Option<Task>>,
}

#[async_trait]
impl TaskBody for ProducingBody {
    // `produce` dispatches onto this Task's own Event Queue, so it cannot be
    // awaited synchronously from within `execute` without deadlocking the
    // single worker that's already running this call. Automatic finishing
    // is disabled and the produce-then-finish sequence runs from a spawned
    // continuation instead, once this call has returned.
    async fn execute(&self, task: &Task) {
        self.log.push("parent:execute");
        let child = self.child.lock().unwrap().take().expect("child set once");
        let task = task.clone();
        tokio::spawn(async move {
            task.produce(child, Some(task_core::PendingEventKind::WillFinish))
                .await
                .expect("produce succeeds once attached");
            task.finish(Vec::new()).await;
        });
    }

    fn is_automatic_finishing_disabled(&self) -> bool {
        true
    }
}

// Scenario 5: produce attaches the child before the parent's willFinish.
#[tokio::test]
async fn produced_child_is_attached_before_the_parent_finishes() {
    let log = Log::default();
    let queue = TestHostQueue::new();

    let child = recording_task(&log, "child");
    let parent = Task::new(
        "parent",
        Arc::new(ProducingBody {
            log: log.clone(),
            child: Mutex::new(Some(child.clone())),
        }),
    );
    parent
        .add_observer(ObserverEntry::new(Arc::new(RecordingObserver {
            log: log.clone(),
            label: "parent",
        })))
        .unwrap();

    queue.admit(parent.clone()).await;
    wait_ready(&parent).await;
    parent.start().await;
    wait_finished(&parent).await;

    assert!(queue.admitted_names().contains(&"child".to_string()));

    let snap = log.snapshot();
    let pos = |needle: &str| snap.iter().position(|e| e == needle).unwrap();
    assert!(pos("parent:willAdd") < pos("parent:willFinish:0"));
    assert!(pos("parent:didAdd") < pos("parent:willFinish:0"));
    assert!(pos("child:didAttach") < pos("parent:willFinish:0"));
}

struct UnderlyingQueueBody {
    log: Log,
}

#[async_trait]
impl TaskBody for UnderlyingQueueBody {
    async fn execute(&self, _task: &Task) {
        self.log.push("execute");
    }
}

// Scenario 6: execute runs on the underlying queue, not the Task's own.
#[tokio::test]
async fn execute_runs_on_the_underlying_queue_in_fifo_order() {
    let log = Log::default();
    let underlying = Arc::new(EventQueue::new("underlying", QueuePriority::Normal));

    // Queue a job directly on the underlying queue before the Task even
    // starts; if execute truly runs there (not on the Task's own queue) it
    // must be serialized behind this job.
    let log_for_marker = log.clone();
    underlying.dispatch(move || async move {
        log_for_marker.push("before");
    });

    let queue = TestHostQueue::new();
    let task = Task::new("t6", Arc::new(UnderlyingQueueBody { log: log.clone() }))
        .with_underlying_queue(underlying.clone());

    queue.admit(task.clone()).await;
    wait_ready(&task).await;
    task.start().await;
    wait_finished(&task).await;

    assert_eq!(log.snapshot(), vec!["before", "execute"]);
}
