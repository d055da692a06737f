//! The Condition Evaluator (`spec.md` §4.5).
//!
//! A hidden sub-Task that gates its parent on dependency completion plus
//! AND-semantics condition predicates, then requests any mutually exclusive
//! categories the satisfied conditions declared. Grounded in the same
//! "small driver state machine in front of a pluggable evaluation step"
//! shape as `wf-core::rule::contract::run_contract` driving a
//! `CepStateMachine` + `RuleExecutor` per event — there the driver steps a
//! match engine and turns results into alerts; here it steps condition
//! futures and turns results into a cancel-or-proceed decision.
//!
//! `spec.md` §9 flags the parent/evaluator relationship as cyclic
//! (evaluator needs the parent to cancel it; parent owns the evaluator to
//! run it) and resolves it with a non-owning back-reference: the parent
//! holds the evaluator by `Arc`, the evaluator holds the parent by
//! [`Weak`]. If the parent has already been dropped by the time the
//! evaluator runs, there is nothing left to gate and the evaluator simply
//! marks itself done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;

use crate::error::TaskError;
use crate::log_macros::tc_debug;
use crate::task::{Task, TaskInner};

use super::ConditionEvaluationContext;

/// Internal lifecycle of the evaluator itself (`spec.md` §4.5: `Waiting on
/// dependencies → Dispatched start → Started → Executing main`). Modeled
/// as a plain enum rather than reusing [`crate::state::StateMachine`]
/// because the evaluator's transitions are linear and never contended from
/// more than one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvaluatorState {
    WaitingOnDeps,
    DispatchedStart,
    Started,
    ExecutingMain,
    Done,
}

/// The sub-Task described by `spec.md` §4.5.
pub(crate) struct ConditionEvaluator {
    parent: Weak<TaskInner>,
    /// Snapshot of the parent's direct dependencies at construction time —
    /// "its dependencies mirror the parent's direct dependencies" (`spec.md`
    /// §4.5). Evaluation does not begin until every one of these has
    /// finished, so a condition's `mutuallyExclusiveCategory` is never
    /// requested from the registry before the parent is actually about to
    /// run.
    dependencies: Vec<Task>,
    state: std::sync::Mutex<EvaluatorState>,
    cancelled: AtomicBool,
    context: ConditionEvaluationContext,
}

impl ConditionEvaluator {
    pub(crate) fn new(parent: &Arc<TaskInner>) -> Arc<Self> {
        Arc::new(Self {
            parent: Arc::downgrade(parent),
            dependencies: parent.dependencies_snapshot(),
            state: std::sync::Mutex::new(EvaluatorState::WaitingOnDeps),
            cancelled: AtomicBool::new(false),
            context: ConditionEvaluationContext::new(),
        })
    }

    /// Cooperatively cancel the evaluator itself (e.g. the parent Task was
    /// cancelled by something other than a condition before evaluation
    /// finished). Conditions still in flight observe this through their
    /// shared [`ConditionEvaluationContext`].
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.context.cancel();
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(*self.state.lock().unwrap(), EvaluatorState::Done)
    }

    fn set_state(&self, s: EvaluatorState) {
        *self.state.lock().unwrap() = s;
    }

    /// Drive the evaluator to completion. Spawned once by
    /// `Task::pending_queue_start` and never invoked again afterward.
    pub(crate) async fn run(self: Arc<Self>) {
        // WaitingOnDeps: block on the parent's own dependencies before
        // evaluating anything. Without this, a condition's
        // `mutuallyExclusiveCategory` would be requested from the registry
        // as soon as the Task is enqueued rather than once it is actually
        // about to run, holding the category for the entire lifetime of an
        // unrelated, still-running dependency.
        for dependency in &self.dependencies {
            dependency.wait_until_finished().await;
            if self.cancelled.load(Ordering::SeqCst) {
                let Some(parent) = self.parent.upgrade() else {
                    self.set_state(EvaluatorState::Done);
                    return;
                };
                tc_debug!(condition, "evaluator cancelled while waiting on dependencies");
                parent.cancel_for_condition(Vec::new()).await;
                parent.mark_condition_evaluation_done().await;
                self.set_state(EvaluatorState::Done);
                return;
            }
        }

        self.set_state(EvaluatorState::DispatchedStart);
        let Some(parent) = self.parent.upgrade() else {
            tc_debug!(condition, "parent gone before evaluation started");
            self.set_state(EvaluatorState::Done);
            return;
        };

        if self.cancelled.load(Ordering::SeqCst) {
            tc_debug!(condition, "evaluator cancelled before evaluation started");
            parent.cancel_for_condition(Vec::new()).await;
            parent.mark_condition_evaluation_done().await;
            self.set_state(EvaluatorState::Done);
            return;
        }

        self.set_state(EvaluatorState::Started);
        let conditions = parent.conditions_snapshot();
        if conditions.is_empty() {
            parent.mark_condition_evaluation_done().await;
            self.set_state(EvaluatorState::Done);
            return;
        }

        self.set_state(EvaluatorState::ExecutingMain);
        let task = parent.handle();
        let context = self.context.clone();
        let outcomes = join_all(conditions.iter().map(|condition| {
            let task = task.clone();
            let context = context.clone();
            let condition = condition.clone();
            async move {
                let outcome = condition.evaluate(&task, &context).await;
                (outcome, condition.mutually_exclusive_category())
            }
        }))
        .await;

        let mut failure: Option<TaskError> = None;
        let mut all_satisfied = true;
        let mut categories = Vec::new();
        for (outcome, category) in outcomes {
            match outcome {
                super::ConditionOutcome::Satisfied => {
                    if let Some(cat) = category {
                        categories.push(cat);
                    }
                }
                super::ConditionOutcome::NotSatisfied => all_satisfied = false,
                super::ConditionOutcome::Failed(err) => {
                    all_satisfied = false;
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = failure {
            tc_debug!(condition, "condition evaluation failed, cancelling parent");
            self.context.cancel();
            parent.cancel_for_condition(vec![err]).await;
            parent.mark_condition_evaluation_done().await;
            self.set_state(EvaluatorState::Done);
            return;
        }
        if !all_satisfied {
            tc_debug!(condition, "a condition was not satisfied, cancelling parent");
            parent.cancel_for_condition(Vec::new()).await;
            parent.mark_condition_evaluation_done().await;
            self.set_state(EvaluatorState::Done);
            return;
        }

        if !categories.is_empty() {
            let registry = parent.exclusivity_registry();
            let waiter_id = registry.acquire(&categories).await;
            parent.store_exclusivity_waiter(waiter_id, categories);
        }

        parent.mark_condition_evaluation_done().await;
        self.set_state(EvaluatorState::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, ConditionOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct AlwaysSatisfied {
        category: Option<String>,
    }

    #[async_trait]
    impl Condition for AlwaysSatisfied {
        async fn evaluate(&self, _task: &Task, _ctx: &ConditionEvaluationContext) -> ConditionOutcome {
            ConditionOutcome::Satisfied
        }
        fn mutually_exclusive_category(&self) -> Option<String> {
            self.category.clone()
        }
    }

    struct NeverSatisfied;

    #[async_trait]
    impl Condition for NeverSatisfied {
        async fn evaluate(&self, _task: &Task, _ctx: &ConditionEvaluationContext) -> ConditionOutcome {
            ConditionOutcome::NotSatisfied
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Condition for AlwaysFails {
        async fn evaluate(&self, _task: &Task, _ctx: &ConditionEvaluationContext) -> ConditionOutcome {
            ConditionOutcome::Failed(crate::error::user_error("condition exploded"))
        }
    }

    #[tokio::test]
    async fn all_satisfied_conditions_finish_the_evaluator_and_mark_parent_ready() {
        let task = crate::task::test_support::dummy_task();
        task.add_condition(Arc::new(AlwaysSatisfied { category: None })).unwrap();
        let evaluator = task.install_condition_evaluator();
        evaluator.run().await;
        assert!(task.is_condition_evaluation_done());
        assert!(!task.is_cancelled());
    }

    #[tokio::test]
    async fn an_unsatisfied_condition_cancels_the_parent_with_no_errors() {
        let task = crate::task::test_support::dummy_task();
        task.add_condition(Arc::new(NeverSatisfied)).unwrap();
        let evaluator = task.install_condition_evaluator();
        evaluator.run().await;
        assert!(task.is_cancelled());
        assert!(task.accumulated_errors().is_empty());
    }

    #[tokio::test]
    async fn a_failing_condition_cancels_the_parent_with_its_error() {
        let task = crate::task::test_support::dummy_task();
        task.add_condition(Arc::new(AlwaysFails)).unwrap();
        let evaluator = task.install_condition_evaluator();
        evaluator.run().await;
        assert!(task.is_cancelled());
        assert_eq!(task.accumulated_errors().len(), 1);
    }

    #[tokio::test]
    async fn satisfied_category_is_requested_from_the_registry() {
        let registry = Arc::new(crate::exclusivity::ExclusivityRegistry::new());
        let task = crate::task::test_support::dummy_task_with_registry(registry.clone());
        task.add_condition(Arc::new(AlwaysSatisfied {
            category: Some("disk".into()),
        }))
        .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let held_id = registry.request_lock(&["disk".to_string()], move || {
            counter2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);

        let evaluator = task.install_condition_evaluator();
        // The evaluator's own acquire() will queue behind the lock already
        // held above and only resolve once it is released.
        let run = tokio::spawn(evaluator.run());
        tokio::task::yield_now().await;
        assert!(!task.is_condition_evaluation_done());

        registry.unlock(held_id, &["disk".to_string()]);
        run.await.unwrap();
        assert!(task.is_condition_evaluation_done());
    }
}
