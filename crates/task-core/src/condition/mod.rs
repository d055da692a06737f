//! Conditions and the evaluation context they run under (`spec.md` §4.5, §6).

mod evaluator;

pub(crate) use evaluator::ConditionEvaluator;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::task::Task;

/// Outcome of evaluating a single [`Condition`].
#[derive(Debug)]
pub enum ConditionOutcome {
    /// The condition holds; the Task may proceed.
    Satisfied,
    /// The condition does not hold, with no error — the Task is cancelled
    /// silently (`spec.md` §4.5 step 3, end-to-end scenario 3).
    NotSatisfied,
    /// The condition could not be evaluated; its error becomes the Task's
    /// cancellation error.
    Failed(TaskError),
}

/// A predicate evaluated before `execute` (`spec.md` glossary). Evaluated
/// under AND semantics alongside every other condition on the same Task.
#[async_trait]
pub trait Condition: Send + Sync {
    async fn evaluate(&self, task: &Task, context: &ConditionEvaluationContext) -> ConditionOutcome;

    /// If set, the category is requested from the [`crate::exclusivity::ExclusivityRegistry`]
    /// once every condition on the Task is satisfied.
    fn mutually_exclusive_category(&self) -> Option<String> {
        None
    }
}

/// Shared cancellation signal passed to every condition evaluated for one
/// Task, so conditions can cooperatively abandon in-flight work once the
/// parent Task (or its evaluator) is cancelled.
#[derive(Clone, Default)]
pub struct ConditionEvaluationContext {
    cancelled: Arc<AtomicBool>,
}

impl ConditionEvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
