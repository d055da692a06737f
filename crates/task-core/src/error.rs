use std::sync::Arc;

use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

/// Error taxonomy for the Task primitive (`spec.md` §7).
///
/// Mirrors the `CoreReason`/`RuntimeReason` split this crate is grounded
/// on: one `thiserror` enum per crate, wrapped in `orion_error::StructError`
/// so callers get a consistent `.error_code()` plus contextual backtraces.
#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum TaskReason {
    /// Illegal state transition, modification after a freeze point, or a
    /// `finish` call that arrived too early while not cancelled. `spec.md`
    /// requires an abort in debug builds; this variant is what release
    /// builds observe instead of ending the process.
    #[error("programmer error: {0}")]
    Programmer(String),
    /// `produce` was called on a Task that is not attached to any host queue.
    #[error("task is not attached to a host queue")]
    NoQueue,
    /// Aggregate of one or more condition evaluation failures.
    #[error("condition evaluation failed")]
    ConditionFailure,
    /// Arbitrary error supplied by the subclass via `finish(errors)` or
    /// `cancel(errors)`.
    #[error("{0}")]
    User(String),
    /// An internal mutex was found poisoned. The Task Core's contract is
    /// that finishing and cancelling never fail, so a poison is folded
    /// into the error list instead of propagated as a panic.
    #[error("internal lock poisoned: {0}")]
    Poisoned(String),
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for TaskReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::Programmer(_) => 3001,
            Self::NoQueue => 3002,
            Self::ConditionFailure => 3003,
            Self::User(_) => 3004,
            Self::Poisoned(_) => 3005,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type TaskError = StructError<TaskReason>;
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors accumulated on a Task are handed to observers by reference and
/// may outlive the call that produced them (e.g. `pendingFinish` staged
/// across a cancel/finish race), so they are shared rather than cloned.
pub type SharedTaskError = Arc<TaskError>;

/// Construct a [`TaskError`] carrying a [`TaskReason::User`] payload, the
/// shape `cancel(errors)`/`finish(errors)` accept from subclasses.
pub fn user_error(msg: impl Into<String>) -> TaskError {
    let msg = msg.into();
    StructError::from(TaskReason::User(msg.clone())).with_detail(msg)
}

/// Construct a [`TaskError`] for a detected programmer error. Call sites
/// that would otherwise `debug_assert!` and fall through use this so the
/// release-mode behavior is "report", not "silently continue".
pub fn programmer_error(msg: impl Into<String>) -> TaskError {
    let msg = msg.into();
    StructError::from(TaskReason::Programmer(msg.clone())).with_detail(msg)
}

/// Construct a [`TaskError`] for `produce` called on a Task with no
/// attached host queue.
pub fn no_queue_error() -> TaskError {
    StructError::from(TaskReason::NoQueue).with_detail("produce called with no host queue attached")
}
