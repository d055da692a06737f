//! `task-core` — a structured-concurrency Task primitive: a seven-state
//! lifecycle state machine, per-Task event serialization, condition
//! evaluation, mutual-exclusion categories, and lifecycle observers.
//!
//! Start at [`task::Task`] and [`task::TaskBody`].

mod log_macros;

pub mod condition;
pub mod error;
pub mod event_queue;
pub mod exclusivity;
pub mod observer;
pub mod state;
pub mod task;

pub use condition::{Condition, ConditionEvaluationContext, ConditionOutcome};
pub use error::{SharedTaskError, TaskError, TaskReason, TaskResult};
pub use event_queue::{EventQueue, QueuePriority};
pub use exclusivity::ExclusivityRegistry;
pub use observer::{ObserverEntry, PendingEventKind, TaskObserver};
pub use state::TaskState;
pub use task::{HostQueue, Task, TaskBody, TaskId};
