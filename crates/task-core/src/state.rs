//! The State Machine (`spec.md` §4.1).
//!
//! A single mutex protects [`TaskState`] and every one-shot latch listed in
//! `spec.md` §3 (`isCancelled`, `isHandlingCancel`, `isHandlingFinish`,
//! `isTransitioningToExecuting`, `finishedHandlingCancel`, `pendingFinish`,
//! `pendingAutomaticFinish`), plus the accumulated error list. Co-locating
//! them here is what lets the cancel and finish paths make an atomic
//! decision ("shouldCancel"/"shouldFinish") without a second lock.

use std::sync::{Mutex, MutexGuard};

use crate::error::SharedTaskError;

/// The seven-state lifecycle from `spec.md` §3.
///
/// Ordinal order matters: every legal transition moves to a state with a
/// strictly greater ordinal, including the `Started → Finishing` shortcut
/// (3 → 5), which is why that edge is lawful despite skipping `Executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Initialized,
    WillEnqueue,
    Pending,
    Started,
    Executing,
    Finishing,
    Finished,
}

impl TaskState {
    fn ordinal(self) -> u8 {
        self as u8
    }
}

/// Result of a [`StateMachine::try_advance`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition was legal and has been applied.
    Advanced,
    /// The state machine is already at or past `target`; no-op.
    AlreadyPast,
    /// `target` is not reachable from the current state by any legal edge.
    /// A programmer error in debug builds (`spec.md` §4.1, §9).
    Illegal,
}

/// The complete set of fields the single state-machine mutex protects.
#[derive(Debug, Default)]
pub struct TaskStateData {
    pub errors: Vec<SharedTaskError>,
    pub is_cancelled: bool,
    pub is_handling_cancel: bool,
    pub is_handling_finish: bool,
    pub is_transitioning_to_executing: bool,
    pub finished_handling_cancel: bool,
    pub pending_finish: Option<crate::task::FinishInfo>,
    pub pending_automatic_finish: Option<crate::task::FinishInfo>,
}

struct Inner {
    state: TaskState,
    data: TaskStateData,
}

/// Guards [`TaskState`] plus every lifecycle latch behind one lock.
pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: TaskState::Initialized,
                data: TaskStateData::default(),
            }),
        }
    }

    /// Legal edges exactly as enumerated in `spec.md` §3/§4.1.
    fn is_legal_edge(from: TaskState, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (from, to),
            (Initialized, WillEnqueue)
                | (WillEnqueue, Pending)
                | (Pending, Started)
                | (Started, Executing)
                | (Started, Finishing)
                | (Executing, Finishing)
                | (Finishing, Finished)
        )
    }

    /// Attempt to move the state machine to `target`.
    ///
    /// Per `spec.md` §4.1: any illegal transition is a programming error.
    /// In debug builds this asserts; in release builds it is reported as
    /// `TransitionOutcome::Illegal` and left for the caller to decide
    /// (implementation-defined per `spec.md` §9).
    pub fn try_advance(&self, target: TaskState) -> TransitionOutcome {
        let mut guard = self.lock();
        let current = guard.state;
        if current.ordinal() >= target.ordinal() {
            return TransitionOutcome::AlreadyPast;
        }
        if !Self::is_legal_edge(current, target) {
            debug_assert!(
                false,
                "illegal task state transition: {current:?} -> {target:?}"
            );
            return TransitionOutcome::Illegal;
        }
        guard.state = target;
        TransitionOutcome::Advanced
    }

    /// Current state, observed under the lock.
    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn is_executing(&self) -> bool {
        self.state() == TaskState::Executing
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Run `f` with exclusive access to state + latches. This is the only
    /// sanctioned way to read-then-mutate more than one latch atomically
    /// (e.g. the cancel and finish "should I proceed" decisions).
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut TaskState, &mut TaskStateData) -> R) -> R {
        let mut guard = self.lock();
        let Inner { state, data } = &mut *guard;
        f(state, data)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
