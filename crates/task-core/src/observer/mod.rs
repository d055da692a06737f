//! The Observer Fabric (`spec.md` §4.4).
//!
//! Dispatches lifecycle events to registered observers, honoring each
//! observer's optional queue affinity. The original design (GCD-style
//! manual continuation chaining: run inline, or hop to the observer's own
//! queue and "re-dispatch back to continue the iteration") is realized here
//! with plain `async`/`await` — hopping to another queue is just awaiting
//! [`EventQueue::dispatch_synchronized_with`], and "continuing the
//! iteration" is simply the code after that `.await`. One consequence: the
//! [`CompletionGroup`] this module returns is always already drained by the
//! time `dispatch_observers` returns, since every observer callback has
//! been awaited by then. It is still threaded through
//! [`EventQueue::dispatch_notify`] at call sites for parity with the
//! documented contract ("callers pass the group to `dispatchNotify`") and
//! so a future fire-and-forget observer path has somewhere to plug in.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::SharedTaskError;
use crate::event_queue::{CompletionGroup, EventQueue};
use crate::log_macros::tc_debug;
use crate::task::Task;

/// Which lifecycle event a dispatch batch represents. Also the key a
/// `produce(op, before: E)` caller names to gate `E`'s firing on `op` first
/// being enqueued (`spec.md` §4.6, §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingEventKind {
    DidAttach,
    WillExecute,
    DidExecute,
    WillCancel,
    DidCancel,
    WillAdd,
    DidAdd,
    WillFinish,
    DidFinish,
}

/// An observer of a Task's lifecycle. All methods default to no-ops so
/// implementers only override the events they care about.
#[async_trait]
pub trait TaskObserver: Send + Sync {
    async fn did_attach(&self, _task: &Task) {}
    async fn will_execute(&self, _task: &Task) {}
    async fn did_execute(&self, _task: &Task) {}
    async fn will_cancel(&self, _task: &Task, _errors: &[SharedTaskError]) {}
    async fn did_cancel(&self, _task: &Task, _errors: &[SharedTaskError]) {}
    async fn will_add(&self, _task: &Task, _produced: &Task) {}
    async fn did_add(&self, _task: &Task, _produced: &Task) {}
    async fn will_finish(&self, _task: &Task, _errors: &[SharedTaskError]) {}
    async fn did_finish(&self, _task: &Task, _errors: &[SharedTaskError]) {}
}

/// One registered observer plus its optional queue affinity.
#[derive(Clone)]
pub struct ObserverEntry {
    pub observer: Arc<dyn TaskObserver>,
    pub affinity: Option<Arc<EventQueue>>,
}

impl ObserverEntry {
    pub fn new(observer: Arc<dyn TaskObserver>) -> Self {
        Self {
            observer,
            affinity: None,
        }
    }

    pub fn with_affinity(observer: Arc<dyn TaskObserver>, affinity: Arc<EventQueue>) -> Self {
        Self {
            observer,
            affinity: Some(affinity),
        }
    }
}

/// Invokes `per_observer` for every entry in `observers`, honoring affinity,
/// and returns the batch's [`CompletionGroup`]. Must only be called from
/// code already running as a job on `queue` (`spec.md` §4.4).
pub async fn dispatch_observers(
    queue: &EventQueue,
    observers: &[ObserverEntry],
    kind: PendingEventKind,
    per_observer: Arc<dyn Fn(Arc<dyn TaskObserver>) -> BoxFuture<'static, ()> + Send + Sync>,
) -> CompletionGroup {
    debug_assert!(
        observers.is_empty() || queue.assert_on_event_queue(),
        "dispatch_observers must run on the task's own event queue"
    );
    let group = CompletionGroup::new();
    for entry in observers {
        let _ticket = group.enter();
        tc_debug!(observer, event = ?kind, "dispatching observer callback");
        match &entry.affinity {
            Some(affinity) if affinity.id() != queue.id() => {
                let observer = entry.observer.clone();
                let per_observer = per_observer.clone();
                queue
                    .dispatch_synchronized_with(affinity, move || per_observer(observer))
                    .await;
            }
            _ => {
                per_observer(entry.observer.clone()).await;
            }
        }
    }
    group
}
