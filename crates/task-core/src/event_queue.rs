//! The Event Queue (`spec.md` §4.2).
//!
//! A serial FIFO executor for user-visible callbacks, realized as a single
//! background `tokio` task draining an unbounded channel one job at a time —
//! the same "one worker, one job in flight" shape `wf-runtime::engine_task`'s
//! `run_rule_task` loop uses to drive one state machine per iteration.
//!
//! `dispatchSynchronizedWith` and `dispatchNotify` are built on top of
//! [`CompletionGroup`], whose `wait` loop copies `wf-runtime::engine_task`'s
//! register-then-enable-then-check idiom for `tokio::sync::Notify` so a
//! completion signalled between the check and the `.await` is never missed.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};

use crate::log_macros::tc_debug;

static QUEUE_SEQ: AtomicU64 = AtomicU64::new(0);

/// QoS/priority hint propagated from the owning Task, per `spec.md` §4.2.
/// Carried for observability and for blocks that specify a minimum QoS;
/// this crate does not implement its own multi-lane scheduler and instead
/// runs jobs on whatever `tokio` runtime the embedder provides, the way
/// `wf-runtime::lifecycle::Reactor` spawns task groups onto a caller-owned
/// runtime rather than building its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QueuePriority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

tokio::task_local! {
    static CURRENT_QUEUE: u64;
}

/// A single-flight completion signal. Entering bumps a counter; the ticket's
/// `Drop` decrements it and wakes waiters once it reaches zero. Used by the
/// Observer Fabric to let callers `dispatchNotify` after an entire batch of
/// observer callbacks has completed (`spec.md` §4.4).
#[derive(Clone)]
pub struct CompletionGroup {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Default for CompletionGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionGroup {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Register one unit of outstanding work; returns a guard that signals
    /// completion on drop.
    pub fn enter(&self) -> GroupTicket {
        self.count.fetch_add(1, Ordering::AcqRel);
        GroupTicket {
            group: self.clone(),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the group to drain. Short-circuits immediately if it
    /// already has, matching `dispatchNotify`'s "already drained" fast path.
    pub async fn wait(&self) {
        loop {
            if self.is_drained() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }
}

/// RAII handle returned by [`CompletionGroup::enter`].
pub struct GroupTicket {
    group: CompletionGroup,
}

impl Drop for GroupTicket {
    fn drop(&mut self) {
        self.group.leave();
    }
}

/// Per-Task serial FIFO executor (`spec.md` §4.2).
pub struct EventQueue {
    id: u64,
    name: String,
    priority: QueuePriority,
    tx: mpsc::UnboundedSender<Job>,
}

impl EventQueue {
    pub fn new(name: impl Into<String>, priority: QueuePriority) -> Self {
        let id = QUEUE_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(Self::drain_loop(id, rx));
        tc_debug!(queue, queue_id = id, name = %name, "event queue started");
        Self {
            id,
            name,
            priority,
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> QueuePriority {
        self.priority
    }

    async fn drain_loop(id: u64, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            CURRENT_QUEUE.scope(id, job()).await;
        }
        tc_debug!(queue, queue_id = id, "event queue drained and closed");
    }

    /// Append a block; runs in FIFO order on the single worker.
    pub fn dispatch<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::new(move || Box::pin(f()));
        // The receiver only goes away when the EventQueue itself is
        // dropped; a send error here means late-arriving work after
        // teardown, which is not an error condition worth surfacing.
        let _ = self.tx.send(job);
    }

    /// Run `f` *on* `other`, blocking the caller (and therefore every
    /// subsequent block queued behind the caller on `self`) until it
    /// returns. Used to invoke user `execute` on a host-supplied underlying
    /// queue while holding `self`'s own serialization guarantee.
    pub async fn dispatch_synchronized_with<F, Fut>(&self, other: &EventQueue, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        tc_debug!(queue, from = self.id, to = other.id, "dispatch_synchronized_with");
        other.dispatch(move || async move {
            f().await;
            let _ = done_tx.send(());
        });
        let _ = done_rx.await;
    }

    /// Run `f` once `group` drains; short-circuits to an immediate dispatch
    /// if the group is already drained.
    pub fn dispatch_notify<F, Fut>(&self, group: CompletionGroup, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.dispatch(move || async move {
            group.wait().await;
            f().await;
        });
    }

    /// Internal invariant helper: true iff the calling code is running as a
    /// job on this queue's own worker.
    pub fn assert_on_event_queue(&self) -> bool {
        CURRENT_QUEUE
            .try_with(|id| *id == self.id)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn dispatch_runs_in_fifo_order() {
        let queue = EventQueue::new("test", QueuePriority::Normal);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();

        for i in 0..5 {
            let order = order.clone();
            let done_tx = if i == 4 { Some(done_tx) } else { None };
            queue.dispatch(move || async move {
                order.lock().unwrap().push(i);
                if let Some(tx) = done_tx {
                    let _ = tx.send(());
                }
            });
        }
        let done_tx = done_rx.await;
        drop(done_tx);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn dispatch_notify_short_circuits_when_already_drained() {
        let queue = EventQueue::new("notify", QueuePriority::Normal);
        let group = CompletionGroup::new();
        assert!(group.is_drained());

        let ran = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();
        let ran2 = ran.clone();
        queue.dispatch_notify(group, move || async move {
            ran2.store(true, Ordering::SeqCst);
            let _ = done_tx.send(());
        });
        done_rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dispatch_notify_waits_for_group_to_drain() {
        let queue = EventQueue::new("notify-wait", QueuePriority::Normal);
        let group = CompletionGroup::new();
        let ticket = group.enter();

        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let (done_tx, done_rx) = oneshot::channel();
        queue.dispatch_notify(group.clone(), move || async move {
            ran2.store(true, Ordering::SeqCst);
            let _ = done_tx.send(());
        });

        tokio::task::yield_now().await;
        assert!(!ran.load(Ordering::SeqCst));

        drop(ticket);
        done_rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
