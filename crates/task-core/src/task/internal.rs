//! Internal start/main/cancel/finish protocols (`spec.md` §4.7).
//!
//! Every path here does its actual state mutation and observer/body
//! dispatch as a job on the Task's own [`EventQueue`], by dispatching and
//! awaiting completion — the same "dispatch, then block on a oneshot"
//! bridge the Event Queue's own tests use to observe job completion from
//! outside the queue.
//!
//! One documented simplification: `finish`/`cancel`/`produce` called on a
//! Task from *within* its own `execute()` would dispatch a new job onto the
//! same single-worker queue that is currently blocked running `execute()`,
//! which deadlocks. The supported pattern for a Task that wants to finish,
//! cancel, or produce children from asynchronous follow-up work is to
//! disable automatic finishing, return from `execute` immediately, and call
//! `finish`/`produce` later from a freshly spawned continuation — at that
//! point `execute`'s job has already completed and the queue is free.
//! Calling any of the three synchronously from inside a still-running
//! `execute` is not supported.
//!
//! `produce(op, before: kind)`'s ordering guarantee is enforced by a
//! per-`PendingEventKind` [`CompletionGroup`](crate::event_queue::CompletionGroup)
//! barrier: every dispatch site below waits for its own kind's barrier to
//! drain before firing. This only works when `kind`'s dispatch job is
//! queued *after* `produce`'s own completion, which is the normal case
//! (`produce` is awaited to completion before the caller goes on to trigger
//! `kind`). Naming a `kind` whose job is already queued ahead of `produce`'s
//! own jobs on the same Event Queue would deadlock the same way reentrant
//! `finish`/`cancel`/`produce` does, for the same reason — the single
//! worker cannot reach the job that would release the barrier.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{no_queue_error, SharedTaskError, TaskResult};
use crate::log_macros::{tc_error, tc_info};
use crate::observer::{dispatch_observers, PendingEventKind, TaskObserver};
use crate::state::TaskState;

use super::{FinishInfo, Task, TaskInner};

/// Dispatch `f` as a job on the Task's own queue and await its result. The
/// same "dispatch, then block on a oneshot" bridge the Event Queue's own
/// tests use to observe job completion from outside the queue — generic
/// over the job's return value so a job can report a decision (e.g.
/// "cancellation was detected mid-flight") back to its caller without that
/// caller dispatching a second job onto the same queue from within the
/// first, which would deadlock the single worker.
async fn run_on_queue<F, Fut, R>(inner: &Arc<TaskInner>, f: F) -> R
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();
    inner.queue.dispatch(move || async move {
        let result = f().await;
        let _ = tx.send(result);
    });
    rx.await.expect("task's own event queue dropped the job before replying")
}

/// Resolve cancellation detected either by `start_path` before `execute`
/// ever ran, or by `main_path` seeing `isCancelled` mid-flight. Per
/// `spec.md` §4.7's race note: main never finishes directly on seeing
/// cancellation — it stages `pending_automatic_finish` for `cancel_path`'s
/// `DidCancel` chain to consume once that chain latches
/// `finished_handling_cancel`. If that chain has already completed by the
/// time this runs, there is nothing left to wait for and finish proceeds
/// immediately.
async fn automatic_finish_for_cancellation(inner: &Arc<TaskInner>) {
    let ready_now = inner.state.with_locked(|_, data| {
        if data.finished_handling_cancel {
            true
        } else {
            data.pending_automatic_finish = Some(FinishInfo {
                errors: data.errors.clone(),
            });
            false
        }
    });
    if ready_now {
        finish_path(inner, Vec::new()).await;
    }
}

fn attach_callback(
    task: Task,
) -> Arc<dyn Fn(Arc<dyn TaskObserver>) -> BoxFuture<'static, ()> + Send + Sync> {
    Arc::new(move |obs| {
        let task = task.clone();
        Box::pin(async move { obs.did_attach(&task).await })
    })
}

fn exec_callback(
    task: Task,
    will: bool,
) -> Arc<dyn Fn(Arc<dyn TaskObserver>) -> BoxFuture<'static, ()> + Send + Sync> {
    Arc::new(move |obs| {
        let task = task.clone();
        if will {
            Box::pin(async move { obs.will_execute(&task).await })
        } else {
            Box::pin(async move { obs.did_execute(&task).await })
        }
    })
}

fn cancel_callback(
    task: Task,
    errors: Vec<SharedTaskError>,
    will: bool,
) -> Arc<dyn Fn(Arc<dyn TaskObserver>) -> BoxFuture<'static, ()> + Send + Sync> {
    Arc::new(move |obs| {
        let task = task.clone();
        let errors = errors.clone();
        if will {
            Box::pin(async move { obs.will_cancel(&task, &errors).await })
        } else {
            Box::pin(async move { obs.did_cancel(&task, &errors).await })
        }
    })
}

fn finish_callback(
    task: Task,
    errors: Vec<SharedTaskError>,
    will: bool,
) -> Arc<dyn Fn(Arc<dyn TaskObserver>) -> BoxFuture<'static, ()> + Send + Sync> {
    Arc::new(move |obs| {
        let task = task.clone();
        let errors = errors.clone();
        if will {
            Box::pin(async move { obs.will_finish(&task, &errors).await })
        } else {
            Box::pin(async move { obs.did_finish(&task, &errors).await })
        }
    })
}

fn add_callback(
    task: Task,
    produced: Task,
    will: bool,
) -> Arc<dyn Fn(Arc<dyn TaskObserver>) -> BoxFuture<'static, ()> + Send + Sync> {
    Arc::new(move |obs| {
        let task = task.clone();
        let produced = produced.clone();
        if will {
            Box::pin(async move { obs.will_add(&task, &produced).await })
        } else {
            Box::pin(async move { obs.did_add(&task, &produced).await })
        }
    })
}

/// `willEnqueue`: record the host queue (already done by the caller),
/// install a condition evaluator if any conditions were added, fire
/// `didAttach`, and advance to `Pending`.
pub(super) async fn will_enqueue_path(inner: &Arc<TaskInner>) {
    inner.state.try_advance(TaskState::WillEnqueue);

    let inner2 = inner.clone();
    run_on_queue(inner, move || {
        let inner = inner2;
        async move {
            inner.barrier_for(PendingEventKind::DidAttach).wait().await;
            let task = inner.handle();
            let observers = inner.observers.lock().unwrap().clone();
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::DidAttach,
                attach_callback(task),
            )
            .await;
        }
    })
    .await;

    if !inner.conditions.lock().unwrap().is_empty() {
        let evaluator = crate::condition::ConditionEvaluator::new(inner);
        *inner.evaluator.lock().unwrap() = Some(evaluator.clone());
        tokio::spawn(evaluator.run());
    }

    inner.state.try_advance(TaskState::Pending);
}

/// Drive `Started` onward: either the `Started → Finishing` shortcut if
/// the Task was cancelled before it ever got to run, or into the main
/// path.
pub(super) async fn start_path(inner: &Arc<TaskInner>) {
    inner.state.try_advance(TaskState::Started);
    tc_info!(lifecycle, task_id = %inner.id, name = %inner.name, "task started");

    let was_cancelled = inner.state.with_locked(|_, data| data.is_cancelled);
    if was_cancelled {
        automatic_finish_for_cancellation(inner).await;
        return;
    }
    main_path(inner).await;
}

/// `willExecute → execute → didExecute`, then an automatic `finish` unless
/// the body disabled it.
async fn main_path(inner: &Arc<TaskInner>) {
    let inner2 = inner.clone();
    let cancelled_mid_flight = run_on_queue(inner, move || {
        let inner = inner2;
        async move {
            let proceed = inner.state.with_locked(|_, data| {
                if data.is_cancelled {
                    false
                } else {
                    data.is_transitioning_to_executing = true;
                    true
                }
            });
            if !proceed {
                return true;
            }
            inner.state.try_advance(TaskState::Executing);
            inner
                .state
                .with_locked(|_, data| data.is_transitioning_to_executing = false);

            let task = inner.handle();
            let observers = inner.observers.lock().unwrap().clone();
            inner.barrier_for(PendingEventKind::WillExecute).wait().await;
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::WillExecute,
                exec_callback(task.clone(), true),
            )
            .await;

            let underlying = inner.underlying_queue.lock().unwrap().clone();
            match underlying {
                Some(uq) => {
                    let body = inner.body.clone();
                    let task_for_exec = task.clone();
                    inner
                        .queue
                        .dispatch_synchronized_with(&uq, move || async move {
                            body.execute(&task_for_exec).await;
                        })
                        .await;
                }
                None => {
                    inner.body.execute(&task).await;
                }
            }

            inner.barrier_for(PendingEventKind::DidExecute).wait().await;
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::DidExecute,
                exec_callback(task, false),
            )
            .await;
            false
        }
    })
    .await;

    if cancelled_mid_flight {
        automatic_finish_for_cancellation(inner).await;
        return;
    }

    if !inner.body.is_automatic_finishing_disabled() {
        finish_path(inner, Vec::new()).await;
    }
}

/// Cancel path (`spec.md` §4.7): idempotent via `is_handling_cancel`.
pub(super) async fn cancel_path(inner: &Arc<TaskInner>, errors: Vec<SharedTaskError>) {
    let snapshot = inner.state.with_locked(|state, data| {
        if *state == TaskState::Finished {
            return None;
        }
        data.errors.extend(errors.iter().cloned());
        data.is_cancelled = true;
        if data.is_handling_cancel {
            None
        } else {
            data.is_handling_cancel = true;
            Some(data.errors.clone())
        }
    });
    let Some(snapshot) = snapshot else {
        return;
    };
    if let Some(evaluator) = inner.evaluator.lock().unwrap().clone() {
        evaluator.cancel();
    }
    if !snapshot.is_empty() {
        tc_error!(lifecycle, task_id = %inner.id, error_count = snapshot.len(), "task cancelled with errors");
    }

    let inner2 = inner.clone();
    let snapshot2 = snapshot.clone();
    let staged_finish = run_on_queue(inner, move || {
        let inner = inner2;
        let errors = snapshot2;
        async move {
            let task = inner.handle();
            let observers = inner.observers.lock().unwrap().clone();
            inner.barrier_for(PendingEventKind::WillCancel).wait().await;
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::WillCancel,
                cancel_callback(task.clone(), errors.clone(), true),
            )
            .await;
            inner.body.procedure_did_cancel(&task, &errors).await;
            inner.barrier_for(PendingEventKind::DidCancel).wait().await;
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::DidCancel,
                cancel_callback(task, errors, false),
            )
            .await;
            inner.state.with_locked(|_, data| {
                data.finished_handling_cancel = true;
                data.pending_automatic_finish.take()
            })
        }
    })
    .await;

    // Consumed outside the job above: finish_path dispatches its own job
    // onto this same queue, which would deadlock if run from within the
    // job that is still draining on that queue's single worker.
    if let Some(pending) = staged_finish {
        finish_path(inner, pending.errors).await;
    }
}

/// Finish path (`spec.md` §4.7): idempotent via `is_handling_finish`. A
/// finish arriving while one is already in flight is staged in
/// `pending_finish` (kept for data-model parity with `spec.md` §3; the
/// single-worker Event Queue already prevents two finish jobs from
/// actually running concurrently).
pub(super) async fn finish_path(inner: &Arc<TaskInner>, errors: Vec<SharedTaskError>) {
    let snapshot = inner.state.with_locked(|state, data| {
        if *state >= TaskState::Finishing {
            return None;
        }
        data.errors.extend(errors.iter().cloned());
        if data.is_handling_finish {
            data.pending_finish = Some(FinishInfo {
                errors: data.errors.clone(),
            });
            None
        } else {
            data.is_handling_finish = true;
            Some(data.errors.clone())
        }
    });
    let Some(snapshot) = snapshot else {
        return;
    };

    let inner2 = inner.clone();
    let snapshot2 = snapshot.clone();
    run_on_queue(inner, move || {
        let inner = inner2;
        let errors = snapshot2;
        async move {
            let task = inner.handle();
            inner.state.try_advance(TaskState::Finishing);
            let observers = inner.observers.lock().unwrap().clone();
            inner.barrier_for(PendingEventKind::WillFinish).wait().await;
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::WillFinish,
                finish_callback(task.clone(), errors.clone(), true),
            )
            .await;
            inner.body.procedure_will_finish(&task, &errors).await;

            inner.state.try_advance(TaskState::Finished);
            inner.notify_finished();
            inner.barrier_for(PendingEventKind::DidFinish).wait().await;
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::DidFinish,
                finish_callback(task.clone(), errors.clone(), false),
            )
            .await;
            inner.body.procedure_did_finish(&task, &errors).await;

            if let Some((id, categories)) = inner.exclusivity.lock().unwrap().take() {
                inner.exclusivity_registry().unlock(id, &categories);
            }
            tc_info!(lifecycle, task_id = %inner.id, name = %inner.name, "task finished");
        }
    })
    .await;
}

/// `produce` (`spec.md` §6, §8 scenario 5): attach the child to this
/// Task's host queue, with `willAdd`/`didAdd` observed around the handoff.
///
/// `before`, when given, enters this Task's barrier for that
/// [`PendingEventKind`] for the duration of the call; every dispatch site
/// in this module waits for its kind's barrier to drain before firing, so
/// holding the ticket until the child is actually enqueued is what makes
/// `produce(op, before: E) ⇒ enqueue(op)` happens-before `E.fire` hold.
pub(super) async fn produce_path(
    inner: &Arc<TaskInner>,
    produced: Task,
    before: Option<PendingEventKind>,
) -> TaskResult<()> {
    let barrier_ticket = before.map(|kind| inner.barrier_for(kind).enter());

    let host_queue = inner.host_queue.lock().unwrap().clone();
    let Some(host_queue) = host_queue else {
        return Err(no_queue_error());
    };

    let task = inner.handle();
    let inner_for_add = inner.clone();
    let produced_for_add = produced.clone();
    let task_for_add = task.clone();
    run_on_queue(inner, move || {
        let inner = inner_for_add;
        let produced = produced_for_add;
        let task = task_for_add;
        async move {
            let observers = inner.observers.lock().unwrap().clone();
            inner.barrier_for(PendingEventKind::WillAdd).wait().await;
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::WillAdd,
                add_callback(task, produced.clone(), true),
            )
            .await;
            inner.produced.lock().unwrap().push(produced);
        }
    })
    .await;

    host_queue.enqueue(produced.clone()).await?;
    // `op` is now enqueued: release the `before` ticket so its gated event
    // may proceed.
    drop(barrier_ticket);

    let inner_for_did_add = inner.clone();
    run_on_queue(inner, move || {
        let inner = inner_for_did_add;
        async move {
            let observers = inner.observers.lock().unwrap().clone();
            inner.barrier_for(PendingEventKind::DidAdd).wait().await;
            dispatch_observers(
                &inner.queue,
                &observers,
                PendingEventKind::DidAdd,
                add_callback(task, produced, false),
            )
            .await;
        }
    })
    .await;

    Ok(())
}
