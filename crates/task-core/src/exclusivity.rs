//! The Exclusivity Registry (`spec.md` §4.3).
//!
//! A process-wide map from category name to a FIFO waiter chain, grounded
//! in the name→resource shape of `wf-core::window::WindowRegistry` (there:
//! stream tag → subscribed windows; here: category → waiting Tasks).
//! `spec.md` §9's design note calls for an explicit, injectable value rather
//! than a hidden global, so [`ExclusivityRegistry::global`] is one reachable
//! default, not the only way to get one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, OnceLock};

use tokio::sync::oneshot;

use crate::log_macros::tc_debug;

pub type WaiterId = u64;

struct PendingWaiter {
    categories: Vec<String>,
    completion: Option<Box<dyn FnOnce() + Send>>,
}

struct State {
    queues: HashMap<String, VecDeque<WaiterId>>,
    waiters: HashMap<WaiterId, PendingWaiter>,
    next_id: WaiterId,
}

/// Serializes Tasks that share one or more exclusivity categories. Waiters
/// are FIFO per category; a waiter is granted only once it is at the head
/// of *every* category it requested — an ordered barrier across named
/// mutexes.
pub struct ExclusivityRegistry {
    state: Mutex<State>,
}

impl Default for ExclusivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExclusivityRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queues: HashMap::new(),
                waiters: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// The process-wide default registry.
    pub fn global() -> &'static ExclusivityRegistry {
        static GLOBAL: OnceLock<ExclusivityRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ExclusivityRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register interest in every category, invoking `completion` once this
    /// waiter leads every one of them. Categories are deduplicated and
    /// sorted before insertion so that concurrent requests for the same
    /// category *set* always acquire them in the same relative order,
    /// preventing the classic multi-lock ordering deadlock.
    ///
    /// Empty `categories` runs `completion` immediately and returns the
    /// sentinel id `0` (nothing to release later).
    pub fn request_lock<F>(&self, categories: &[String], completion: F) -> WaiterId
    where
        F: FnOnce() + Send + 'static,
    {
        if categories.is_empty() {
            completion();
            return 0;
        }
        let mut categories: Vec<String> = categories.to_vec();
        categories.sort();
        categories.dedup();

        let mut ready_completion: Option<Box<dyn FnOnce() + Send>> = None;
        let id;
        {
            let mut state = self.lock();
            id = state.next_id;
            state.next_id += 1;
            for cat in &categories {
                state.queues.entry(cat.clone()).or_default().push_back(id);
            }
            let ready = categories
                .iter()
                .all(|cat| state.queues.get(cat).and_then(|q| q.front()) == Some(&id));
            if ready {
                ready_completion = Some(Box::new(completion));
            } else {
                state.waiters.insert(
                    id,
                    PendingWaiter {
                        categories: categories.clone(),
                        completion: Some(Box::new(completion)),
                    },
                );
            }
        }
        tc_debug!(exclusivity, waiter = id, categories = ?categories, "requested exclusivity lock");
        if let Some(c) = ready_completion {
            c();
        }
        id
    }

    /// `async` convenience wrapper over [`request_lock`](Self::request_lock).
    pub async fn acquire(&self, categories: &[String]) -> WaiterId {
        let (tx, rx) = oneshot::channel();
        let id = self.request_lock(categories, move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
        id
    }

    /// Release `id`'s hold on `categories`, promoting the next waiter(s) in
    /// each. Exactly one release should happen per successful acquisition
    /// (`spec.md` §3 invariant: categories are released exactly once, at
    /// the point of transition into `Finished`).
    pub fn unlock(&self, id: WaiterId, categories: &[String]) {
        if categories.is_empty() || id == 0 {
            return;
        }
        let mut categories: Vec<String> = categories.to_vec();
        categories.sort();
        categories.dedup();

        let mut to_run: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        {
            let mut state = self.lock();
            for cat in &categories {
                if let Some(q) = state.queues.get_mut(cat) {
                    if q.front() == Some(&id) {
                        q.pop_front();
                    } else {
                        q.retain(|w| *w != id);
                    }
                }
            }

            let mut candidates: HashSet<WaiterId> = HashSet::new();
            for cat in &categories {
                if let Some(front) = state.queues.get(cat).and_then(|q| q.front()) {
                    candidates.insert(*front);
                }
            }

            for candidate in candidates {
                let ready = state.waiters.get(&candidate).is_some_and(|w| {
                    w.categories
                        .iter()
                        .all(|c| state.queues.get(c).and_then(|q| q.front()) == Some(&candidate))
                });
                if ready {
                    if let Some(mut waiter) = state.waiters.remove(&candidate) {
                        if let Some(f) = waiter.completion.take() {
                            to_run.push(f);
                        }
                    }
                }
            }
        }
        tc_debug!(exclusivity, waiter = id, categories = ?categories, "released exclusivity lock");
        for f in to_run {
            f();
        }
    }
}
