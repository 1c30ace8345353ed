//! Work queue for reconcile requests.
//!
//! Keys are deduplicated while waiting and serialized while active: at most
//! one pass per key is ever in flight, because concurrent passes on one
//! identity would race on external-name assignment and remote-side
//! create/update. An event arriving for an active key marks it dirty, and
//! the key is re-enqueued the moment its pass finishes.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    // One permit per key sitting in `ready`.
    ready: Semaphore,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    active: HashSet<String>,
    dirty: HashSet<String>,
}

impl WorkQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            ready: Semaphore::new(0),
        })
    }

    /// Enqueue a key. Already-waiting keys are deduplicated; keys with a
    /// pass in flight are marked dirty instead.
    pub(crate) fn add(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.active.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.ready.push_back(key.to_string());
            self.ready.add_permits(1);
        }
    }

    /// Take the next key and mark it active. Returns `None` after
    /// [`WorkQueue::shutdown`].
    pub(crate) async fn next(&self) -> Option<String> {
        let permit = self.ready.acquire().await.ok()?;
        permit.forget();
        let mut state = self.state.lock().expect("queue lock poisoned");
        let key = state.ready.pop_front()?;
        state.queued.remove(&key);
        state.active.insert(key.clone());
        Some(key)
    }

    /// Finish the active pass for a key. Returns whether the key went dirty
    /// during the pass and has been re-enqueued immediately.
    pub(crate) fn finish(&self, key: &str) -> bool {
        let redeliver = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.active.remove(key);
            state.dirty.remove(key)
        };
        if redeliver {
            self.add(key);
        }
        redeliver
    }

    /// Re-enqueue a key after a delay. Pending timers are dropped when the
    /// token is cancelled.
    pub(crate) fn requeue_after(
        self: &Arc<Self>,
        key: String,
        delay: Duration,
        cancel: &CancellationToken,
    ) {
        if delay.is_zero() {
            self.add(&key);
            return;
        }
        let queue = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(&key),
            }
        });
    }

    /// Stop handing out keys; pending and future `next` calls return `None`.
    pub(crate) fn shutdown(&self) {
        self.ready.close();
    }
}
