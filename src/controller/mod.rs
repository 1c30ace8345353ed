//! Controller loop for declared resources.
//!
//! A [`Controller`] watches one kind in the store, enqueues reconcile
//! requests, resolves cross-resource references, and hands each resource to
//! its [`Reconciler`] across a bounded worker pool. The loop is
//! level-triggered: a warm-start list, the watch stream, and a periodic
//! resync all feed the same deduplicating queue, so missed or repeated
//! events change nothing.
//!
//! Transient failures re-enqueue with exponential backoff; terminal
//! failures park the resource until its spec changes (the resulting watch
//! event re-enqueues it).

mod queue;
mod registry;

pub use registry::ControllerRegistry;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::events::{reasons, EventSink, EventType, NoopEventSink};
use crate::external::ExternalKind;
use crate::reconciler::{Action, Reconciler};
use crate::reference::{NoReferences, ReferenceResolver, ResolveError};
use crate::resource::{Condition, Managed, ObjectRef};
use crate::store::{Store, StoreError};
use crate::{Error, DEFAULT_RESYNC_INTERVAL, DEFAULT_WORKERS};

use queue::WorkQueue;

/// Pause before resubscribing after the watch stream disconnects.
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(1);

/// What to do with a key once its pass completes.
enum Disposition {
    /// Wait for a spec change; no requeue.
    Park,
    /// Requeue after the given delay.
    After(Duration),
    /// Requeue with exponential backoff on the consecutive-failure count.
    Backoff,
}

/// Watches declared resources of one kind and reconciles them.
///
/// Passes for different resources run concurrently across the worker pool;
/// passes for the same resource are serialized by the queue.
pub struct Controller<K: ExternalKind> {
    name: String,
    store: Arc<dyn Store<K>>,
    reconciler: Reconciler<K>,
    resolver: Arc<dyn ReferenceResolver<K>>,
    events: Arc<dyn EventSink>,
    policy: RetryPolicy,
    workers: usize,
    resync_interval: Duration,
}

impl<K: ExternalKind> Controller<K> {
    /// Create a controller with default workers, backoff, and no resolver.
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn Store<K>>,
        reconciler: Reconciler<K>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            reconciler,
            resolver: Arc::new(NoReferences),
            events: Arc::new(NoopEventSink),
            policy: RetryPolicy::default(),
            workers: DEFAULT_WORKERS,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
        }
    }

    /// Resolve cross-resource references with the given resolver before
    /// each pass.
    pub fn with_resolver(mut self, resolver: Arc<dyn ReferenceResolver<K>>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Record controller-level events to the given sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Size of the worker pool (minimum one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Backoff policy for transient failures.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Interval between periodic full resyncs.
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Name of this controller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the controller until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        info!(controller = %self.name, workers = self.workers, "starting controller");

        let workers = self.workers;
        let name = self.name.clone();
        let state = Arc::new(RunState {
            name: self.name,
            store: self.store,
            reconciler: self.reconciler,
            resolver: self.resolver,
            events: self.events,
            policy: self.policy,
            resync_interval: self.resync_interval,
            queue: WorkQueue::new(),
            failures: DashMap::new(),
        });

        // Warm start: every known resource gets a pass.
        state.enqueue_all().await?;

        let mut tasks = JoinSet::new();
        {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tasks.spawn(async move { state.watch_loop(cancel).await });
        }
        {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tasks.spawn(async move { state.resync_loop(cancel).await });
        }
        for worker in 0..workers {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tasks.spawn(async move { state.worker_loop(worker, cancel).await });
        }

        cancel.cancelled().await;
        state.queue.shutdown();
        while tasks.join_next().await.is_some() {}
        info!(controller = %name, "controller stopped");
        Ok(())
    }
}

/// Shared state of a running controller.
struct RunState<K: ExternalKind> {
    name: String,
    store: Arc<dyn Store<K>>,
    reconciler: Reconciler<K>,
    resolver: Arc<dyn ReferenceResolver<K>>,
    events: Arc<dyn EventSink>,
    policy: RetryPolicy,
    resync_interval: Duration,
    queue: Arc<WorkQueue>,
    failures: DashMap<String, u32>,
}

impl<K: ExternalKind> RunState<K> {
    async fn enqueue_all(&self) -> Result<(), Error> {
        for resource in self.store.list(None).await? {
            self.queue.add(resource.name());
        }
        Ok(())
    }

    async fn watch_loop(&self, cancel: CancellationToken) {
        loop {
            let mut stream = self.store.watch();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = stream.next() => match event {
                        Some(Ok(event)) => self.queue.add(event.name()),
                        Some(Err(e)) => {
                            warn!(controller = %self.name, error = %e, "watch degraded, resyncing");
                            if let Err(e) = self.enqueue_all().await {
                                warn!(controller = %self.name, error = %e, "resync list failed");
                            }
                        }
                        None => break,
                    },
                }
            }
            warn!(controller = %self.name, "watch stream ended, restarting");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(WATCH_RESTART_DELAY) => {}
            }
        }
    }

    async fn resync_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The warm-start list already covered the first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    debug!(controller = %self.name, "periodic resync");
                    if let Err(e) = self.enqueue_all().await {
                        warn!(controller = %self.name, error = %e, "resync list failed");
                    }
                }
            }
        }
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        debug!(controller = %self.name, worker, "worker started");
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => None,
                key = self.queue.next() => key,
            };
            let Some(key) = key else { break };

            let disposition = self.process(&key, &cancel).await;
            let redelivered = self.queue.finish(&key);
            match disposition {
                Disposition::Park => {
                    self.failures.remove(&key);
                }
                Disposition::After(delay) => {
                    self.failures.remove(&key);
                    if !redelivered {
                        self.queue.requeue_after(key, delay, &cancel);
                    }
                }
                Disposition::Backoff => {
                    let attempt = {
                        let mut entry = self.failures.entry(key.clone()).or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        controller = %self.name,
                        resource = %key,
                        attempt,
                        ?delay,
                        "requeueing with backoff"
                    );
                    if !redelivered {
                        self.queue.requeue_after(key, delay, &cancel);
                    }
                }
            }
        }
        debug!(controller = %self.name, worker, "worker stopped");
    }

    /// One full pass for one key: fetch, resolve references, reconcile.
    async fn process(&self, key: &str, cancel: &CancellationToken) -> Disposition {
        let mut resource = match self.store.get(key).await {
            Ok(resource) => resource,
            Err(StoreError::NotFound { .. }) => {
                debug!(controller = %self.name, resource = %key, "resource gone, nothing to do");
                return Disposition::Park;
            }
            Err(e) => {
                warn!(controller = %self.name, resource = %key, error = %e, "fetch failed");
                return Disposition::Backoff;
            }
        };

        // References resolve before anything else; a resource with an
        // unresolved field never reaches Observe or Create. Deletion skips
        // resolution: a resource that never resolved also never created
        // anything remote, and one that did create carries its settled
        // values already, so deletion must not block on its targets.
        if !resource.deletion_requested() {
            match self.resolver.resolve_references(&mut resource).await {
                Ok(false) => {}
                Ok(true) => match self.store.update(&resource).await {
                    Ok(updated) => resource = updated,
                    Err(StoreError::Conflict { .. }) => {
                        debug!(controller = %self.name, resource = %key, "stale write, rerunning pass");
                        return Disposition::After(Duration::ZERO);
                    }
                    Err(e) => {
                        warn!(
                            controller = %self.name,
                            resource = %key,
                            error = %e,
                            "persisting resolved references failed"
                        );
                        return Disposition::Backoff;
                    }
                },
                Err(e) => return self.resolution_blocked(resource, e).await,
            }
        }

        let object_ref = ObjectRef::of(&resource);
        match self.reconciler.reconcile(resource, cancel).await {
            Ok(Action::Requeue(delay)) => Disposition::After(delay),
            Ok(Action::AwaitChange) => Disposition::Park,
            Err(Error::Store(StoreError::Conflict { .. })) => {
                debug!(controller = %self.name, resource = %key, "stale write, rerunning pass");
                Disposition::After(Duration::ZERO)
            }
            Err(e) if e.is_terminal() => {
                error!(
                    controller = %self.name,
                    resource = %key,
                    error = %e,
                    "terminal failure, waiting for spec change"
                );
                self.events
                    .record(
                        &object_ref,
                        EventType::Warning,
                        reasons::TERMINAL_FAILURE,
                        &e.to_string(),
                    )
                    .await;
                Disposition::Park
            }
            Err(e) => {
                warn!(controller = %self.name, resource = %key, error = %e, "reconcile failed");
                Disposition::Backoff
            }
        }
    }

    /// Report a pass skipped because a reference field cannot resolve yet
    /// (or, for ambiguous selectors, cannot resolve at all).
    async fn resolution_blocked(&self, mut resource: K, error: ResolveError) -> Disposition {
        let (event_type, reason, disposition) = if error.is_terminal() {
            (EventType::Warning, reasons::RESOLUTION_FAILED, Disposition::Park)
        } else {
            (EventType::Normal, reasons::RESOLUTION_PENDING, Disposition::Backoff)
        };
        debug!(
            controller = %self.name,
            resource = %resource.name(),
            error = %error,
            "reference resolution blocked"
        );

        resource
            .conditions_mut()
            .set(Condition::not_synced(reason, error.to_string()));
        self.events
            .record(
                &ObjectRef::of(&resource),
                event_type,
                reason,
                &error.to_string(),
            )
            .await;
        // Losing this write only delays the report to the next pass.
        if let Err(e) = self.store.update(&resource).await {
            debug!(controller = %self.name, error = %e, "could not persist resolution condition");
        }
        disposition
    }
}
