//! Declared-resource store boundary.
//!
//! The engine assumes a consistent, watchable key-value store keyed by
//! resource name. [`Store`] is that boundary; [`MemoryStore`] is the
//! embedded reference implementation used by tests and by deployments that
//! keep declared state in process.
//!
//! Writes are optimistic: [`Store::update`] performs a version-stamped
//! conditional write and a stale submission fails with
//! [`StoreError::Conflict`]. Callers retry the whole reconcile pass rather
//! than merging concurrent writes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::resource::{Managed, Selector};

/// Buffered watch events per subscriber before the stream reports a lag.
const WATCH_BUFFER: usize = 256;

/// Errors surfaced by a declared-resource store.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No resource with the given name exists.
    #[error("resource {name} not found")]
    NotFound {
        /// Name that was looked up.
        name: String,
    },

    /// A conditional write lost against a concurrent update.
    #[error("stale write to {name}: stored version {stored}, submitted {submitted}")]
    Conflict {
        /// Name of the resource being written.
        name: String,
        /// Version currently in the store.
        stored: u64,
        /// Version the caller submitted.
        submitted: u64,
    },

    /// A watch subscriber fell behind and missed events. The subscriber
    /// should re-list and continue; the stream itself stays usable.
    #[error("watch lagged, {missed} events dropped")]
    Lagged {
        /// Number of events dropped for this subscriber.
        missed: u64,
    },

    /// The store backend failed.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Create an `Unavailable` error with the given message.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// A change notification from a store watch.
#[derive(Clone, Debug)]
pub enum WatchEvent<M> {
    /// The resource was created or updated.
    Applied(M),
    /// The resource was removed from the store.
    Removed(M),
}

impl<M: Managed> WatchEvent<M> {
    /// Name of the resource the event is about.
    pub fn name(&self) -> &str {
        match self {
            Self::Applied(m) | Self::Removed(m) => m.name(),
        }
    }
}

/// Infinite, restartable stream of store change events.
pub type WatchStream<M> = BoxStream<'static, Result<WatchEvent<M>, StoreError>>;

/// A consistent, watchable store of declared resources of one kind.
///
/// Reads are snapshot-consistent: a returned resource is a self-contained
/// copy, never a live view of store internals.
#[async_trait]
pub trait Store<M: Managed>: Send + Sync {
    /// Fetch the resource with the given name.
    async fn get(&self, name: &str) -> Result<M, StoreError>;

    /// List resources, optionally filtered by a label selector.
    async fn list(&self, selector: Option<&Selector>) -> Result<Vec<M>, StoreError>;

    /// Conditionally write a resource and return the stored copy with its
    /// bumped version stamp.
    ///
    /// A submitted version of zero inserts a new resource; any other version
    /// must equal the stored version or the write fails with
    /// [`StoreError::Conflict`].
    async fn update(&self, resource: &M) -> Result<M, StoreError>;

    /// Request deletion of a resource. The resource stays in the store with
    /// its deletion flag set until a reconcile pass completes the terminal
    /// Delete and calls [`Store::remove`].
    async fn mark_deleted(&self, name: &str) -> Result<M, StoreError>;

    /// Remove a resource from the store after its terminal Delete pass.
    async fn remove(&self, name: &str) -> Result<(), StoreError>;

    /// Subscribe to change events. Each subscriber gets every event from
    /// the moment of subscription; a slow subscriber observes
    /// [`StoreError::Lagged`] and should re-list.
    fn watch(&self) -> WatchStream<M>;
}

/// In-memory store with version-stamped conditional writes and broadcast
/// watch delivery.
pub struct MemoryStore<M: Managed> {
    inner: Arc<Inner<M>>,
}

struct Inner<M: Managed> {
    items: RwLock<HashMap<String, M>>,
    tx: broadcast::Sender<WatchEvent<M>>,
}

impl<M: Managed> Clone for MemoryStore<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Managed> Default for MemoryStore<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Managed> MemoryStore<M> {
    /// Create an empty store.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(Inner {
                items: RwLock::new(HashMap::new()),
                tx,
            }),
        }
    }

    fn broadcast(&self, event: WatchEvent<M>) {
        // No subscribers is fine; events are delivery-best-effort here and
        // the controller re-lists on startup and resync anyway.
        let _ = self.inner.tx.send(event);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, M>> {
        self.inner.items.read().expect("store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, M>> {
        self.inner.items.write().expect("store lock poisoned")
    }
}

#[async_trait]
impl<M: Managed> Store<M> for MemoryStore<M> {
    async fn get(&self, name: &str) -> Result<M, StoreError> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })
    }

    async fn list(&self, selector: Option<&Selector>) -> Result<Vec<M>, StoreError> {
        let items = self.read();
        let mut matched: Vec<M> = items
            .values()
            .filter(|m| selector.map_or(true, |s| s.matches(m.labels())))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(matched)
    }

    async fn update(&self, resource: &M) -> Result<M, StoreError> {
        let stored = {
            let mut items = self.write();
            let submitted = resource.resource_version();
            let stored_version = items.get(resource.name()).map(Managed::resource_version);

            match (stored_version, submitted) {
                (None, 0) => {}
                (None, v) => {
                    // The caller holds a copy of a resource that has since
                    // been removed; surface that as a conflict.
                    return Err(StoreError::Conflict {
                        name: resource.name().to_string(),
                        stored: 0,
                        submitted: v,
                    });
                }
                (Some(stored), submitted) if stored != submitted => {
                    return Err(StoreError::Conflict {
                        name: resource.name().to_string(),
                        stored,
                        submitted,
                    });
                }
                _ => {}
            }

            // Idempotent write: identical content neither advances the
            // version nor emits a watch event, so repeated level-triggered
            // status reports do not feed back into the watch stream.
            if let Some(existing) = items.get(resource.name()) {
                if existing == resource {
                    return Ok(existing.clone());
                }
            }

            let mut next = resource.clone();
            next.set_resource_version(submitted + 1);
            items.insert(next.name().to_string(), next.clone());
            next
        };

        self.broadcast(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn mark_deleted(&self, name: &str) -> Result<M, StoreError> {
        let marked = {
            let mut items = self.write();
            let resource = items.get_mut(name).ok_or_else(|| StoreError::NotFound {
                name: name.to_string(),
            })?;
            resource.request_deletion();
            let version = resource.resource_version() + 1;
            resource.set_resource_version(version);
            resource.clone()
        };

        self.broadcast(WatchEvent::Applied(marked.clone()));
        Ok(marked)
    }

    async fn remove(&self, name: &str) -> Result<(), StoreError> {
        let removed = self.write().remove(name);
        if let Some(resource) = removed {
            self.broadcast(WatchEvent::Removed(resource));
        }
        Ok(())
    }

    fn watch(&self) -> WatchStream<M> {
        BroadcastStream::new(self.inner.tx.subscribe())
            .map(|item| {
                item.map_err(|BroadcastStreamRecvError::Lagged(missed)| StoreError::Lagged {
                    missed,
                })
            })
            .boxed()
    }
}
