//! Tether - declarative reconciliation of external resources
//!
//! Tether drives locally-declared desired state toward convergence with
//! objects hosted in a remote system. Each declared resource is reconciled
//! by a level-triggered control loop (Observe, then Create, Update, Delete,
//! or report convergence), and reference fields let one resource borrow the
//! identity of another once that other resource has provisioned.
//!
//! # Architecture
//!
//! Everything outside the engine is a trait boundary:
//! - the remote system is an opaque per-kind adapter ([`external`]),
//! - declared resources live in a consistent, watchable store ([`store`]),
//! - per-kind behavior plugs in through lifecycle hooks ([`hooks`]),
//! - failures and progress surface through conditions and events
//!   ([`events`]).
//!
//! Provisioning order between resources is never coordinated explicitly;
//! unresolved references re-enqueue with backoff until their targets are
//! ready.
//!
//! # Modules
//!
//! - [`resource`] - declared-resource model (Managed, conditions, selectors)
//! - [`store`] - store boundary plus the in-memory reference implementation
//! - [`external`] - remote-system adapter boundary
//! - [`hooks`] - per-kind lifecycle hooks
//! - [`reference`] - cross-resource reference resolution
//! - [`reconciler`] - the Observe/Create/Update/Delete state machine
//! - [`controller`] - watch loop, work queue, controller registry
//! - [`backoff`] - requeue backoff policy
//! - [`events`] - event sink boundary
//! - [`error`] - error types for the engine

#![deny(missing_docs)]

pub mod backoff;
pub mod controller;
pub mod error;
pub mod events;
pub mod external;
pub mod hooks;
pub mod reconciler;
pub mod reference;
pub mod resource;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These defaults are shared by the reconciler and controller builders so
// embedded deployments and test fixtures agree on timing.

/// Default worker-pool size per controller
pub const DEFAULT_WORKERS: usize = 4;

/// Default delay before re-observing a resource after a remote mutation
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default delay before re-observing a converged resource
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between periodic full resyncs of a controller
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);
