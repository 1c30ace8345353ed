//! Event recording for reconcile passes.
//!
//! Provides a trait-based abstraction over whatever sink the deployment
//! publishes events to, so every terminal or retryable failure (and every
//! remote-side mutation) leaves a visible record.
//!
//! Events are **fire-and-forget**: failures are logged and never propagate.
//! A failed event must never break reconciliation.

use async_trait::async_trait;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::resource::ObjectRef;

/// Severity of a recorded event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Expected lifecycle progress.
    Normal,
    /// Something went wrong or is blocked.
    Warning,
}

/// Sink accepting `(resource, severity, reason, message)` records.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record an event about the given resource.
    async fn record(&self, resource: &ObjectRef, type_: EventType, reason: &str, message: &str);
}

/// Sink that emits events as structured log lines.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn record(&self, resource: &ObjectRef, type_: EventType, reason: &str, message: &str) {
        match type_ {
            EventType::Normal => info!(resource = %resource, reason, message, "event"),
            EventType::Warning => warn!(resource = %resource, reason, message, "event"),
        }
    }
}

/// Sink that drops all events. For tests and embedded use.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn record(&self, _resource: &ObjectRef, _type_: EventType, _reason: &str, _message: &str) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// The remote object was created.
    pub const CREATED: &str = "CreatedExternal";
    /// The create call failed.
    pub const CREATE_FAILED: &str = "CreateFailed";
    /// The remote object was updated in place.
    pub const UPDATED: &str = "UpdatedExternal";
    /// The update call failed.
    pub const UPDATE_FAILED: &str = "UpdateFailed";
    /// The remote object was deleted (or found already gone).
    pub const DELETED: &str = "DeletedExternal";
    /// The delete call failed.
    pub const DELETE_FAILED: &str = "DeleteFailed";
    /// The observe lookup failed.
    pub const OBSERVE_FAILED: &str = "ObserveFailed";
    /// A reference field cannot be resolved yet; the pass was skipped.
    pub const RESOLUTION_PENDING: &str = "ResolutionPending";
    /// Reference resolution hit a configuration defect.
    pub const RESOLUTION_FAILED: &str = "ResolutionFailed";
    /// Declared and external state are converged.
    pub const SYNCED: &str = "Synced";
    /// A terminal failure parked the resource until its spec changes.
    pub const TERMINAL_FAILURE: &str = "TerminalFailure";
}
