//! Error types for the reconciliation engine.
//!
//! The taxonomy mirrors how failures are handled: collaborator errors are
//! wrapped with `#[from]`, and [`Error::is_terminal`] tells the controller
//! whether a failure should be retried with backoff or parked until the
//! declared spec changes.

use thiserror::Error;

use crate::external::ExternalError;
use crate::reference::ResolveError;
use crate::store::StoreError;

/// Main error type for engine operations.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Declared-resource store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Cross-resource reference resolution error.
    #[error("reference resolution error: {0}")]
    Resolve(#[from] ResolveError),

    /// Remote system adapter error.
    #[error("external system error: {0}")]
    External(#[from] ExternalError),

    /// A lifecycle hook failed and aborted its step.
    #[error("hook error during {stage}: {message}")]
    Hook {
        /// The reconcile step whose hook failed (e.g. "post_create").
        stage: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The declared spec is invalid and cannot be reconciled.
    #[error("validation error: {0}")]
    Validation(String),

    /// An attempt to rebind a resource to a different remote identity.
    /// The external name is assigned exactly once; this is a defect.
    #[error("external name for {resource} already bound to {existing}, refusing {proposed}")]
    ExternalNameConflict {
        /// The resource whose identity was being reassigned.
        resource: String,
        /// The identity already bound.
        existing: String,
        /// The conflicting identity that was proposed.
        proposed: String,
    },

    /// A list-based lookup matched more than one remote object. External
    /// identity must be unique; duplicates are reported loudly instead of
    /// silently picking the first match.
    #[error("{count} remote objects match {resource}; external identity must be unique")]
    DuplicateExternal {
        /// The resource being observed.
        resource: String,
        /// How many remote objects matched.
        count: usize,
    },
}

impl Error {
    /// Create a validation error with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a hook error for the given reconcile stage.
    pub fn hook(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Hook {
            stage,
            message: message.into(),
        }
    }

    /// Whether this failure is terminal: retrying without a spec change
    /// cannot succeed, so the controller parks the resource instead of
    /// requeueing it.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::ExternalNameConflict { .. }
            | Self::DuplicateExternal { .. } => true,
            Self::Resolve(e) => e.is_terminal(),
            Self::External(e) => !e.is_retryable(),
            Self::Store(_) | Self::Hook { .. } => false,
        }
    }
}
