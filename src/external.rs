//! External system adapter boundary.
//!
//! The remote system is reached only through an [`ExternalClient`], a
//! per-kind facade over whatever API client the provider supplies. The
//! engine never sees the remote wire format; it works with the opaque
//! associated types declared by [`ExternalKind`].

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::Managed;

/// Binds a declared-resource type to the request and response shapes of its
/// remote API.
///
/// All input types must be constructible empty; the reconciler derives each
/// request by starting from `Default::default()` and handing it to the
/// generate-input hooks for the kind.
pub trait ExternalKind: Managed {
    /// Opaque representation of the remote object as returned by
    /// describe/list. Recomputed every reconcile pass, never persisted.
    type State: Clone + Send + Sync + 'static;

    /// Request shape for describe and list calls.
    type DescribeInput: Default + Send + Sync + 'static;

    /// Request shape for create calls.
    type CreateInput: Default + Send + Sync + 'static;

    /// Request shape for update calls.
    type UpdateInput: Default + Send + Sync + 'static;

    /// Request shape for delete calls. Hooks populate identity fields
    /// (parent id plus own id) before the adapter is invoked.
    type DeleteInput: Default + Send + Sync + 'static;
}

/// Errors returned by an external client adapter.
///
/// "Not found" is distinguished from all other failures: it drives the
/// Create branch on observe and is treated as success on delete.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ExternalError {
    /// The remote object does not exist.
    #[error("remote object not found")]
    NotFound,

    /// The remote call failed.
    #[error("remote call failed: {message}")]
    Remote {
        /// Description of the failure.
        message: String,
        /// Whether retrying the call later can succeed (throttling,
        /// timeouts) or the request itself is unacceptable.
        retryable: bool,
    },
}

impl ExternalError {
    /// A transient remote failure, safe to retry with backoff.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent remote failure; retrying without a spec change is futile.
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether this error means the remote object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Whether a later retry of the failed call can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Remote { retryable, .. } => *retryable,
        }
    }
}

/// What an observe step learned about the remote object.
#[derive(Clone, Debug)]
pub enum Observation<S> {
    /// No remote object corresponds to the declared resource.
    Absent,
    /// The remote object exists, with its current state.
    Present(S),
}

impl<S> Observation<S> {
    /// Whether the remote object exists.
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    /// The observed state, if the object exists.
    pub fn state(&self) -> Option<&S> {
        match self {
            Self::Absent => None,
            Self::Present(state) => Some(state),
        }
    }
}

/// Typed per-kind facade over the remote system's API client.
///
/// Adapter calls are the only suspension points in a reconcile pass. Errors
/// must distinguish not-found from every other failure; nothing else about
/// the remote schema leaks through this boundary.
#[async_trait]
pub trait ExternalClient<K: ExternalKind>: Send + Sync {
    /// Point lookup of the remote object by its external identity.
    async fn describe(&self, input: &K::DescribeInput) -> Result<K::State, ExternalError>;

    /// Scoped enumeration, for kinds whose remote API has no point lookup.
    /// The reconciler reduces the result with the kind's `filter_list` hook.
    async fn list(&self, input: &K::DescribeInput) -> Result<Vec<K::State>, ExternalError>;

    /// Create the remote object. The returned state must carry the identity
    /// the `post_create` hook extracts into the external name.
    async fn create(&self, input: &K::CreateInput) -> Result<K::State, ExternalError>;

    /// Update the remote object in place, scoped by identity.
    async fn update(&self, input: &K::UpdateInput) -> Result<(), ExternalError>;

    /// Delete the remote object. Returning [`ExternalError::NotFound`] is
    /// treated as success by the reconciler.
    async fn delete(&self, input: &K::DeleteInput) -> Result<(), ExternalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_distinguished() {
        assert!(ExternalError::NotFound.is_not_found());
        assert!(!ExternalError::remote("throttled").is_not_found());
    }

    #[test]
    fn retryability_follows_classification() {
        assert!(ExternalError::remote("throttled").is_retryable());
        assert!(!ExternalError::terminal("malformed request").is_retryable());
    }

    #[test]
    fn observation_accessors() {
        let absent: Observation<u32> = Observation::Absent;
        assert!(!absent.is_present());
        assert_eq!(absent.state(), None);

        let present = Observation::Present(7u32);
        assert!(present.is_present());
        assert_eq!(present.state(), Some(&7));
    }
}
