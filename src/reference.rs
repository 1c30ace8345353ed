//! Cross-resource reference resolution.
//!
//! A reference field lets one declared resource borrow the identity of
//! another instead of carrying a literal. Each field is a trio: a resolved
//! `value`, a named `ref`, and a label `selector` (used only when the ref is
//! absent). Resolution runs before reconciliation; a resource with any
//! unresolved reference field never reaches Observe or Create, since remote
//! calls must not be made with placeholder desired state.
//!
//! Resolution is deliberately tolerant of provisioning order: a missing or
//! not-yet-ready target is a retryable condition, answered by re-enqueue
//! with backoff rather than by ordering resources explicitly.

use async_trait::async_trait;
use thiserror::Error;

use crate::resource::{Managed, Reference, Selector};
use crate::store::{Store, StoreError};

/// Pure projection from a resolved target resource to the literal to store.
pub type Extractor<T> = fn(&T) -> Option<String>;

/// Standard extractors for [`ResolutionRequest::extract`].
pub mod extractors {
    use super::Managed;

    /// Extract the target's external name; `None` until the target has been
    /// bound to a remote object.
    pub fn external_name<T: Managed>(target: &T) -> Option<String> {
        target.external_name().map(str::to_string)
    }
}

/// One reference field's resolution input.
///
/// Ephemeral: built per field per reconcile pass, consumed by
/// [`Resolver::resolve`].
pub struct ResolutionRequest<T> {
    /// The field's already-resolved literal, if any. A non-empty value is
    /// returned unchanged; resolution never clobbers a settled value.
    pub current_value: Option<String>,
    /// Named pointer to the target resource.
    pub reference: Option<Reference>,
    /// Label matcher for the target, used only when `reference` is absent.
    pub selector: Option<Selector>,
    /// Projection from the resolved target to the literal to store.
    pub extract: Extractor<T>,
}

/// The outcome of resolving one reference field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolutionResponse {
    /// The literal to write into the field's `value`.
    pub resolved_value: Option<String>,
    /// The concrete reference to write back. Selectors are normalized to a
    /// reference on first successful resolution so later passes skip the
    /// candidate scan.
    pub resolved_reference: Option<Reference>,
}

/// Errors from reference resolution.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// The referenced resource does not exist yet. Retryable.
    #[error("referenced resource {name} does not exist")]
    ReferenceNotFound {
        /// Name of the missing target.
        name: String,
    },

    /// No declared resource matches the selector. Retryable.
    #[error("no resource matches selector {selector}")]
    NoMatch {
        /// The selector that matched nothing.
        selector: Selector,
    },

    /// More than one declared resource matches the selector. A
    /// configuration defect; not retried until the spec changes.
    #[error("{count} resources match selector {selector}; expected exactly one")]
    AmbiguousMatch {
        /// The ambiguous selector.
        selector: Selector,
        /// How many candidates matched.
        count: usize,
    },

    /// The target exists but has no external identity yet. Retryable: the
    /// caller re-enqueues and tries again after the target provisions.
    #[error("target {name} has no external identity yet")]
    TargetNotReady {
        /// Name of the not-yet-provisioned target.
        name: String,
    },

    /// The store failed while fetching candidates. Retryable.
    #[error("store error during resolution: {message}")]
    Store {
        /// Description of the failure.
        message: String,
    },
}

impl ResolveError {
    /// Whether this failure requires a spec change to make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AmbiguousMatch { .. })
    }
}

/// Resolves reference fields against a store of target resources.
pub struct Resolver<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: ?Sized> Resolver<'a, S> {
    /// Create a resolver reading targets from the given store.
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Resolve one reference field.
    ///
    /// The algorithm, in order: an already-settled value is returned
    /// unchanged; a named reference is fetched directly; otherwise the
    /// selector is matched against candidates and must select exactly one.
    /// The extractor then projects the target into the literal; an empty
    /// projection means the target is not provisioned yet.
    pub async fn resolve<T>(
        &self,
        request: ResolutionRequest<T>,
    ) -> Result<ResolutionResponse, ResolveError>
    where
        T: Managed,
        S: Store<T>,
    {
        if let Some(value) = request.current_value.filter(|v| !v.is_empty()) {
            return Ok(ResolutionResponse {
                resolved_value: Some(value),
                resolved_reference: request.reference,
            });
        }

        if let Some(reference) = request.reference {
            let target = self.store.get(&reference.name).await.map_err(|e| match e {
                StoreError::NotFound { .. } => ResolveError::ReferenceNotFound {
                    name: reference.name.clone(),
                },
                other => ResolveError::Store {
                    message: other.to_string(),
                },
            })?;

            let value = (request.extract)(&target).filter(|v| !v.is_empty()).ok_or(
                ResolveError::TargetNotReady {
                    name: reference.name.clone(),
                },
            )?;

            return Ok(ResolutionResponse {
                resolved_value: Some(value),
                resolved_reference: Some(reference),
            });
        }

        let Some(selector) = request.selector else {
            // Nothing drives this field; leave it unset.
            return Ok(ResolutionResponse::default());
        };

        let mut candidates =
            self.store
                .list(Some(&selector))
                .await
                .map_err(|e| ResolveError::Store {
                    message: e.to_string(),
                })?;

        match candidates.len() {
            0 => Err(ResolveError::NoMatch { selector }),
            1 => {
                let target = candidates.remove(0);
                let name = target.name().to_string();
                let value = (request.extract)(&target).filter(|v| !v.is_empty()).ok_or(
                    ResolveError::TargetNotReady { name: name.clone() },
                )?;
                Ok(ResolutionResponse {
                    resolved_value: Some(value),
                    resolved_reference: Some(Reference::new(name)),
                })
            }
            count => Err(ResolveError::AmbiguousMatch { selector, count }),
        }
    }
}

/// Per-kind reference resolution, run by the controller before each
/// reconcile pass.
///
/// Implementations call [`Resolver::resolve`] once per reference field and
/// write the resolved value plus the normalized reference back into the
/// spec, returning whether anything changed and must be persisted.
#[async_trait]
pub trait ReferenceResolver<M: Managed>: Send + Sync {
    /// Resolve all reference fields of the resource in place.
    async fn resolve_references(&self, resource: &mut M) -> Result<bool, ResolveError>;
}

/// Resolver for kinds without reference fields.
pub struct NoReferences;

#[async_trait]
impl<M: Managed> ReferenceResolver<M> for NoReferences {
    async fn resolve_references(&self, _resource: &mut M) -> Result<bool, ResolveError> {
        Ok(false)
    }
}
