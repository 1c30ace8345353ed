//! Per-kind lifecycle hooks.
//!
//! Hooks are customization points invoked immediately before and after each
//! adapter call. They mutate requests, post-process responses, assign
//! identity, and filter list results; they never control whether the
//! surrounding call happens. Every hook has a no-op default, so a kind only
//! implements the steps it needs.
//!
//! The generate-input hooks are pure: they take the derived request by
//! value and return it, possibly amended (typically with parent-scope ids
//! and the resource's external name).

use async_trait::async_trait;

use crate::external::{ExternalKind, Observation};
use crate::Error;

/// How the observe step looks up the remote object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lookup {
    /// Point lookup by external name. No remote call is made while the
    /// external name is unset.
    #[default]
    Get,
    /// Scoped list reduced by [`Hooks::filter_list`]. Used when the remote
    /// API has no point lookup; also the recovery path when an identity
    /// write was lost, since listing does not require the external name.
    List,
}

/// Lifecycle hooks for one declared-resource kind.
///
/// All methods default to no-ops. `pre_*` errors abort the step before the
/// remote call; `post_*` errors propagate without discarding side effects
/// the remote call already committed (in particular an assigned identity,
/// which the reconciler persists regardless).
#[async_trait]
pub trait Hooks<K: ExternalKind>: Send + Sync {
    /// Which lookup strategy the observe step uses for this kind.
    fn lookup(&self) -> Lookup {
        Lookup::Get
    }

    /// Runs before the observe lookup.
    async fn pre_observe(&self, _resource: &K) -> Result<(), Error> {
        Ok(())
    }

    /// Runs after the observe lookup with its outcome. May set conditions
    /// on the resource or substitute the error; returning `Ok` after an
    /// observe failure ends the pass quietly with a requeue.
    async fn post_observe(
        &self,
        _resource: &mut K,
        outcome: Result<&Observation<K::State>, &Error>,
    ) -> Result<(), Error> {
        match outcome {
            Ok(_) => Ok(()),
            Err(e) => Err(e.clone()),
        }
    }

    /// Runs before the create call, after the create input is generated.
    async fn pre_create(&self, _resource: &mut K) -> Result<(), Error> {
        Ok(())
    }

    /// Runs after a successful create. Implementations MUST bind the
    /// external name from the response here (via
    /// [`crate::resource::assign_external_name`]); the reconciler persists
    /// it immediately afterwards, before any other mutation.
    async fn post_create(&self, _resource: &mut K, _created: &K::State) -> Result<(), Error> {
        Ok(())
    }

    /// Runs before the update call.
    async fn pre_update(&self, _resource: &mut K) -> Result<(), Error> {
        Ok(())
    }

    /// Runs after a successful update.
    async fn post_update(&self, _resource: &mut K) -> Result<(), Error> {
        Ok(())
    }

    /// Runs before the delete call.
    async fn pre_delete(&self, _resource: &mut K) -> Result<(), Error> {
        Ok(())
    }

    /// Runs after a delete that succeeded or found the object already gone.
    async fn post_delete(&self, _resource: &mut K) -> Result<(), Error> {
        Ok(())
    }

    /// Copy remote-observed defaults into unset spec fields. Returns whether
    /// anything changed; changes are persisted without being treated as
    /// drift.
    fn late_initialize(&self, _resource: &mut K, _observed: &K::State) -> bool {
        false
    }

    /// Whether the observed remote state matches the declared spec. The
    /// default reports up-to-date, so kinds without an update surface never
    /// issue Update calls.
    fn is_up_to_date(&self, _resource: &K, _observed: &K::State) -> Result<bool, Error> {
        Ok(true)
    }

    /// Reduce a list result to the items corresponding to the declared
    /// resource. After filtering, more than one remaining item is reported
    /// loudly as a duplicate-identity defect.
    fn filter_list(&self, _resource: &K, items: Vec<K::State>) -> Vec<K::State> {
        items
    }

    /// Amend the derived describe/list input before defaults are applied.
    fn pre_generate_describe_input(&self, _resource: &K, input: K::DescribeInput) -> K::DescribeInput {
        input
    }

    /// Amend the derived describe/list input after defaults are applied.
    fn post_generate_describe_input(
        &self,
        _resource: &K,
        input: K::DescribeInput,
    ) -> K::DescribeInput {
        input
    }

    /// Amend the derived create input before defaults are applied.
    fn pre_generate_create_input(&self, _resource: &K, input: K::CreateInput) -> K::CreateInput {
        input
    }

    /// Amend the derived create input after defaults are applied.
    fn post_generate_create_input(&self, _resource: &K, input: K::CreateInput) -> K::CreateInput {
        input
    }

    /// Amend the derived update input before defaults are applied.
    fn pre_generate_update_input(&self, _resource: &K, input: K::UpdateInput) -> K::UpdateInput {
        input
    }

    /// Amend the derived update input after defaults are applied.
    fn post_generate_update_input(&self, _resource: &K, input: K::UpdateInput) -> K::UpdateInput {
        input
    }

    /// Amend the derived delete input before defaults are applied.
    fn pre_generate_delete_input(&self, _resource: &K, input: K::DeleteInput) -> K::DeleteInput {
        input
    }

    /// Amend the derived delete input after defaults are applied. This is
    /// where identity fields (parent id plus own id) land on the request.
    fn post_generate_delete_input(&self, _resource: &K, input: K::DeleteInput) -> K::DeleteInput {
        input
    }
}

/// The all-defaults hook set, for kinds that need no customization.
pub struct DefaultHooks;

#[async_trait]
impl<K: ExternalKind> Hooks<K> for DefaultHooks {}
