//! Declared-resource model: the [`Managed`] trait plus the supporting
//! condition, reference, and selector types.
//!
//! A declared resource is a named, versioned record of desired state for one
//! object in a remote system. The engine never inspects provider-specific
//! spec fields; everything it needs goes through [`Managed`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Static kind name of a declared-resource type (e.g. `"HostedZone"`).
pub type Kind = &'static str;

/// A named pointer to exactly one other declared resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Name of the target resource.
    pub name: String,
}

impl Reference {
    /// Create a reference to the named resource.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A label matcher resolving to declared resources among candidates.
///
/// A resource matches when every `match_labels` entry is present on the
/// resource with an equal value. An empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    /// Labels the target must carry.
    pub match_labels: BTreeMap<String, String>,
}

impl Selector {
    /// Build a selector from `(key, value)` label pairs.
    pub fn matching<K, V, I>(labels: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Whether the given label set satisfies this selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (k, v) in &self.match_labels {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// Condition status following Kubernetes conventions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// Condition is true.
    True,
    /// Condition is false.
    False,
    /// Condition status is unknown.
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A named, timestamped observation about a declared resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Type of condition (e.g. Available, Synced).
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown).
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition.
    pub reason: String,

    /// Human-readable message.
    pub message: String,

    /// Last time the condition transitioned between statuses.
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Condition type reporting whether the remote object is usable.
    pub const AVAILABLE: &'static str = "Available";
    /// Condition type reporting whether the last reconcile pass succeeded.
    pub const SYNCED: &'static str = "Synced";

    /// Create a new condition with the current timestamp.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// The remote object exists and matches the declared state.
    pub fn available() -> Self {
        Self::new(
            Self::AVAILABLE,
            ConditionStatus::True,
            "Available",
            "external resource is available",
        )
    }

    /// The remote object is not usable for the given reason.
    pub fn unavailable(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Self::AVAILABLE, ConditionStatus::False, reason, message)
    }

    /// The remote object is being created.
    pub fn creating() -> Self {
        Self::new(
            Self::AVAILABLE,
            ConditionStatus::False,
            "Creating",
            "external resource is being created",
        )
    }

    /// The remote object is being deleted.
    pub fn deleting() -> Self {
        Self::new(
            Self::AVAILABLE,
            ConditionStatus::False,
            "Deleting",
            "external resource is being deleted",
        )
    }

    /// The last reconcile pass completed successfully.
    pub fn synced() -> Self {
        Self::new(
            Self::SYNCED,
            ConditionStatus::True,
            "ReconcileSuccess",
            "declared and external state are converged",
        )
    }

    /// The last reconcile pass did not complete.
    pub fn not_synced(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Self::SYNCED, ConditionStatus::False, reason, message)
    }
}

/// The condition set of a declared resource, keyed by condition type.
///
/// Setting a condition replaces any previous condition of the same type.
/// The transition timestamp only advances when the status actually changes,
/// so repeated identical reports do not churn the recorded history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// An empty condition set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a condition, replacing any existing condition of the same type.
    pub fn set(&mut self, mut condition: Condition) {
        if let Some(existing) = self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        } else {
            self.0.push(condition);
        }
    }

    /// Look up the condition of the given type.
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Whether the condition of the given type is currently True.
    pub fn is_true(&self, type_: &str) -> bool {
        matches!(
            self.get(type_),
            Some(Condition {
                status: ConditionStatus::True,
                ..
            })
        )
    }

    /// Iterate over all conditions.
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Number of conditions present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no conditions have been reported yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A lightweight pointer to a declared resource, for logs and events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectRef {
    /// Kind of the resource.
    pub kind: String,
    /// Name of the resource.
    pub name: String,
}

impl ObjectRef {
    /// Build a reference to the given resource.
    pub fn of<M: Managed>(resource: &M) -> Self {
        Self {
            kind: M::KIND.to_string(),
            name: resource.name().to_string(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A declared resource the engine can drive toward its remote counterpart.
///
/// Implementations supply identity, labels, optimistic-concurrency metadata,
/// the external-name binding, the deletion flag, and the condition set. The
/// provider-specific spec fields stay private to the implementing type.
/// Equality is whole-record equality; stores use it to turn writes that
/// change nothing into no-ops, so level-triggered condition reports do not
/// feed back into the watch stream.
pub trait Managed: Clone + PartialEq + Send + Sync + 'static {
    /// Static kind name of this resource type.
    const KIND: Kind;

    /// Name of the resource; unique per kind within the store.
    fn name(&self) -> &str;

    /// Labels used for selector matching.
    fn labels(&self) -> &BTreeMap<String, String>;

    /// Version stamp for optimistic-concurrency writes. Zero means the
    /// resource has never been stored.
    fn resource_version(&self) -> u64;

    /// Set the version stamp. Called by stores when persisting.
    fn set_resource_version(&mut self, version: u64);

    /// The durable identity binding this resource to one remote object.
    /// Absent until first successful creation.
    fn external_name(&self) -> Option<&str>;

    /// Raw external-name setter. Use [`assign_external_name`] instead, which
    /// enforces the assign-exactly-once invariant.
    fn set_external_name(&mut self, name: String);

    /// Whether deletion of this resource has been requested.
    fn deletion_requested(&self) -> bool;

    /// Mark this resource for deletion. Called by stores on delete requests.
    fn request_deletion(&mut self);

    /// Conditions reported on this resource.
    fn conditions(&self) -> &Conditions;

    /// Mutable access to the condition set.
    fn conditions_mut(&mut self) -> &mut Conditions;
}

/// Bind a resource to its remote object's identity.
///
/// The external name is assigned exactly once. Re-assigning the identical
/// value is a no-op; re-assigning a different value is a defect and fails
/// with [`Error::ExternalNameConflict`].
pub fn assign_external_name<M: Managed>(resource: &mut M, name: &str) -> Result<(), Error> {
    match resource.external_name() {
        Some(existing) if existing == name => Ok(()),
        Some(existing) => Err(Error::ExternalNameConflict {
            resource: ObjectRef::of(resource).to_string(),
            existing: existing.to_string(),
            proposed: name.to_string(),
        }),
        None => {
            resource.set_external_name(name.to_string());
            Ok(())
        }
    }
}
