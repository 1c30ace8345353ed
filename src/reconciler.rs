//! The reconcile state machine.
//!
//! One [`Reconciler`] drives one declared resource through a single pass:
//! Observe the remote object, then branch to Create, Update, Delete, or
//! report convergence. The machine is level-triggered: nothing is persisted
//! about the previous pass, and the branch is recomputed every time from the
//! declared spec and the freshly observed external state, so missed events
//! are harmless.
//!
//! The single most dangerous failure mode is a crash between remote creation
//! and persisting the returned identity, which orphans the remote object.
//! The create path therefore persists the external name as its very first
//! store write after the create call returns, before any other mutation and
//! regardless of cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::{reasons, EventSink, EventType, NoopEventSink};
use crate::external::{ExternalClient, ExternalKind, Observation};
use crate::hooks::{DefaultHooks, Hooks, Lookup};
use crate::resource::{Condition, Managed, ObjectRef};
use crate::store::Store;
use crate::{Error, DEFAULT_POLL_INTERVAL, DEFAULT_SYNC_INTERVAL};

/// What the controller should do with the resource after a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run another pass after the given delay.
    Requeue(Duration),
    /// Nothing left to do until the declared resource changes.
    AwaitChange,
}

impl Action {
    /// Requeue after the given delay.
    pub fn requeue(after: Duration) -> Self {
        Self::Requeue(after)
    }

    /// Wait for a spec change instead of requeueing.
    pub fn await_change() -> Self {
        Self::AwaitChange
    }
}

/// Drives declared resources of one kind toward their remote counterparts.
pub struct Reconciler<K: ExternalKind> {
    store: Arc<dyn Store<K>>,
    client: Arc<dyn ExternalClient<K>>,
    hooks: Arc<dyn Hooks<K>>,
    events: Arc<dyn EventSink>,
    poll_interval: Duration,
    sync_interval: Duration,
}

impl<K: ExternalKind> Reconciler<K> {
    /// Create a reconciler with default hooks and no event sink.
    pub fn new(store: Arc<dyn Store<K>>, client: Arc<dyn ExternalClient<K>>) -> Self {
        Self {
            store,
            client,
            hooks: Arc::new(DefaultHooks),
            events: Arc::new(NoopEventSink),
            poll_interval: DEFAULT_POLL_INTERVAL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    /// Use the given per-kind lifecycle hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks<K>>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Record events to the given sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Delay before re-observing after a remote mutation.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Delay before re-observing a converged resource.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Run one reconcile pass for the given resource.
    ///
    /// The resource is a snapshot fetched by the caller; all persistence
    /// happens through the store with conditional writes, so a stale
    /// snapshot fails with a conflict and the caller re-runs the pass.
    #[instrument(skip_all, fields(kind = K::KIND, resource = %resource.name()))]
    pub async fn reconcile(
        &self,
        resource: K,
        cancel: &CancellationToken,
    ) -> Result<Action, Error> {
        let mut resource = resource;

        if cancel.is_cancelled() {
            debug!("pass cancelled before observe");
            return Ok(Action::requeue(self.poll_interval));
        }

        self.hooks.pre_observe(&resource).await?;
        let observed = self.observe(&resource).await;
        if let Err(e) = self
            .hooks
            .post_observe(&mut resource, observed.as_ref())
            .await
        {
            return Err(self.fail(&mut resource, reasons::OBSERVE_FAILED, e).await);
        }
        let observation = match observed {
            Ok(observation) => observation,
            Err(_) => {
                // post_observe substituted success for the failure; end the
                // pass quietly and look again later.
                debug!("observe failure absorbed by post_observe hook");
                return Ok(Action::requeue(self.poll_interval));
            }
        };

        match observation {
            Observation::Absent if resource.deletion_requested() => {
                // Nothing remote to clean up; deletion is idempotent.
                self.finalize(&mut resource).await
            }
            Observation::Absent => self.create(&mut resource, cancel).await,
            Observation::Present(state) if resource.deletion_requested() => {
                self.delete(&mut resource, state, cancel).await
            }
            Observation::Present(state) => self.sync(&mut resource, state, cancel).await,
        }
    }

    /// Look up the remote object, by external name or by filtered list.
    async fn observe(&self, resource: &K) -> Result<Observation<K::State>, Error> {
        let input = self.hooks.post_generate_describe_input(
            resource,
            self.hooks
                .pre_generate_describe_input(resource, K::DescribeInput::default()),
        );

        match self.hooks.lookup() {
            Lookup::Get => match resource.external_name() {
                None => Ok(Observation::Absent),
                Some(_) => match self.client.describe(&input).await {
                    Ok(state) => Ok(Observation::Present(state)),
                    Err(e) if e.is_not_found() => Ok(Observation::Absent),
                    Err(e) => Err(e.into()),
                },
            },
            Lookup::List => {
                let items = match self.client.list(&input).await {
                    Ok(items) => items,
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e.into()),
                };
                let mut matched = self.hooks.filter_list(resource, items);
                match matched.len() {
                    0 => Ok(Observation::Absent),
                    1 => Ok(Observation::Present(matched.remove(0))),
                    count => Err(Error::DuplicateExternal {
                        resource: ObjectRef::of(resource).to_string(),
                        count,
                    }),
                }
            }
        }
    }

    async fn create(&self, resource: &mut K, cancel: &CancellationToken) -> Result<Action, Error> {
        if cancel.is_cancelled() {
            debug!("pass cancelled before create");
            return Ok(Action::requeue(self.poll_interval));
        }

        if let Err(e) = self.hooks.pre_create(resource).await {
            return Err(self.fail(resource, reasons::CREATE_FAILED, e).await);
        }
        let input = self.hooks.post_generate_create_input(
            resource,
            self.hooks
                .pre_generate_create_input(resource, K::CreateInput::default()),
        );

        info!("creating external resource");
        resource.conditions_mut().set(Condition::creating());

        let created = match self.client.create(&input).await {
            Ok(state) => state,
            Err(e) => return Err(self.fail(resource, reasons::CREATE_FAILED, e.into()).await),
        };

        // The remote object now exists. Its identity must reach the store
        // before anything else happens to this resource, cancellation
        // included; a lost identity orphans the remote object.
        let post = self.hooks.post_create(resource, &created).await;
        if resource.external_name().is_some() {
            self.persist(resource).await?;
        }
        if let Err(e) = post {
            return Err(self.fail(resource, reasons::CREATE_FAILED, e).await);
        }
        let Some(external_name) = resource.external_name() else {
            let err = Error::hook(
                "post_create",
                "external name not assigned from create response",
            );
            return Err(self.fail(resource, reasons::CREATE_FAILED, err).await);
        };

        let message = format!("created external resource {external_name}");
        self.record(resource, EventType::Normal, reasons::CREATED, &message)
            .await;
        Ok(Action::requeue(self.poll_interval))
    }

    async fn sync(
        &self,
        resource: &mut K,
        state: K::State,
        cancel: &CancellationToken,
    ) -> Result<Action, Error> {
        if self.hooks.late_initialize(resource, &state) {
            debug!("late-initialized spec fields from remote defaults");
            self.persist(resource).await?;
        }

        let up_to_date = match self.hooks.is_up_to_date(resource, &state) {
            Ok(up_to_date) => up_to_date,
            Err(e) => return Err(self.fail(resource, reasons::UPDATE_FAILED, e).await),
        };

        if up_to_date {
            resource.conditions_mut().set(Condition::available());
            resource.conditions_mut().set(Condition::synced());
            self.persist(resource).await?;
            debug!("declared and external state converged");
            return Ok(Action::requeue(self.sync_interval));
        }

        if cancel.is_cancelled() {
            debug!("pass cancelled before update");
            return Ok(Action::requeue(self.poll_interval));
        }

        if let Err(e) = self.hooks.pre_update(resource).await {
            return Err(self.fail(resource, reasons::UPDATE_FAILED, e).await);
        }
        let input = self.hooks.post_generate_update_input(
            resource,
            self.hooks
                .pre_generate_update_input(resource, K::UpdateInput::default()),
        );

        info!("updating external resource");
        if let Err(e) = self.client.update(&input).await {
            return Err(self.fail(resource, reasons::UPDATE_FAILED, e.into()).await);
        }
        if let Err(e) = self.hooks.post_update(resource).await {
            return Err(self.fail(resource, reasons::UPDATE_FAILED, e).await);
        }

        self.record(
            resource,
            EventType::Normal,
            reasons::UPDATED,
            "updated external resource",
        )
        .await;
        self.persist(resource).await?;
        Ok(Action::requeue(self.poll_interval))
    }

    async fn delete(
        &self,
        resource: &mut K,
        _state: K::State,
        cancel: &CancellationToken,
    ) -> Result<Action, Error> {
        if cancel.is_cancelled() {
            debug!("pass cancelled before delete");
            return Ok(Action::requeue(self.poll_interval));
        }

        resource.conditions_mut().set(Condition::deleting());

        if let Err(e) = self.hooks.pre_delete(resource).await {
            return Err(self.fail(resource, reasons::DELETE_FAILED, e).await);
        }
        let input = self.hooks.post_generate_delete_input(
            resource,
            self.hooks
                .pre_generate_delete_input(resource, K::DeleteInput::default()),
        );

        info!("deleting external resource");
        match self.client.delete(&input).await {
            Ok(()) => {}
            // Deletion is idempotent: already-gone is success.
            Err(e) if e.is_not_found() => debug!("remote object already gone"),
            Err(e) => return Err(self.fail(resource, reasons::DELETE_FAILED, e.into()).await),
        }
        if let Err(e) = self.hooks.post_delete(resource).await {
            return Err(self.fail(resource, reasons::DELETE_FAILED, e).await);
        }

        self.finalize(resource).await
    }

    /// Remove the declared resource from the store once nothing remote
    /// remains to clean up.
    async fn finalize(&self, resource: &mut K) -> Result<Action, Error> {
        self.record(
            resource,
            EventType::Normal,
            reasons::DELETED,
            "external resource deleted",
        )
        .await;
        self.store.remove(resource.name()).await?;
        info!("declared resource removed");
        Ok(Action::await_change())
    }

    /// Persist the resource and adopt the store's bumped version stamp.
    async fn persist(&self, resource: &mut K) -> Result<(), Error> {
        *resource = self.store.update(resource).await?;
        Ok(())
    }

    /// Report a failed step: condition, event, best-effort persist.
    async fn fail(&self, resource: &mut K, reason: &'static str, error: Error) -> Error {
        warn!(error = %error, reason, "reconcile step failed");
        resource
            .conditions_mut()
            .set(Condition::not_synced(reason, error.to_string()));
        self.record(resource, EventType::Warning, reason, &error.to_string())
            .await;
        // Losing this write only delays the report to the next pass.
        if let Err(persist_err) = self.store.update(resource).await {
            debug!(error = %persist_err, "could not persist failure condition");
        }
        error
    }

    async fn record(&self, resource: &K, type_: EventType, reason: &str, message: &str) {
        self.events
            .record(&ObjectRef::of(resource), type_, reason, message)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MockEventSink;
    use crate::external::ExternalError;
    use crate::resource::{assign_external_name, Conditions, Kind};
    use crate::store::{MemoryStore, StoreError, WatchStream};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    // ==========================================================================
    // Fixture: a Bucket kind backed by a fake remote API
    // ==========================================================================

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Bucket {
        name: String,
        labels: BTreeMap<String, String>,
        version: u64,
        external_name: Option<String>,
        deleting: bool,
        conditions: Conditions,
        payload: String,
    }

    impl Bucket {
        fn declared(name: &str, payload: &str) -> Self {
            Self {
                name: name.to_string(),
                payload: payload.to_string(),
                ..Default::default()
            }
        }
    }

    impl Managed for Bucket {
        const KIND: Kind = "Bucket";

        fn name(&self) -> &str {
            &self.name
        }
        fn labels(&self) -> &BTreeMap<String, String> {
            &self.labels
        }
        fn resource_version(&self) -> u64 {
            self.version
        }
        fn set_resource_version(&mut self, version: u64) {
            self.version = version;
        }
        fn external_name(&self) -> Option<&str> {
            self.external_name.as_deref()
        }
        fn set_external_name(&mut self, name: String) {
            self.external_name = Some(name);
        }
        fn deletion_requested(&self) -> bool {
            self.deleting
        }
        fn request_deletion(&mut self) {
            self.deleting = true;
        }
        fn conditions(&self) -> &Conditions {
            &self.conditions
        }
        fn conditions_mut(&mut self) -> &mut Conditions {
            &mut self.conditions
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    struct BucketState {
        id: String,
        name: String,
        payload: String,
    }

    #[derive(Clone, Debug, Default)]
    struct DescribeBucketInput {
        id: Option<String>,
    }

    #[derive(Clone, Debug, Default)]
    struct CreateBucketInput {
        name: String,
        payload: String,
    }

    #[derive(Clone, Debug, Default)]
    struct UpdateBucketInput {
        id: Option<String>,
        payload: String,
    }

    #[derive(Clone, Debug, Default)]
    struct DeleteBucketInput {
        id: Option<String>,
    }

    impl ExternalKind for Bucket {
        type State = BucketState;
        type DescribeInput = DescribeBucketInput;
        type CreateInput = CreateBucketInput;
        type UpdateInput = UpdateBucketInput;
        type DeleteInput = DeleteBucketInput;
    }

    /// Fake remote API with call counters.
    #[derive(Default)]
    struct FakeRemote {
        objects: Mutex<HashMap<String, BucketState>>,
        ids: AtomicU32,
        creates: AtomicU32,
        updates: AtomicU32,
        deletes: AtomicU32,
        /// Pretend a concurrent actor already deleted the object.
        delete_reports_not_found: AtomicBool,
        /// Cancel this token from inside the create call, to exercise the
        /// identity-durability-over-cancellation guarantee.
        cancel_during_create: Mutex<Option<CancellationToken>>,
    }

    impl FakeRemote {
        fn seed(&self, state: BucketState) {
            self.objects
                .lock()
                .unwrap()
                .insert(state.id.clone(), state);
        }

        fn object(&self, id: &str) -> Option<BucketState> {
            self.objects.lock().unwrap().get(id).cloned()
        }

        fn create_count(&self) -> u32 {
            self.creates.load(Ordering::SeqCst)
        }

        fn update_count(&self) -> u32 {
            self.updates.load(Ordering::SeqCst)
        }

        fn delete_count(&self) -> u32 {
            self.deletes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ExternalClient<Bucket> for FakeRemote {
        async fn describe(&self, input: &DescribeBucketInput) -> Result<BucketState, ExternalError> {
            let id = input.id.as_deref().ok_or(ExternalError::NotFound)?;
            self.object(id).ok_or(ExternalError::NotFound)
        }

        async fn list(&self, _input: &DescribeBucketInput) -> Result<Vec<BucketState>, ExternalError> {
            let mut all: Vec<BucketState> = self.objects.lock().unwrap().values().cloned().collect();
            all.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(all)
        }

        async fn create(&self, input: &CreateBucketInput) -> Result<BucketState, ExternalError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if let Some(token) = self.cancel_during_create.lock().unwrap().take() {
                token.cancel();
            }
            let id = format!("ext-{}", self.ids.fetch_add(1, Ordering::SeqCst) + 1);
            let state = BucketState {
                id: id.clone(),
                name: input.name.clone(),
                payload: input.payload.clone(),
            };
            self.seed(state.clone());
            Ok(state)
        }

        async fn update(&self, input: &UpdateBucketInput) -> Result<(), ExternalError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            let id = input.id.as_deref().ok_or(ExternalError::NotFound)?;
            let mut objects = self.objects.lock().unwrap();
            let state = objects.get_mut(id).ok_or(ExternalError::NotFound)?;
            state.payload = input.payload.clone();
            Ok(())
        }

        async fn delete(&self, input: &DeleteBucketInput) -> Result<(), ExternalError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.delete_reports_not_found.load(Ordering::SeqCst) {
                return Err(ExternalError::NotFound);
            }
            let id = input.id.as_deref().ok_or(ExternalError::NotFound)?;
            match self.objects.lock().unwrap().remove(id) {
                Some(_) => Ok(()),
                None => Err(ExternalError::NotFound),
            }
        }
    }

    /// Hooks for the Bucket kind: identity assignment, input generation,
    /// drift detection, list filtering by name.
    struct BucketHooks {
        lookup: Lookup,
        late_initialize_payload: bool,
    }

    impl Default for BucketHooks {
        fn default() -> Self {
            Self {
                lookup: Lookup::Get,
                late_initialize_payload: false,
            }
        }
    }

    #[async_trait]
    impl Hooks<Bucket> for BucketHooks {
        fn lookup(&self) -> Lookup {
            self.lookup
        }

        async fn post_observe(
            &self,
            resource: &mut Bucket,
            outcome: Result<&Observation<BucketState>, &Error>,
        ) -> Result<(), Error> {
            // Adopt the identity of an object found without one; this is the
            // recovery path after a lost identity write.
            if let Ok(Observation::Present(state)) = outcome {
                assign_external_name(resource, &state.id)?;
            }
            match outcome {
                Ok(_) => Ok(()),
                Err(e) => Err(e.clone()),
            }
        }

        async fn post_create(
            &self,
            resource: &mut Bucket,
            created: &BucketState,
        ) -> Result<(), Error> {
            assign_external_name(resource, &created.id)
        }

        fn late_initialize(&self, resource: &mut Bucket, observed: &BucketState) -> bool {
            if self.late_initialize_payload && resource.payload.is_empty() {
                resource.payload = observed.payload.clone();
                return true;
            }
            false
        }

        fn is_up_to_date(&self, resource: &Bucket, observed: &BucketState) -> Result<bool, Error> {
            Ok(resource.payload == observed.payload)
        }

        fn filter_list(&self, resource: &Bucket, items: Vec<BucketState>) -> Vec<BucketState> {
            items
                .into_iter()
                .filter(|state| match resource.external_name() {
                    Some(id) => state.id == id,
                    None => state.name == resource.name(),
                })
                .collect()
        }

        fn post_generate_describe_input(
            &self,
            resource: &Bucket,
            mut input: DescribeBucketInput,
        ) -> DescribeBucketInput {
            input.id = resource.external_name().map(str::to_string);
            input
        }

        fn post_generate_create_input(
            &self,
            resource: &Bucket,
            mut input: CreateBucketInput,
        ) -> CreateBucketInput {
            input.name = resource.name().to_string();
            input.payload = resource.payload.clone();
            input
        }

        fn post_generate_update_input(
            &self,
            resource: &Bucket,
            mut input: UpdateBucketInput,
        ) -> UpdateBucketInput {
            input.id = resource.external_name().map(str::to_string);
            input.payload = resource.payload.clone();
            input
        }

        fn post_generate_delete_input(
            &self,
            resource: &Bucket,
            mut input: DeleteBucketInput,
        ) -> DeleteBucketInput {
            input.id = resource.external_name().map(str::to_string);
            input
        }
    }

    /// Store wrapper that fails one conditional write on demand.
    struct FlakyStore {
        inner: MemoryStore<Bucket>,
        fail_next_update: AtomicBool,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore<Bucket>) -> Self {
            Self {
                inner,
                fail_next_update: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Store<Bucket> for FlakyStore {
        async fn get(&self, name: &str) -> Result<Bucket, StoreError> {
            self.inner.get(name).await
        }
        async fn list(
            &self,
            selector: Option<&crate::resource::Selector>,
        ) -> Result<Vec<Bucket>, StoreError> {
            self.inner.list(selector).await
        }
        async fn update(&self, resource: &Bucket) -> Result<Bucket, StoreError> {
            if self.fail_next_update.swap(false, Ordering::SeqCst) {
                return Err(StoreError::unavailable("injected write failure"));
            }
            self.inner.update(resource).await
        }
        async fn mark_deleted(&self, name: &str) -> Result<Bucket, StoreError> {
            self.inner.mark_deleted(name).await
        }
        async fn remove(&self, name: &str) -> Result<(), StoreError> {
            self.inner.remove(name).await
        }
        fn watch(&self) -> WatchStream<Bucket> {
            self.inner.watch()
        }
    }

    struct Fixture {
        store: Arc<MemoryStore<Bucket>>,
        remote: Arc<FakeRemote>,
        reconciler: Reconciler<Bucket>,
    }

    fn fixture_with(hooks: BucketHooks) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeRemote::default());
        let reconciler = Reconciler::new(store.clone(), remote.clone()).with_hooks(Arc::new(hooks));
        Fixture {
            store,
            remote,
            reconciler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(BucketHooks::default())
    }

    async fn pass(fx: &Fixture, name: &str) -> Result<Action, Error> {
        let resource = fx.store.get(name).await.unwrap();
        fx.reconciler
            .reconcile(resource, &CancellationToken::new())
            .await
    }

    // ==========================================================================
    // Story tests: the reconcile lifecycle
    // ==========================================================================

    /// Story: a freshly declared bucket gets created remotely and its
    /// returned identity is persisted before anything else.
    #[tokio::test]
    async fn creates_when_absent_and_persists_identity() {
        let fx = fixture();
        fx.store
            .update(&Bucket::declared("data", "v1"))
            .await
            .unwrap();

        let action = pass(&fx, "data").await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_POLL_INTERVAL));
        assert_eq!(fx.remote.create_count(), 1);

        let stored = fx.store.get("data").await.unwrap();
        assert_eq!(stored.external_name(), Some("ext-1"));
        assert!(fx.remote.object("ext-1").is_some());
    }

    /// Story: once the remote object exists and matches, repeated passes
    /// never create again (Create count stays at one per identity).
    #[tokio::test]
    async fn repeated_passes_do_not_recreate() {
        let fx = fixture();
        fx.store
            .update(&Bucket::declared("data", "v1"))
            .await
            .unwrap();

        pass(&fx, "data").await.unwrap();
        let action = pass(&fx, "data").await.unwrap();
        let _ = pass(&fx, "data").await.unwrap();

        assert_eq!(fx.remote.create_count(), 1);
        assert_eq!(action, Action::requeue(DEFAULT_SYNC_INTERVAL));

        let stored = fx.store.get("data").await.unwrap();
        assert!(stored.conditions().is_true(Condition::AVAILABLE));
        assert!(stored.conditions().is_true(Condition::SYNCED));
    }

    /// Story: drifted remote state triggers exactly one Update, after which
    /// the next pass reports convergence.
    #[tokio::test]
    async fn updates_when_drifted() {
        let fx = fixture();
        fx.remote.seed(BucketState {
            id: "ext-9".to_string(),
            name: "data".to_string(),
            payload: "old".to_string(),
        });
        let mut declared = Bucket::declared("data", "new");
        declared.external_name = Some("ext-9".to_string());
        fx.store.update(&declared).await.unwrap();

        pass(&fx, "data").await.unwrap();
        assert_eq!(fx.remote.update_count(), 1);
        assert_eq!(fx.remote.create_count(), 0);
        assert_eq!(fx.remote.object("ext-9").unwrap().payload, "new");

        let action = pass(&fx, "data").await.unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_SYNC_INTERVAL));
        assert_eq!(fx.remote.update_count(), 1);
    }

    /// Story: remote-observed defaults are copied into unset spec fields
    /// without being treated as drift.
    #[tokio::test]
    async fn late_initialize_persists_without_update() {
        let fx = fixture_with(BucketHooks {
            late_initialize_payload: true,
            ..Default::default()
        });
        fx.remote.seed(BucketState {
            id: "ext-9".to_string(),
            name: "data".to_string(),
            payload: "remote-default".to_string(),
        });
        let mut declared = Bucket::declared("data", "");
        declared.external_name = Some("ext-9".to_string());
        fx.store.update(&declared).await.unwrap();

        pass(&fx, "data").await.unwrap();
        assert_eq!(fx.remote.update_count(), 0);
        assert_eq!(fx.store.get("data").await.unwrap().payload, "remote-default");
    }

    /// Story: deletion of an already-absent remote object succeeds without
    /// a delete call, and the declared record is finalized.
    #[tokio::test]
    async fn delete_of_absent_object_is_success() {
        let fx = fixture();
        let mut declared = Bucket::declared("data", "v1");
        declared.external_name = Some("ext-gone".to_string());
        fx.store.update(&declared).await.unwrap();
        fx.store.mark_deleted("data").await.unwrap();

        let action = pass(&fx, "data").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(fx.remote.delete_count(), 0);
        assert!(matches!(
            fx.store.get("data").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    /// Story: a delete that races a concurrent deletion sees not-found from
    /// the adapter and still reports success.
    #[tokio::test]
    async fn delete_treats_not_found_as_success() {
        let fx = fixture();
        fx.remote.seed(BucketState {
            id: "ext-9".to_string(),
            name: "data".to_string(),
            payload: "v1".to_string(),
        });
        fx.remote
            .delete_reports_not_found
            .store(true, Ordering::SeqCst);

        let mut declared = Bucket::declared("data", "v1");
        declared.external_name = Some("ext-9".to_string());
        fx.store.update(&declared).await.unwrap();
        fx.store.mark_deleted("data").await.unwrap();

        let action = pass(&fx, "data").await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(fx.remote.delete_count(), 1);
        assert!(fx.store.get("data").await.is_err());
    }

    /// Story: a pre-create hook failure aborts before any remote call.
    #[tokio::test]
    async fn pre_create_error_aborts_before_remote_call() {
        struct RejectingHooks;

        #[async_trait]
        impl Hooks<Bucket> for RejectingHooks {
            async fn pre_create(&self, _resource: &mut Bucket) -> Result<(), Error> {
                Err(Error::validation("payload must not be empty"))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeRemote::default());
        let reconciler =
            Reconciler::new(store.clone(), remote.clone()).with_hooks(Arc::new(RejectingHooks));

        store.update(&Bucket::declared("data", "")).await.unwrap();
        let resource = store.get("data").await.unwrap();
        let err = reconciler
            .reconcile(resource, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(remote.create_count(), 0);

        // The failure is visible on the resource, not silent
        let stored = store.get("data").await.unwrap();
        let synced = stored.conditions().get(Condition::SYNCED).unwrap();
        assert_eq!(synced.reason, reasons::CREATE_FAILED);
    }

    /// Story: a kind whose post-create hook forgets to bind identity is a
    /// defect, reported loudly.
    #[tokio::test]
    async fn post_create_must_assign_identity() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeRemote::default());
        // DefaultHooks never assigns an external name
        let reconciler = Reconciler::new(store.clone(), remote.clone());

        store.update(&Bucket::declared("data", "v1")).await.unwrap();
        let resource = store.get("data").await.unwrap();
        let err = reconciler
            .reconcile(resource, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Hook { stage: "post_create", .. }));
    }

    /// Story: list-based lookup finding two matching remote objects refuses
    /// to guess which one is ours.
    #[tokio::test]
    async fn duplicate_list_matches_fail_loudly() {
        let fx = fixture_with(BucketHooks {
            lookup: Lookup::List,
            ..Default::default()
        });
        fx.remote.seed(BucketState {
            id: "ext-1".to_string(),
            name: "data".to_string(),
            payload: "v1".to_string(),
        });
        fx.remote.seed(BucketState {
            id: "ext-2".to_string(),
            name: "data".to_string(),
            payload: "v1".to_string(),
        });
        fx.store
            .update(&Bucket::declared("data", "v1"))
            .await
            .unwrap();

        let err = pass(&fx, "data").await.unwrap_err();
        assert!(matches!(err, Error::DuplicateExternal { count: 2, .. }));
        assert!(err.is_terminal());
        assert_eq!(fx.remote.create_count(), 0);
    }

    /// Story: identity durability. The create succeeded remotely but the
    /// identity write was lost; the retried pass detects the existing
    /// object through list-and-filter instead of creating a duplicate.
    #[tokio::test]
    async fn lost_identity_write_recovers_without_duplicate_create() {
        let memory = MemoryStore::new();
        let store = Arc::new(FlakyStore::new(memory.clone()));
        let remote = Arc::new(FakeRemote::default());
        let reconciler = Reconciler::new(store.clone(), remote.clone()).with_hooks(Arc::new(
            BucketHooks {
                lookup: Lookup::List,
                ..Default::default()
            },
        ));

        memory.update(&Bucket::declared("data", "v1")).await.unwrap();

        // First pass: create succeeds remotely, the identity write fails
        store.fail_next_update.store(true, Ordering::SeqCst);
        let resource = memory.get("data").await.unwrap();
        let err = reconciler
            .reconcile(resource, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(remote.create_count(), 1);
        assert!(memory.get("data").await.unwrap().external_name().is_none());

        // Retried pass: list lookup finds the orphan, adopts it, no second create
        let resource = memory.get("data").await.unwrap();
        reconciler
            .reconcile(resource, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(remote.create_count(), 1);
        assert_eq!(
            memory.get("data").await.unwrap().external_name(),
            Some("ext-1")
        );
    }

    /// Story: cancellation fires while the create call is in flight; the
    /// returned identity is persisted anyway.
    #[tokio::test]
    async fn create_identity_survives_cancellation() {
        let fx = fixture();
        fx.store
            .update(&Bucket::declared("data", "v1"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        *fx.remote.cancel_during_create.lock().unwrap() = Some(cancel.clone());

        let resource = fx.store.get("data").await.unwrap();
        fx.reconciler.reconcile(resource, &cancel).await.unwrap();

        assert!(cancel.is_cancelled());
        assert_eq!(
            fx.store.get("data").await.unwrap().external_name(),
            Some("ext-1")
        );
    }

    /// Story: a cancelled token observed before the pass starts skips all
    /// remote calls.
    #[tokio::test]
    async fn cancelled_pass_makes_no_remote_calls() {
        let fx = fixture();
        fx.store
            .update(&Bucket::declared("data", "v1"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let resource = fx.store.get("data").await.unwrap();
        let action = fx.reconciler.reconcile(resource, &cancel).await.unwrap();

        assert_eq!(action, Action::requeue(DEFAULT_POLL_INTERVAL));
        assert_eq!(fx.remote.create_count(), 0);
    }

    /// Story: a stale snapshot loses its conditional write; the pass ends
    /// with a conflict and the controller reruns it on a fresh copy instead
    /// of clobbering the concurrent update.
    #[tokio::test]
    async fn stale_snapshot_write_conflicts() {
        let fx = fixture();
        fx.remote.seed(BucketState {
            id: "ext-9".to_string(),
            name: "data".to_string(),
            payload: "v1".to_string(),
        });
        let mut declared = Bucket::declared("data", "v1");
        declared.external_name = Some("ext-9".to_string());
        fx.store.update(&declared).await.unwrap();

        let stale = fx.store.get("data").await.unwrap();

        // A concurrent writer lands before the pass persists its conditions
        let mut concurrent = stale.clone();
        concurrent.payload = "v2".to_string();
        fx.store.update(&concurrent).await.unwrap();

        let err = fx
            .reconciler
            .reconcile(stale, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::Conflict { .. })
        ));

        // The concurrent write survived
        assert_eq!(fx.store.get("data").await.unwrap().payload, "v2");
    }

    /// Story: remote failures surface as events and a Synced=false
    /// condition; nothing is swallowed.
    #[tokio::test]
    async fn remote_failure_is_reported_and_propagated() {
        struct FailingCreate;

        #[async_trait]
        impl ExternalClient<Bucket> for FailingCreate {
            async fn describe(
                &self,
                _input: &DescribeBucketInput,
            ) -> Result<BucketState, ExternalError> {
                Err(ExternalError::NotFound)
            }
            async fn list(
                &self,
                _input: &DescribeBucketInput,
            ) -> Result<Vec<BucketState>, ExternalError> {
                Ok(Vec::new())
            }
            async fn create(
                &self,
                _input: &CreateBucketInput,
            ) -> Result<BucketState, ExternalError> {
                Err(ExternalError::remote("rate limited"))
            }
            async fn update(&self, _input: &UpdateBucketInput) -> Result<(), ExternalError> {
                Ok(())
            }
            async fn delete(&self, _input: &DeleteBucketInput) -> Result<(), ExternalError> {
                Ok(())
            }
        }

        let mut events = MockEventSink::new();
        events
            .expect_record()
            .withf(|resource, type_, reason, _message| {
                resource.name == "data"
                    && *type_ == EventType::Warning
                    && reason == reasons::CREATE_FAILED
            })
            .times(1)
            .returning(|_, _, _, _| ());

        let store = Arc::new(MemoryStore::new());
        let mut declared = Bucket::declared("data", "v1");
        declared.external_name = Some("ext-1".to_string());
        store.update(&declared).await.unwrap();
        // External name set but the object is gone remotely: create branch
        let reconciler = Reconciler::new(store.clone(), Arc::new(FailingCreate))
            .with_hooks(Arc::new(BucketHooks::default()))
            .with_events(Arc::new(events));

        let resource = store.get("data").await.unwrap();
        let err = reconciler
            .reconcile(resource, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::External(_)));
        assert!(!err.is_terminal());

        let stored = store.get("data").await.unwrap();
        let synced = stored.conditions().get(Condition::SYNCED).unwrap();
        assert_eq!(synced.reason, reasons::CREATE_FAILED);
        assert!(synced.message.contains("rate limited"));
    }
}
