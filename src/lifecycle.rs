//! Aggregate lifecycle: registration, hydration, command execution, and
//! snapshot maintenance.
//!
//! [`AggregateManager`] is the crate's front door. It is assembled once at
//! startup through [`AggregateManagerBuilder`], which freezes the event
//! type registry and the per-aggregate handler tables; after that every
//! operation only reads them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::aggregate::{Aggregate, Command, Event};
use crate::client::{
    AggregateSlice, EventRequest, EventStore, GrpcEventStore, RelationPage, RelationQuery,
    SnapshotRequest,
};
use crate::dispatch::{CommandKind, HandlerTable, handler_method_name};
use crate::error::{BoxError, DispatchError, Error, FieldErrors, RegistryError};
use crate::event::{EventDto, PendingEvent};
use crate::registry::{EventRegistration, EventTypeRegistry};
use crate::relation;
use crate::session::{CommitPolicy, Session, SessionManager};

/// Replayed-event count above which a load refreshes the snapshot before
/// returning.
pub const REPLAY_SNAPSHOT_THRESHOLD: usize = 20;

/// Applied-batch size above which a background snapshot refresh is
/// scheduled.
pub const BATCH_SNAPSHOT_THRESHOLD: usize = 100;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:7626";

/// Registration surface for one aggregate type, handed to the closure
/// given to [`AggregateManagerBuilder::aggregate`].
pub struct AggregateHandlers<A> {
    table: HandlerTable<A>,
}

impl<A> fmt::Debug for AggregateHandlers<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateHandlers")
            .field("table", &self.table)
            .finish()
    }
}

impl<A: Aggregate> AggregateHandlers<A> {
    fn new() -> Self {
        Self {
            table: HandlerTable::new(),
        }
    }

    /// Registers the apply handler for `E`, under the name derived from
    /// its type and version constants.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::HandlerAlreadyRegistered`] when another
    /// event registration already derived the same handler name.
    pub fn on_event<E, F>(&mut self, handler: F) -> Result<(), Error>
    where
        E: Event,
        F: Fn(&mut A, E) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.table.on_event::<E, _>(handler)?;
        Ok(())
    }

    /// Registers the handler for a creation command.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CommandAlreadyRegistered`] when the
    /// command type already has a handler.
    pub fn on_create_command<C, F>(&mut self, handler: F) -> Result<(), Error>
    where
        C: Command,
        F: Fn(&A, &C) -> Result<Vec<PendingEvent>, BoxError> + Send + Sync + 'static,
    {
        self.table.on_command::<C, _>(CommandKind::Create, handler)?;
        Ok(())
    }

    /// Registers the handler for a mutation command.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CommandAlreadyRegistered`] when the
    /// command type already has a handler.
    pub fn on_command<C, F>(&mut self, handler: F) -> Result<(), Error>
    where
        C: Command,
        F: Fn(&A, &C) -> Result<Vec<PendingEvent>, BoxError> + Send + Sync + 'static,
    {
        self.table.on_command::<C, _>(CommandKind::Mutate, handler)?;
        Ok(())
    }
}

/// Builder assembling an [`AggregateManager`].
///
/// Event types and aggregates are registered here and frozen at
/// [`build`](Self::build); registration conflicts surface immediately as
/// errors rather than at dispatch time.
///
/// # Examples
///
/// ```no_run
/// use verso_es::{AggregateManagerBuilder, EventRegistration};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Debug, Default, Clone, Serialize, Deserialize)]
/// # struct Account { owner: String }
/// # impl verso_es::Aggregate for Account { const AGGREGATE_TYPE: &'static str = "account"; }
/// # #[derive(Debug, Serialize, Deserialize)]
/// # struct Opened { owner: String }
/// # impl verso_es::Event for Opened {
/// #     const EVENT_TYPE: &'static str = "Opened";
/// #     const EVENT_VERSION: &'static str = "1";
/// # }
/// # fn main() -> Result<(), verso_es::Error> {
/// let manager = AggregateManagerBuilder::new()
///     .endpoint("http://127.0.0.1:7626")
///     .event::<Opened>(EventRegistration::new().relation("owner"))?
///     .aggregate::<Account, _>(|handlers| {
///         handlers.on_event::<Opened, _>(|account, event: Opened| {
///             account.owner = event.owner;
///             Ok(())
///         })
///     })?
///     .build()?;
/// # let _ = manager;
/// # Ok(())
/// # }
/// ```
pub struct AggregateManagerBuilder {
    endpoint: Option<String>,
    auth_token: Option<Arc<RwLock<String>>>,
    store: Option<Arc<dyn EventStore>>,
    commit_policy: CommitPolicy,
    registry: EventTypeRegistry,
    tables: HashMap<String, Box<dyn Any + Send + Sync>>,
}

// Manual `Debug` because the store and handler tables are type-erased.
impl fmt::Debug for AggregateManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateManagerBuilder")
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth_token.is_some())
            .field("commit_policy", &self.commit_policy)
            .field("event_types", &self.registry.len())
            .field("aggregates", &self.tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AggregateManagerBuilder {
    pub fn new() -> Self {
        Self {
            endpoint: None,
            auth_token: None,
            store: None,
            commit_policy: CommitPolicy::default(),
            registry: EventTypeRegistry::new(),
            tables: HashMap::new(),
        }
    }

    /// Sets the `verso-db` endpoint (e.g. `"http://127.0.0.1:7626"`).
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sends a Bearer token with every RPC, read from the shared lock so
    /// it can be refreshed at runtime.
    pub fn auth_token(mut self, token: Arc<RwLock<String>>) -> Self {
        self.auth_token = Some(token);
        self
    }

    /// Uses `store` instead of connecting to an endpoint. Tests use this
    /// to substitute in-memory stores.
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the commit policy sessions run under.
    pub fn commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    /// Registers the event type `E`.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] when the (type, version) pair is taken
    /// or the registration is malformed.
    pub fn event<E: Event>(mut self, registration: EventRegistration) -> Result<Self, Error> {
        self.registry.register::<E>(registration)?;
        Ok(self)
    }

    /// Registers the aggregate type `A` and its handlers.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AggregateAlreadyRegistered`] for a second
    /// registration of `A`, or whatever error `configure` reports.
    pub fn aggregate<A, F>(mut self, configure: F) -> Result<Self, Error>
    where
        A: Aggregate,
        F: FnOnce(&mut AggregateHandlers<A>) -> Result<(), Error>,
    {
        if self.tables.contains_key(A::AGGREGATE_TYPE) {
            return Err(Error::Registry(RegistryError::AggregateAlreadyRegistered {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            }));
        }
        let mut handlers = AggregateHandlers::new();
        configure(&mut handlers)?;
        self.tables
            .insert(A::AGGREGATE_TYPE.to_owned(), Box::new(handlers.table));
        Ok(self)
    }

    /// Freezes the registrations and builds the manager.
    ///
    /// Without an explicit store the manager connects lazily, so this
    /// never blocks on the network; a missing endpoint falls back to
    /// `http://127.0.0.1:7626`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Endpoint`] when the endpoint URI does not parse.
    pub fn build(self) -> Result<AggregateManager, Error> {
        let store = match self.store {
            Some(store) => store,
            None => {
                let endpoint = self
                    .endpoint
                    .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned());
                let client = match self.auth_token {
                    Some(token) => GrpcEventStore::connect_lazy_with_token(endpoint, token)?,
                    None => GrpcEventStore::connect_lazy(endpoint)?,
                };
                Arc::new(client) as Arc<dyn EventStore>
            }
        };

        debug!(
            aggregates = self.tables.len(),
            event_types = self.registry.len(),
            "aggregate manager ready"
        );
        Ok(AggregateManager {
            inner: Arc::new(ManagerInner {
                store,
                registry: self.registry,
                tables: self.tables,
                commit_policy: self.commit_policy,
            }),
        })
    }
}

impl Default for AggregateManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ManagerInner {
    store: Arc<dyn EventStore>,
    registry: EventTypeRegistry,
    tables: HashMap<String, Box<dyn Any + Send + Sync>>,
    commit_policy: CommitPolicy,
}

/// Hydration bookkeeping returned by a replay.
struct Replayed {
    count: usize,
    last_sequence: u64,
}

/// Front door of the runtime: loads aggregates, executes commands, and
/// keeps snapshots fresh.
///
/// Clone is cheap; all clones share the store connection, the registry,
/// and the handler tables.
#[derive(Clone)]
pub struct AggregateManager {
    inner: Arc<ManagerInner>,
}

// Manual `Debug` because handler tables are type-erased.
impl fmt::Debug for AggregateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateManager")
            .field("registry", &self.inner.registry)
            .field("aggregates", &self.inner.tables.keys().collect::<Vec<_>>())
            .field("commit_policy", &self.inner.commit_policy)
            .finish()
    }
}

impl AggregateManager {
    /// Starts an empty [`AggregateManagerBuilder`].
    pub fn builder() -> AggregateManagerBuilder {
        AggregateManagerBuilder::new()
    }

    /// The frozen event type registry.
    pub fn registry(&self) -> &EventTypeRegistry {
        &self.inner.registry
    }

    /// A session manager bound to this manager's store and commit policy.
    pub fn sessions(&self) -> SessionManager {
        SessionManager::new(Arc::clone(&self.inner.store), self.inner.commit_policy)
    }

    fn table<A: Aggregate>(&self) -> Result<&HandlerTable<A>, Error> {
        self.inner
            .tables
            .get(A::AGGREGATE_TYPE)
            .and_then(|any| any.downcast_ref::<HandlerTable<A>>())
            .ok_or_else(|| {
                Error::Registry(RegistryError::UnknownAggregateType {
                    aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                })
            })
    }

    fn verify_command<C: Command>(&self, command: &C) -> Result<(), Error> {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", command.tenant_id());
        errors.require("command_id", command.command_id());
        errors.require("aggregate_id", command.aggregate_id());
        errors.into_result()
    }

    /// Hydrates `aggregate` from its snapshot and event history.
    ///
    /// Returns `false` without touching `aggregate` when the store holds
    /// nothing for the id; absence is an answer, not an error. When the
    /// replay walks more than [`REPLAY_SNAPSHOT_THRESHOLD`] events, a
    /// fresh snapshot is saved before returning so the next load starts
    /// closer to the head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Verify`] for blank identifiers, registry and
    /// dispatch errors for events the process cannot replay, and
    /// [`Error::SnapshotSave`] when hydration succeeded but the snapshot
    /// write was refused. `aggregate` keeps its hydrated state in the
    /// snapshot-failure case.
    pub async fn load<A: Aggregate>(
        &self,
        tenant_id: &str,
        aggregate_id: &str,
        aggregate: &mut A,
    ) -> Result<bool, Error> {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", tenant_id);
        errors.require("aggregate_id", aggregate_id);
        errors.into_result()?;

        let slice = self
            .inner
            .store
            .load_events(tenant_id, aggregate_id)
            .await?;
        if slice.is_absent() {
            debug!(
                aggregate_type = A::AGGREGATE_TYPE,
                aggregate_id = %aggregate_id,
                "aggregate not found"
            );
            return Ok(false);
        }

        let replayed = self.hydrate(aggregate, &slice)?;
        debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %aggregate_id,
            replayed = replayed.count,
            sequence = replayed.last_sequence,
            "aggregate hydrated"
        );

        if replayed.count > REPLAY_SNAPSHOT_THRESHOLD {
            self.save_snapshot_of(tenant_id, aggregate_id, &*aggregate, replayed.last_sequence)
                .await?;
        }
        Ok(true)
    }

    /// Rebuilds state from a slice into a fresh default, assigning it to
    /// `aggregate` only when every event folds cleanly.
    fn hydrate<A: Aggregate>(
        &self,
        aggregate: &mut A,
        slice: &AggregateSlice,
    ) -> Result<Replayed, Error> {
        let table = self.table::<A>()?;
        let mut state = A::default();
        let mut last_sequence = 0;

        if let Some(snapshot) = &slice.snapshot {
            state = serde_json::from_value(snapshot.data.clone())?;
            last_sequence = snapshot.sequence_number;
        }

        for record in &slice.events {
            let payload = self.inner.registry.resolve(
                &record.event_type,
                &record.event_version,
                &record.data,
            )?;
            let method = handler_method_name(&record.event_type, &record.event_version);
            table.dispatch_apply(&mut state, &method, payload)?;
            last_sequence = record.sequence_number;
        }

        *aggregate = state;
        Ok(Replayed {
            count: slice.events.len(),
            last_sequence,
        })
    }

    async fn save_snapshot_of<A: Aggregate>(
        &self,
        tenant_id: &str,
        aggregate_id: &str,
        aggregate: &A,
        sequence_number: u64,
    ) -> Result<(), Error> {
        let request = SnapshotRequest {
            tenant_id: tenant_id.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            data: serde_json::to_value(aggregate)?,
            sequence_number,
        };
        self.inner
            .store
            .save_snapshot(request)
            .await
            .map_err(Error::SnapshotSave)?;
        debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            aggregate_id = %aggregate_id,
            sequence = sequence_number,
            "snapshot saved"
        );
        Ok(())
    }

    /// Runs a creation command and records the events it emits, either
    /// immediately or into `session` when one is given.
    ///
    /// The handler sees `aggregate` as passed in, which for a creation is
    /// normally the pre-creation default; no load is performed.
    pub async fn create<A, C>(
        &self,
        session: Option<&Session>,
        command: &C,
        aggregate: &mut A,
    ) -> Result<(), Error>
    where
        A: Aggregate,
        C: Command,
    {
        self.verify_command(command)?;
        let table = self.table::<A>()?;
        let pending = table.dispatch_command(&*aggregate, command, CommandKind::Create)?;
        self.apply_pending(session, aggregate, pending).await
    }

    /// Loads the aggregate, then runs a mutation command against the
    /// hydrated state and records the events it emits, either immediately
    /// or into `session` when one is given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AggregateNotFound`] when no stream exists for the
    /// command's aggregate id.
    pub async fn command<A, C>(
        &self,
        session: Option<&Session>,
        command: &C,
        aggregate: &mut A,
    ) -> Result<(), Error>
    where
        A: Aggregate,
        C: Command,
    {
        self.verify_command(command)?;
        let found = self
            .load(command.tenant_id(), command.aggregate_id(), aggregate)
            .await?;
        if !found {
            return Err(Error::AggregateNotFound {
                aggregate_id: command.aggregate_id().to_owned(),
            });
        }
        let table = self.table::<A>()?;
        let pending = table.dispatch_command(&*aggregate, command, CommandKind::Mutate)?;
        self.apply_pending(session, aggregate, pending).await
    }

    /// Routes a command to [`create`](Self::create) or
    /// [`command`](Self::command) according to how its type was
    /// registered.
    pub async fn execute<A, C>(
        &self,
        session: Option<&Session>,
        command: &C,
        aggregate: &mut A,
    ) -> Result<(), Error>
    where
        A: Aggregate,
        C: Command,
    {
        let table = self.table::<A>()?;
        match table.command_kind(C::COMMAND_TYPE) {
            Some(CommandKind::Create) => self.create(session, command, aggregate).await,
            Some(CommandKind::Mutate) => self.command(session, command, aggregate).await,
            None => Err(Error::Dispatch(DispatchError::CommandNotFound {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                command_type: C::COMMAND_TYPE.to_owned(),
            })),
        }
    }

    /// Records `pending` events and folds the sourcing ones into
    /// `aggregate`.
    ///
    /// Without a session each event goes to the store immediately, in
    /// order; an event the store flags as a duplicate is skipped in the
    /// fold, keeping state aligned with what was actually recorded. With
    /// a session the events are staged in the session's buffer instead
    /// and reach the store at commit.
    ///
    /// Direct batches larger than [`BATCH_SNAPSHOT_THRESHOLD`] schedule a
    /// background snapshot refresh; its outcome does not affect this
    /// call's result.
    pub async fn apply_pending<A: Aggregate>(
        &self,
        session: Option<&Session>,
        aggregate: &mut A,
        pending: Vec<PendingEvent>,
    ) -> Result<(), Error> {
        if pending.is_empty() {
            return Ok(());
        }

        let table = self.table::<A>()?;
        let batch = pending.len();
        // Identity of the batch, for the background refresh.
        let tenant_id = pending[0].event.tenant_id.clone();
        let aggregate_id = pending[0].event.aggregate_id.clone();

        for item in pending {
            let mut errors = FieldErrors::new();
            errors.require("tenant_id", &item.event.tenant_id);
            errors.require("aggregate_id", &item.event.aggregate_id);
            errors.require("command_id", &item.event.command_id);
            errors.into_result()?;

            let fields = self
                .inner
                .registry
                .relation_fields(&item.event.event_type, &item.event.event_version)?;
            let relations = relation::extract(fields, &item.event.data)?;
            let dto = EventDto::build(&item, relations);

            let mut skip_fold = false;
            match session {
                Some(session) => {
                    session
                        .buffer(A::AGGREGATE_TYPE, &item.event, item.kind, dto)
                        .await?;
                }
                None => {
                    let request = EventRequest {
                        tenant_id: item.event.tenant_id.clone(),
                        session_id: None,
                        aggregate_id: item.event.aggregate_id.clone(),
                        aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                        events: vec![dto],
                    };
                    let ack = self.inner.store.send_event(item.kind, request).await?;
                    if ack.is_duplicate {
                        warn!(
                            aggregate_type = A::AGGREGATE_TYPE,
                            aggregate_id = %item.event.aggregate_id,
                            event_id = %item.event.event_id,
                            "store flagged a duplicate event; not applied"
                        );
                        skip_fold = true;
                    }
                }
            }

            if !skip_fold && item.options.is_sourcing {
                let payload = self.inner.registry.resolve(
                    &item.event.event_type,
                    &item.event.event_version,
                    &item.event.data,
                )?;
                let method =
                    handler_method_name(&item.event.event_type, &item.event.event_version);
                table.dispatch_apply(aggregate, &method, payload)?;
            }
        }

        if session.is_none() && batch > BATCH_SNAPSHOT_THRESHOLD {
            self.spawn_snapshot_refresh::<A>(tenant_id, aggregate_id);
        }
        Ok(())
    }

    fn spawn_snapshot_refresh<A: Aggregate>(&self, tenant_id: String, aggregate_id: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(error) = manager
                .refresh_snapshot::<A>(&tenant_id, &aggregate_id)
                .await
            {
                warn!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    aggregate_id = %aggregate_id,
                    error = %error,
                    "background snapshot refresh failed"
                );
            }
        });
    }

    /// Rebuilds the aggregate from the store and saves a snapshot at its
    /// current head, regardless of how many events were replayed.
    ///
    /// Returns `false` when the store holds nothing for the id.
    pub async fn refresh_snapshot<A: Aggregate>(
        &self,
        tenant_id: &str,
        aggregate_id: &str,
    ) -> Result<bool, Error> {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", tenant_id);
        errors.require("aggregate_id", aggregate_id);
        errors.into_result()?;

        let slice = self
            .inner
            .store
            .load_events(tenant_id, aggregate_id)
            .await?;
        if slice.is_absent() {
            return Ok(false);
        }

        let mut aggregate = A::default();
        let replayed = self.hydrate(&mut aggregate, &slice)?;
        self.save_snapshot_of(tenant_id, aggregate_id, &aggregate, replayed.last_sequence)
            .await?;
        Ok(true)
    }

    /// Whether a stream exists for the aggregate id.
    pub async fn exist(&self, tenant_id: &str, aggregate_id: &str) -> Result<bool, Error> {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", tenant_id);
        errors.require("aggregate_id", aggregate_id);
        errors.into_result()?;
        Ok(self
            .inner
            .store
            .exist_aggregate(tenant_id, aggregate_id)
            .await?)
    }

    /// Pages through the relation index.
    pub async fn get_relations(&self, query: RelationQuery) -> Result<RelationPage, Error> {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", &query.tenant_id);
        errors.require("aggregate_type", &query.aggregate_type);
        if query.page_num == 0 {
            errors.push("page_num", "must be greater than zero");
        }
        if query.page_size == 0 {
            errors.push("page_size", "must be greater than zero");
        }
        errors.into_result()?;
        Ok(self.inner.store.get_relations(query).await?)
    }
}
