//! Typed boundary to the `verso-db` event store.
//!
//! [`EventStore`] is the trait the runtime talks to; every argument and
//! return value is a Rust-native type, so nothing outside this module
//! imports tonic internals. [`GrpcEventStore`] is the production
//! implementation over the tonic-generated client.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tonic::transport::Channel;

use crate::event::{ApplyKind, EventDto, EventRecord, SnapshotRecord};
use crate::proto;
use crate::proto::event_store_client::EventStoreClient;

/// gRPC interceptor that injects a Bearer token from a shared, refreshable
/// string.
///
/// The token is read from the [`RwLock`] on every intercepted request using
/// a synchronous `read()` lock because tonic interceptors are called
/// synchronously. An empty token string means "no auth": no `authorization`
/// header is added.
///
/// # Panics
///
/// Panics if the inner [`RwLock`] is poisoned (i.e. a writer panicked while
/// holding the write lock). This is treated as an invariant violation.
#[derive(Clone)]
pub(crate) struct BearerInterceptor {
    pub(crate) token: Arc<RwLock<String>>,
}

impl tonic::service::Interceptor for BearerInterceptor {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        let token = self.token.read().expect("token RwLock poisoned");
        if !token.is_empty() {
            let value = format!("Bearer {token}")
                .parse::<tonic::metadata::MetadataValue<_>>()
                .map_err(|_| tonic::Status::internal("invalid token characters"))?;
            req.metadata_mut().insert("authorization", value);
        }
        Ok(req)
    }
}

/// Plain (unauthenticated) gRPC client type alias.
type PlainClient = EventStoreClient<Channel>;

/// Authenticated gRPC client with Bearer token interceptor.
type AuthClient =
    EventStoreClient<tonic::service::interceptor::InterceptedService<Channel, BearerInterceptor>>;

/// Internal transport enum supporting both plain and authenticated channels.
enum StoreInner {
    Plain(PlainClient),
    Auth(AuthClient),
}

/// Everything a load returns for one aggregate: the latest snapshot, if
/// any, and the events recorded after it in sequence order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateSlice {
    pub snapshot: Option<SnapshotRecord>,
    pub events: Vec<EventRecord>,
}

impl AggregateSlice {
    /// `true` when the store holds nothing at all for the aggregate.
    pub fn is_absent(&self) -> bool {
        self.snapshot.is_none() && self.events.is_empty()
    }
}

/// One create/apply/delete submission.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRequest {
    pub tenant_id: String,
    /// Session the events are staged under; `None` applies immediately.
    pub session_id: Option<String>,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub events: Vec<EventDto>,
}

/// Store acknowledgement for one event submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyAck {
    /// `true` when the store had already recorded an event with this id.
    /// The submission was a no-op.
    pub is_duplicate: bool,
    /// Store-provided response headers.
    pub headers: HashMap<String, String>,
}

/// Snapshot write request.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRequest {
    pub tenant_id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    /// JSON serialization of the aggregate at `sequence_number`.
    pub data: Value,
    /// Stream position the snapshot covers, inclusive.
    pub sequence_number: u64,
}

/// Relation index query.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationQuery {
    pub tenant_id: String,
    pub aggregate_type: String,
    /// Store-side filter expression; empty selects everything.
    pub filter: String,
    /// Store-side sort expression; empty uses the store default.
    pub sort: String,
    /// 1-based page number.
    pub page_num: u32,
    pub page_size: u32,
}

/// One row of the relation index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationRow {
    pub relation_id: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    /// The indexed key/value pairs, as extracted when the event was
    /// recorded.
    pub items: HashMap<String, String>,
}

/// One page of relation rows plus paging totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationPage {
    pub relations: Vec<RelationRow>,
    pub total_rows: u64,
    pub total_pages: u64,
    pub page_num: u32,
    pub page_size: u32,
    pub is_found: bool,
}

/// Store-side operations the aggregate runtime depends on.
///
/// [`GrpcEventStore`] is the production implementation; tests substitute
/// in-memory doubles. Every method reports failures as the untouched
/// [`tonic::Status`] the store produced.
#[tonic::async_trait]
pub trait EventStore: Send + Sync {
    /// Loads the latest snapshot and the events recorded after it.
    ///
    /// An aggregate that was never created loads as an absent
    /// [`AggregateSlice`], not as an error.
    async fn load_events(
        &self,
        tenant_id: &str,
        aggregate_id: &str,
    ) -> Result<AggregateSlice, tonic::Status>;

    /// Records the first event of a brand-new stream.
    async fn create_event(&self, request: EventRequest) -> Result<ApplyAck, tonic::Status>;

    /// Appends to an existing stream.
    async fn apply_event(&self, request: EventRequest) -> Result<ApplyAck, tonic::Status>;

    /// Appends a tombstone that retires the stream.
    async fn delete_event(&self, request: EventRequest) -> Result<ApplyAck, tonic::Status>;

    /// Routes `request` to create, apply, or delete according to `kind`.
    async fn send_event(
        &self,
        kind: ApplyKind,
        request: EventRequest,
    ) -> Result<ApplyAck, tonic::Status> {
        match kind {
            ApplyKind::Create => self.create_event(request).await,
            ApplyKind::Apply => self.apply_event(request).await,
            ApplyKind::Delete => self.delete_event(request).await,
        }
    }

    /// Stores a point-in-time aggregate serialization.
    async fn save_snapshot(&self, request: SnapshotRequest) -> Result<(), tonic::Status>;

    /// Atomically applies every event staged under the session.
    async fn commit(&self, tenant_id: &str, session_id: &str) -> Result<(), tonic::Status>;

    /// Discards every event staged under the session.
    async fn rollback(&self, tenant_id: &str, session_id: &str) -> Result<(), tonic::Status>;

    /// Pages through the relation index.
    async fn get_relations(&self, query: RelationQuery) -> Result<RelationPage, tonic::Status>;

    /// Whether a stream exists for the aggregate id.
    async fn exist_aggregate(
        &self,
        tenant_id: &str,
        aggregate_id: &str,
    ) -> Result<bool, tonic::Status>;
}

/// Converts a native [`EventDto`] into its proto message.
///
/// Extracted from the RPC methods so the conversion can be unit-tested
/// without a live gRPC connection.
pub(crate) fn event_dto_to_proto(dto: &EventDto) -> proto::EventDto {
    // `Value` serialization cannot fail: JSON map keys are always strings.
    let event_data = serde_json::to_vec(&dto.event_data).unwrap_or_default();
    proto::EventDto {
        apply_type: dto.apply_type.clone(),
        command_id: dto.command_id.clone(),
        event_id: dto.event_id.clone(),
        event_data,
        event_type: dto.event_type.clone(),
        event_version: dto.event_version.clone(),
        metadata: dto.metadata.clone(),
        pubsub_name: dto.pubsub_name.clone(),
        topic: dto.topic.clone(),
        relations: dto.relations.clone().unwrap_or_default(),
        is_sourcing: dto.is_sourcing,
    }
}

pub(crate) fn event_request_to_proto(request: &EventRequest) -> proto::EventRequest {
    proto::EventRequest {
        tenant_id: request.tenant_id.clone(),
        session_id: request.session_id.clone().unwrap_or_default(),
        aggregate_id: request.aggregate_id.clone(),
        aggregate_type: request.aggregate_type.clone(),
        events: request.events.iter().map(event_dto_to_proto).collect(),
    }
}

fn decode_json(bytes: &[u8]) -> Result<Value, serde_json::Error> {
    if bytes.is_empty() {
        Ok(Value::Null)
    } else {
        serde_json::from_slice(bytes)
    }
}

/// Converts a stored event record from its proto message.
///
/// A payload that does not parse as JSON is store corruption, reported as
/// `DATA_LOSS` naming the event id.
pub(crate) fn record_from_proto(
    record: proto::EventRecordDto,
) -> Result<EventRecord, tonic::Status> {
    let data = decode_json(&record.event_data).map_err(|e| {
        tonic::Status::data_loss(format!("event {}: malformed payload: {e}", record.event_id))
    })?;
    Ok(EventRecord {
        event_id: record.event_id,
        event_type: record.event_type,
        event_version: record.event_version,
        sequence_number: record.sequence_number,
        data,
    })
}

fn slice_from_proto(reply: proto::LoadEventsResponse) -> Result<AggregateSlice, tonic::Status> {
    let snapshot = match reply.snapshot {
        Some(snapshot) => Some(SnapshotRecord {
            data: decode_json(&snapshot.aggregate_data).map_err(|e| {
                tonic::Status::data_loss(format!("snapshot: malformed payload: {e}"))
            })?,
            sequence_number: snapshot.sequence_number,
        }),
        None => None,
    };
    let events = reply
        .events
        .into_iter()
        .map(record_from_proto)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AggregateSlice { snapshot, events })
}

fn ack_from_proto(reply: proto::EventResponse) -> ApplyAck {
    ApplyAck {
        is_duplicate: reply.is_duplicate_event,
        headers: reply.headers,
    }
}

fn snapshot_request_to_proto(request: &SnapshotRequest) -> proto::SaveSnapshotRequest {
    proto::SaveSnapshotRequest {
        tenant_id: request.tenant_id.clone(),
        aggregate_id: request.aggregate_id.clone(),
        aggregate_type: request.aggregate_type.clone(),
        aggregate_data: serde_json::to_vec(&request.data).unwrap_or_default(),
        sequence_number: request.sequence_number,
        // Aggregate revision equals the event sequence watermark here.
        aggregate_version: request.sequence_number,
    }
}

fn query_to_proto(query: &RelationQuery) -> proto::GetRelationsRequest {
    proto::GetRelationsRequest {
        tenant_id: query.tenant_id.clone(),
        aggregate_type: query.aggregate_type.clone(),
        filter: query.filter.clone(),
        sort: query.sort.clone(),
        page_num: query.page_num,
        page_size: query.page_size,
    }
}

fn page_from_proto(reply: proto::GetRelationsResponse) -> RelationPage {
    RelationPage {
        relations: reply
            .relations
            .into_iter()
            .map(|row| RelationRow {
                relation_id: row.relation_id,
                aggregate_id: row.aggregate_id,
                aggregate_type: row.aggregate_type,
                items: row.items,
            })
            .collect(),
        total_rows: reply.total_rows,
        total_pages: reply.total_pages,
        page_num: reply.page_num,
        page_size: reply.page_size,
        is_found: reply.is_found,
    }
}

/// gRPC implementation of [`EventStore`] over a `verso-db` server.
///
/// Supports both plain and authenticated (Bearer token) transports via an
/// internal enum. Clone is cheap because the inner transport is wrapped in
/// an [`Arc`].
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use verso_es::GrpcEventStore;
///
/// let store = GrpcEventStore::connect("http://127.0.0.1:7626").await?;
/// # let _ = store;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct GrpcEventStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for GrpcEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match *self.inner {
            StoreInner::Plain(_) => "Plain",
            StoreInner::Auth(_) => "Auth",
        };
        f.debug_struct("GrpcEventStore")
            .field("transport", &variant)
            .finish()
    }
}

impl GrpcEventStore {
    /// Connects to a `verso-db` gRPC server, unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::transport::Error`] if the channel cannot be
    /// established.
    pub async fn connect(endpoint: &str) -> Result<Self, tonic::transport::Error> {
        let client = EventStoreClient::connect(endpoint.to_string()).await?;
        Ok(Self {
            inner: Arc::new(StoreInner::Plain(client)),
        })
    }

    /// Builds an unauthenticated client without connecting; the channel is
    /// established on first use.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::transport::Error`] if the endpoint URI is invalid.
    pub fn connect_lazy(endpoint: impl Into<String>) -> Result<Self, tonic::transport::Error> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.into())?.connect_lazy();
        Ok(Self {
            inner: Arc::new(StoreInner::Plain(EventStoreClient::new(channel))),
        })
    }

    /// Connects with Bearer token authentication.
    ///
    /// The token is read from the shared [`RwLock`] on every outgoing RPC.
    /// To refresh the token at runtime, write a new value into the lock;
    /// the next RPC picks it up. An empty token sends no `authorization`
    /// header.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::transport::Error`] if the channel cannot be
    /// established.
    pub async fn connect_with_token(
        endpoint: &str,
        token: Arc<RwLock<String>>,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.to_string())?
            .connect()
            .await?;
        let client = EventStoreClient::with_interceptor(channel, BearerInterceptor { token });
        Ok(Self {
            inner: Arc::new(StoreInner::Auth(client)),
        })
    }

    /// Bearer-token variant of [`connect_lazy`](Self::connect_lazy).
    ///
    /// # Errors
    ///
    /// Returns [`tonic::transport::Error`] if the endpoint URI is invalid.
    pub fn connect_lazy_with_token(
        endpoint: impl Into<String>,
        token: Arc<RwLock<String>>,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.into())?.connect_lazy();
        let client = EventStoreClient::with_interceptor(channel, BearerInterceptor { token });
        Ok(Self {
            inner: Arc::new(StoreInner::Auth(client)),
        })
    }

    /// Check whether this client uses an authenticated transport.
    #[cfg(test)]
    pub(crate) fn is_auth(&self) -> bool {
        matches!(*self.inner, StoreInner::Auth(_))
    }
}

#[tonic::async_trait]
impl EventStore for GrpcEventStore {
    async fn load_events(
        &self,
        tenant_id: &str,
        aggregate_id: &str,
    ) -> Result<AggregateSlice, tonic::Status> {
        let request = proto::LoadEventsRequest {
            tenant_id: tenant_id.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
        };

        // Generated methods take `&mut self`, so every RPC works on a
        // clone of the client; the clone is a thin handle over the shared
        // channel.
        let result = match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().load_events(request).await,
            StoreInner::Auth(c) => c.clone().load_events(request).await,
        };

        match result {
            Ok(reply) => slice_from_proto(reply.into_inner()),
            // An aggregate that was never created returns NotFound. Absence
            // is an answer, not an error; callers branch on is_absent().
            Err(status) if status.code() == tonic::Code::NotFound => {
                Ok(AggregateSlice::default())
            }
            Err(status) => Err(status),
        }
    }

    async fn create_event(&self, request: EventRequest) -> Result<ApplyAck, tonic::Status> {
        let request = event_request_to_proto(&request);
        let reply = match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().create_event(request).await?,
            StoreInner::Auth(c) => c.clone().create_event(request).await?,
        };
        Ok(ack_from_proto(reply.into_inner()))
    }

    async fn apply_event(&self, request: EventRequest) -> Result<ApplyAck, tonic::Status> {
        let request = event_request_to_proto(&request);
        let reply = match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().apply_event(request).await?,
            StoreInner::Auth(c) => c.clone().apply_event(request).await?,
        };
        Ok(ack_from_proto(reply.into_inner()))
    }

    async fn delete_event(&self, request: EventRequest) -> Result<ApplyAck, tonic::Status> {
        let request = event_request_to_proto(&request);
        let reply = match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().delete_event(request).await?,
            StoreInner::Auth(c) => c.clone().delete_event(request).await?,
        };
        Ok(ack_from_proto(reply.into_inner()))
    }

    async fn save_snapshot(&self, request: SnapshotRequest) -> Result<(), tonic::Status> {
        let request = snapshot_request_to_proto(&request);
        match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().save_snapshot(request).await?,
            StoreInner::Auth(c) => c.clone().save_snapshot(request).await?,
        };
        Ok(())
    }

    async fn commit(&self, tenant_id: &str, session_id: &str) -> Result<(), tonic::Status> {
        let request = proto::CommitRequest {
            tenant_id: tenant_id.to_owned(),
            session_id: session_id.to_owned(),
        };
        match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().commit(request).await?,
            StoreInner::Auth(c) => c.clone().commit(request).await?,
        };
        Ok(())
    }

    async fn rollback(&self, tenant_id: &str, session_id: &str) -> Result<(), tonic::Status> {
        let request = proto::RollbackRequest {
            tenant_id: tenant_id.to_owned(),
            session_id: session_id.to_owned(),
        };
        match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().rollback(request).await?,
            StoreInner::Auth(c) => c.clone().rollback(request).await?,
        };
        Ok(())
    }

    async fn get_relations(&self, query: RelationQuery) -> Result<RelationPage, tonic::Status> {
        let request = query_to_proto(&query);
        let reply = match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().get_relations(request).await?,
            StoreInner::Auth(c) => c.clone().get_relations(request).await?,
        };
        Ok(page_from_proto(reply.into_inner()))
    }

    async fn exist_aggregate(
        &self,
        tenant_id: &str,
        aggregate_id: &str,
    ) -> Result<bool, tonic::Status> {
        let request = proto::ExistAggregateRequest {
            tenant_id: tenant_id.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
        };
        let reply = match self.inner.as_ref() {
            StoreInner::Plain(c) => c.clone().exist_aggregate(request).await?,
            StoreInner::Auth(c) => c.clone().exist_aggregate(request).await?,
        };
        Ok(reply.into_inner().is_exist)
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_dto() -> EventDto {
        EventDto {
            apply_type: "apply".to_owned(),
            command_id: "cmd-1".to_owned(),
            event_id: "ev-1".to_owned(),
            event_data: json!({ "sku": "sku-9" }),
            event_type: "ItemAdded".to_owned(),
            event_version: "1".to_owned(),
            metadata: HashMap::from([("trace".to_owned(), "abc".to_owned())]),
            pubsub_name: String::new(),
            topic: String::new(),
            relations: None,
            is_sourcing: true,
        }
    }

    // --- conversion tests ---

    #[test]
    fn event_dto_to_proto_encodes_payload_as_json_bytes() {
        let dto = sample_dto();
        let proto_dto = event_dto_to_proto(&dto);

        assert_eq!(proto_dto.apply_type, "apply");
        assert_eq!(proto_dto.event_id, "ev-1");
        assert_eq!(proto_dto.event_type, "ItemAdded");
        assert_eq!(proto_dto.event_version, "1");
        assert_eq!(proto_dto.metadata["trace"], "abc");
        assert!(proto_dto.is_sourcing);

        let decoded: Value =
            serde_json::from_slice(&proto_dto.event_data).expect("payload bytes are JSON");
        assert_eq!(decoded, json!({ "sku": "sku-9" }));
    }

    #[test]
    fn event_dto_to_proto_flattens_absent_relations_to_an_empty_map() {
        let proto_dto = event_dto_to_proto(&sample_dto());
        assert!(proto_dto.relations.is_empty());

        let mut dto = sample_dto();
        dto.relations = Some(HashMap::from([("orderId".to_owned(), "o1".to_owned())]));
        let proto_dto = event_dto_to_proto(&dto);
        assert_eq!(proto_dto.relations["orderId"], "o1");
    }

    #[test]
    fn event_request_to_proto_spells_no_session_as_empty() {
        let request = EventRequest {
            tenant_id: "t1".to_owned(),
            session_id: None,
            aggregate_id: "o1".to_owned(),
            aggregate_type: "order".to_owned(),
            events: vec![sample_dto()],
        };
        let proto_request = event_request_to_proto(&request);
        assert_eq!(proto_request.session_id, "");
        assert_eq!(proto_request.events.len(), 1);

        let request = EventRequest {
            session_id: Some("s-1".to_owned()),
            ..request
        };
        assert_eq!(event_request_to_proto(&request).session_id, "s-1");
    }

    #[test]
    fn record_from_proto_decodes_payload_bytes() {
        let record = record_from_proto(proto::EventRecordDto {
            event_id: "ev-1".to_owned(),
            event_data: br#"{"sku":"sku-9"}"#.to_vec(),
            event_type: "ItemAdded".to_owned(),
            event_version: "1".to_owned(),
            sequence_number: 7,
        })
        .expect("valid JSON payload");

        assert_eq!(record.event_id, "ev-1");
        assert_eq!(record.sequence_number, 7);
        assert_eq!(record.data, json!({ "sku": "sku-9" }));
    }

    #[test]
    fn record_from_proto_treats_empty_payload_as_null() {
        let record = record_from_proto(proto::EventRecordDto {
            event_id: "ev-1".to_owned(),
            event_data: Vec::new(),
            event_type: "Pinged".to_owned(),
            event_version: "1".to_owned(),
            sequence_number: 1,
        })
        .expect("empty payload decodes");
        assert!(record.data.is_null());
    }

    #[test]
    fn record_from_proto_reports_corrupt_payloads_as_data_loss() {
        let err = record_from_proto(proto::EventRecordDto {
            event_id: "ev-9".to_owned(),
            event_data: vec![0xFF, 0xFE],
            event_type: "ItemAdded".to_owned(),
            event_version: "1".to_owned(),
            sequence_number: 1,
        })
        .unwrap_err();

        assert_eq!(err.code(), tonic::Code::DataLoss);
        assert!(err.message().contains("ev-9"));
    }

    #[test]
    fn slice_from_proto_carries_snapshot_and_ordered_events() {
        let reply = proto::LoadEventsResponse {
            tenant_id: "t1".to_owned(),
            aggregate_id: "o1".to_owned(),
            snapshot: Some(proto::SnapshotDto {
                aggregate_data: br#"{"lines":["a"]}"#.to_vec(),
                sequence_number: 3,
            }),
            events: vec![
                proto::EventRecordDto {
                    event_id: "ev-4".to_owned(),
                    event_data: b"{}".to_vec(),
                    event_type: "ItemAdded".to_owned(),
                    event_version: "1".to_owned(),
                    sequence_number: 4,
                },
                proto::EventRecordDto {
                    event_id: "ev-5".to_owned(),
                    event_data: b"{}".to_vec(),
                    event_type: "ItemAdded".to_owned(),
                    event_version: "1".to_owned(),
                    sequence_number: 5,
                },
            ],
        };

        let slice = slice_from_proto(reply).expect("well-formed reply");
        let snapshot = slice.snapshot.as_ref().expect("snapshot is present");
        assert_eq!(snapshot.sequence_number, 3);
        assert_eq!(snapshot.data["lines"][0], "a");
        assert_eq!(slice.events.len(), 2);
        assert_eq!(slice.events[0].sequence_number, 4);
        assert_eq!(slice.events[1].sequence_number, 5);
        assert!(!slice.is_absent());
    }

    #[test]
    fn default_slice_is_absent() {
        assert!(AggregateSlice::default().is_absent());
    }

    #[test]
    fn snapshot_request_to_proto_encodes_state_bytes() {
        let request = SnapshotRequest {
            tenant_id: "t1".to_owned(),
            aggregate_id: "o1".to_owned(),
            aggregate_type: "order".to_owned(),
            data: json!({ "lines": [] }),
            sequence_number: 21,
        };
        let proto_request = snapshot_request_to_proto(&request);
        assert_eq!(proto_request.sequence_number, 21);
        assert_eq!(proto_request.aggregate_version, 21);
        let decoded: Value =
            serde_json::from_slice(&proto_request.aggregate_data).expect("state bytes are JSON");
        assert_eq!(decoded, json!({ "lines": [] }));
    }

    #[test]
    fn page_from_proto_maps_rows_and_totals() {
        let reply = proto::GetRelationsResponse {
            relations: vec![proto::RelationDto {
                relation_id: "r1".to_owned(),
                aggregate_id: "o1".to_owned(),
                aggregate_type: "order".to_owned(),
                items: HashMap::from([("customerId".to_owned(), "cust-7".to_owned())]),
            }],
            total_rows: 41,
            total_pages: 5,
            page_num: 2,
            page_size: 10,
            is_found: true,
        };

        let page = page_from_proto(reply);
        assert_eq!(page.relations.len(), 1);
        assert_eq!(page.relations[0].items["customerId"], "cust-7");
        assert_eq!(page.total_rows, 41);
        assert_eq!(page.total_pages, 5);
        assert!(page.is_found);
    }

    // --- interceptor tests ---

    #[test]
    fn non_empty_token_inserts_bearer_header() {
        use tonic::service::Interceptor;

        let mut interceptor = BearerInterceptor {
            token: Arc::new(RwLock::new("abc".to_owned())),
        };
        let result = interceptor
            .call(tonic::Request::new(()))
            .expect("call should succeed");
        let value = result
            .metadata()
            .get("authorization")
            .expect("authorization header should be present");
        assert_eq!(value, "Bearer abc");
    }

    #[test]
    fn empty_token_omits_authorization_header() {
        use tonic::service::Interceptor;

        let mut interceptor = BearerInterceptor {
            token: Arc::new(RwLock::new(String::new())),
        };
        let result = interceptor
            .call(tonic::Request::new(()))
            .expect("call should succeed");
        assert!(result.metadata().get("authorization").is_none());
    }

    #[test]
    fn token_refresh_is_visible_on_the_next_call() {
        use tonic::service::Interceptor;

        let mut interceptor = BearerInterceptor {
            token: Arc::new(RwLock::new("abc".to_owned())),
        };
        interceptor
            .call(tonic::Request::new(()))
            .expect("call should succeed");

        *interceptor.token.write().unwrap() = "xyz".to_owned();

        let result = interceptor
            .call(tonic::Request::new(()))
            .expect("call should succeed");
        let value = result
            .metadata()
            .get("authorization")
            .expect("authorization header should be present");
        assert_eq!(value, "Bearer xyz");
    }

    // --- transport variant tests ---

    #[tokio::test]
    async fn connect_lazy_builds_a_plain_transport() {
        let store = GrpcEventStore::connect_lazy("http://[::1]:1").expect("valid endpoint");
        assert!(!store.is_auth());
    }

    #[tokio::test]
    async fn connect_lazy_with_token_builds_an_auth_transport() {
        let token = Arc::new(RwLock::new("tok".to_owned()));
        let store = GrpcEventStore::connect_lazy_with_token("http://[::1]:1", token)
            .expect("valid endpoint");
        assert!(store.is_auth());
    }

    #[test]
    fn connect_lazy_rejects_malformed_endpoints() {
        assert!(GrpcEventStore::connect_lazy("not a uri").is_err());
    }

    #[tokio::test]
    async fn debug_shows_the_transport_variant() {
        let store = GrpcEventStore::connect_lazy("http://[::1]:1").expect("valid endpoint");
        assert!(format!("{store:?}").contains("Plain"));

        let token = Arc::new(RwLock::new(String::new()));
        let store = GrpcEventStore::connect_lazy_with_token("http://[::1]:1", token)
            .expect("valid endpoint");
        assert!(format!("{store:?}").contains("Auth"));
    }

    #[tokio::test]
    async fn clone_shares_the_transport() {
        let store = GrpcEventStore::connect_lazy("http://[::1]:1").expect("valid endpoint");
        let cloned = store.clone();
        assert!(Arc::ptr_eq(&store.inner, &cloned.inner));
    }
}
