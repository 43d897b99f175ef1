//! Aggregate runtime and typed client for the `verso-db` event store.
//!
//! Aggregates are plain serde types that fold registered events into
//! state. This crate hydrates them from snapshots plus ordered replay,
//! runs command handlers that emit new events, forwards those events to
//! the store over gRPC, and keeps snapshots fresh as streams grow. See
//! [`AggregateManagerBuilder`] for the wiring and [`AggregateManager`]
//! for the operations.

mod proto {
    tonic::include_proto!("verso");
}

pub mod aggregate;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod registry;
pub mod relation;
pub mod session;

pub use aggregate::{Aggregate, Command, Event};
pub use client::{
    AggregateSlice, ApplyAck, EventRequest, EventStore, GrpcEventStore, RelationPage,
    RelationQuery, RelationRow, SnapshotRequest,
};
pub use dispatch::{CommandKind, handler_method_name};
pub use error::{
    BoxError, DispatchError, Error, FieldError, FieldErrors, RegistryError, RelationError,
    SessionError,
};
pub use event::{
    ApplyKind, ApplyOptions, DomainEvent, EventDto, EventRecord, PendingEvent, SnapshotRecord,
};
pub use lifecycle::{
    AggregateHandlers, AggregateManager, AggregateManagerBuilder, BATCH_SNAPSHOT_THRESHOLD,
    REPLAY_SNAPSHOT_THRESHOLD,
};
pub use registry::{EventRegistration, EventTypeRegistry};
pub use relation::RelationField;
pub use session::{CommitPolicy, Session, SessionManager, SessionState};
