//! Event envelopes, apply options, and the wire-shaped event DTO.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Event;
use crate::error::Error;

/// Milliseconds since the Unix epoch, used for event timestamps.
fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A domain event wrapped with the identity fields the store needs.
///
/// Envelopes are produced by command handlers via [`DomainEvent::from_event`]
/// and consumed by the runtime, which turns them into wire DTOs and folds
/// them into aggregate state.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    /// Tenant the event belongs to.
    pub tenant_id: String,
    /// Id of the command that produced this event.
    pub command_id: String,
    /// Unique id of this event, generated at construction.
    pub event_id: String,
    /// Stable event type identifier, from [`Event::EVENT_TYPE`].
    pub event_type: String,
    /// Payload schema version, from [`Event::EVENT_VERSION`].
    pub event_version: String,
    /// Id of the aggregate the event belongs to.
    pub aggregate_id: String,
    /// Milliseconds since the Unix epoch at construction time.
    pub created_at: u64,
    /// JSON serialization of the typed payload.
    pub data: Value,
}

impl DomainEvent {
    /// Wraps a typed event payload in a store-ready envelope.
    ///
    /// A fresh event id is generated per call, so a handler invoked twice
    /// produces distinct events while keeping the same command id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when the payload cannot be serialized to
    /// JSON.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde::{Deserialize, Serialize};
    /// use verso_es::{DomainEvent, Event};
    ///
    /// #[derive(Serialize, Deserialize)]
    /// struct Opened {
    ///     owner: String,
    /// }
    ///
    /// impl Event for Opened {
    ///     const EVENT_TYPE: &'static str = "Opened";
    ///     const EVENT_VERSION: &'static str = "1";
    /// }
    ///
    /// # fn main() -> Result<(), verso_es::Error> {
    /// let payload = Opened { owner: "ada".into() };
    /// let event = DomainEvent::from_event("t1", "cmd-1", "acct-1", &payload)?;
    /// assert_eq!(event.event_type, "Opened");
    /// assert_eq!(event.data["owner"], "ada");
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_event<E: Event>(
        tenant_id: &str,
        command_id: &str,
        aggregate_id: &str,
        event: &E,
    ) -> Result<Self, Error> {
        Ok(Self {
            tenant_id: tenant_id.to_owned(),
            command_id: command_id.to_owned(),
            event_id: Uuid::new_v4().to_string(),
            event_type: E::EVENT_TYPE.to_owned(),
            event_version: E::EVENT_VERSION.to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            created_at: epoch_millis(),
            data: serde_json::to_value(event)?,
        })
    }
}

/// How the store records an event: as a stream opener, an append, or a
/// stream tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyKind {
    /// First event of a brand-new aggregate stream.
    Create,
    /// Append to an existing stream.
    Apply,
    /// Tombstone that retires the stream.
    Delete,
}

impl ApplyKind {
    /// Wire spelling of the kind, carried in `EventDto.apply_type`.
    pub fn as_str(self) -> &'static str {
        match self {
            ApplyKind::Create => "create",
            ApplyKind::Apply => "apply",
            ApplyKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ApplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-event delivery options.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOptions {
    /// Free-form string pairs stored alongside the event.
    pub metadata: HashMap<String, String>,
    /// Pub/sub component the store publishes the event through after
    /// recording it. Empty disables publication.
    pub pubsub_name: String,
    /// Topic for pub/sub publication.
    pub topic: String,
    /// Whether the event participates in state hydration. Notification-only
    /// events set this to `false`: they are recorded and published but
    /// never folded into aggregate state.
    pub is_sourcing: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            metadata: HashMap::new(),
            pubsub_name: String::new(),
            topic: String::new(),
            is_sourcing: true,
        }
    }
}

impl ApplyOptions {
    /// Creates the default options: sourcing on, no metadata, no pub/sub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one metadata pair.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Routes the event to a pub/sub topic after it is recorded.
    pub fn with_pubsub(mut self, pubsub_name: impl Into<String>, topic: impl Into<String>) -> Self {
        self.pubsub_name = pubsub_name.into();
        self.topic = topic.into();
        self
    }

    /// Marks the event notification-only, excluding it from hydration.
    pub fn without_sourcing(mut self) -> Self {
        self.is_sourcing = false;
        self
    }
}

/// An event a command handler wants recorded, not yet sent to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    /// The enveloped payload.
    pub event: DomainEvent,
    /// How the store should record it.
    pub kind: ApplyKind,
    /// Delivery options.
    pub options: ApplyOptions,
}

impl PendingEvent {
    /// Pends `event` as the first event of a new stream.
    pub fn create(event: DomainEvent) -> Self {
        Self {
            event,
            kind: ApplyKind::Create,
            options: ApplyOptions::default(),
        }
    }

    /// Pends `event` as an append to an existing stream.
    pub fn apply(event: DomainEvent) -> Self {
        Self {
            event,
            kind: ApplyKind::Apply,
            options: ApplyOptions::default(),
        }
    }

    /// Pends `event` as the stream's tombstone.
    pub fn delete(event: DomainEvent) -> Self {
        Self {
            event,
            kind: ApplyKind::Delete,
            options: ApplyOptions::default(),
        }
    }

    /// Replaces the delivery options.
    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }
}

/// One recorded event as the store returns it from a load.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub event_version: String,
    /// Position in the aggregate's stream, starting at 1.
    pub sequence_number: u64,
    /// JSON payload as recorded.
    pub data: Value,
}

/// A stored point-in-time serialization of aggregate state.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    /// JSON serialization of the aggregate at `sequence_number`.
    pub data: Value,
    /// Stream position the snapshot covers, inclusive.
    pub sequence_number: u64,
}

/// Wire-shaped event, one per event inside an
/// [`EventRequest`](crate::client::EventRequest).
#[derive(Debug, Clone, PartialEq)]
pub struct EventDto {
    /// Wire spelling of [`ApplyKind`].
    pub apply_type: String,
    pub command_id: String,
    pub event_id: String,
    pub event_data: Value,
    pub event_type: String,
    pub event_version: String,
    pub metadata: HashMap<String, String>,
    pub pubsub_name: String,
    pub topic: String,
    /// Indexable pairs extracted from the payload. `None` when the event
    /// type declares no relation fields or none matched.
    pub relations: Option<HashMap<String, String>>,
    pub is_sourcing: bool,
}

impl EventDto {
    /// Flattens a pending event and its extracted relations into the wire
    /// shape.
    pub(crate) fn build(
        pending: &PendingEvent,
        relations: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            apply_type: pending.kind.as_str().to_owned(),
            command_id: pending.event.command_id.clone(),
            event_id: pending.event.event_id.clone(),
            event_data: pending.event.data.clone(),
            event_type: pending.event.event_type.clone(),
            event_version: pending.event.event_version.clone(),
            metadata: pending.options.metadata.clone(),
            pubsub_name: pending.options.pubsub_name.clone(),
            topic: pending.options.topic.clone(),
            relations,
            is_sourcing: pending.options.is_sourcing,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::aggregate::test_fixtures::ItemAdded;

    fn pending_item() -> PendingEvent {
        let envelope = DomainEvent::from_event(
            "t1",
            "cmd-1",
            "order-1",
            &ItemAdded { sku: "sku-1".into() },
        )
        .expect("fixture payload serializes");
        PendingEvent::apply(envelope)
    }

    #[test]
    fn from_event_stamps_identity_fields() {
        let pending = pending_item();
        let event = &pending.event;
        assert_eq!(event.tenant_id, "t1");
        assert_eq!(event.command_id, "cmd-1");
        assert_eq!(event.aggregate_id, "order-1");
        assert_eq!(event.event_type, "ItemAdded");
        assert_eq!(event.event_version, "1");
        assert!(!event.event_id.is_empty());
        assert!(event.created_at > 0);
        assert_eq!(event.data, json!({ "sku": "sku-1" }));
    }

    #[test]
    fn from_event_generates_a_fresh_id_per_call() {
        let a = pending_item();
        let b = pending_item();
        assert_ne!(a.event.event_id, b.event.event_id);
    }

    #[test]
    fn apply_kind_wire_spelling() {
        assert_eq!(ApplyKind::Create.as_str(), "create");
        assert_eq!(ApplyKind::Apply.as_str(), "apply");
        assert_eq!(ApplyKind::Delete.as_str(), "delete");
        assert_eq!(ApplyKind::Delete.to_string(), "delete");
    }

    #[test]
    fn options_default_to_sourcing_with_no_pubsub() {
        let options = ApplyOptions::default();
        assert!(options.is_sourcing);
        assert!(options.metadata.is_empty());
        assert!(options.pubsub_name.is_empty());
        assert!(options.topic.is_empty());
    }

    #[test]
    fn options_builders_compose() {
        let options = ApplyOptions::new()
            .with_metadata("trace", "abc")
            .with_pubsub("bus", "orders")
            .without_sourcing();
        assert_eq!(options.metadata["trace"], "abc");
        assert_eq!(options.pubsub_name, "bus");
        assert_eq!(options.topic, "orders");
        assert!(!options.is_sourcing);
    }

    #[test]
    fn pending_constructors_set_the_kind() {
        let envelope = pending_item().event;
        assert_eq!(
            PendingEvent::create(envelope.clone()).kind,
            ApplyKind::Create
        );
        assert_eq!(
            PendingEvent::apply(envelope.clone()).kind,
            ApplyKind::Apply
        );
        assert_eq!(PendingEvent::delete(envelope).kind, ApplyKind::Delete);
    }

    #[test]
    fn dto_build_flattens_envelope_options_and_relations() {
        let pending = pending_item().with_options(
            ApplyOptions::new()
                .with_metadata("trace", "abc")
                .with_pubsub("bus", "orders"),
        );
        let relations = Some(HashMap::from([(
            "orderId".to_owned(),
            "order-1".to_owned(),
        )]));
        let dto = EventDto::build(&pending, relations.clone());

        assert_eq!(dto.apply_type, "apply");
        assert_eq!(dto.command_id, pending.event.command_id);
        assert_eq!(dto.event_id, pending.event.event_id);
        assert_eq!(dto.event_data, pending.event.data);
        assert_eq!(dto.event_type, "ItemAdded");
        assert_eq!(dto.event_version, "1");
        assert_eq!(dto.metadata["trace"], "abc");
        assert_eq!(dto.pubsub_name, "bus");
        assert_eq!(dto.topic, "orders");
        assert_eq!(dto.relations, relations);
        assert!(dto.is_sourcing);
    }

    #[test]
    fn dto_build_keeps_relations_absent_when_none_extracted() {
        let dto = EventDto::build(&pending_item(), None);
        assert_eq!(dto.relations, None);
    }
}
