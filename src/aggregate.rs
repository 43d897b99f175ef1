//! Contracts implemented by domain types: aggregates, events, and commands.

use serde::{Serialize, de::DeserializeOwned};

/// State rebuilt from an event stream.
///
/// The implementing type itself serves as the aggregate's state. Hydration
/// starts from [`Default`], overlays the latest snapshot when one exists,
/// and folds every later event through the apply handlers registered for
/// this type.
///
/// # Contract
///
/// - `Default` must produce the pre-creation state, the state an aggregate
///   has before its first event.
/// - Serialization must round-trip: snapshots are stored with `Serialize`
///   and restored with `Deserialize`.
///
/// # Examples
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use verso_es::Aggregate;
///
/// #[derive(Debug, Default, Clone, Serialize, Deserialize)]
/// struct Account {
///     owner: String,
///     balance: i64,
/// }
///
/// impl Aggregate for Account {
///     const AGGREGATE_TYPE: &'static str = "account";
/// }
/// ```
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "order"). Part of every stream
    /// key in the event store, so it must be stable across releases.
    const AGGREGATE_TYPE: &'static str;
}

/// A domain event payload.
///
/// The type and version constants identify the payload on the wire and
/// select the apply handler on replay. Bumping [`EVENT_VERSION`] is how a
/// payload schema evolves: the old version keeps its handler, the new
/// version gets its own.
///
/// [`EVENT_VERSION`]: Event::EVENT_VERSION
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable event type identifier, optionally dotted (e.g.
    /// "com.shop.OrderPlaced"). Only the last dotted segment participates
    /// in apply-handler names.
    const EVENT_TYPE: &'static str;

    /// Schema version of the payload (e.g. "1" or "1.0").
    const EVENT_VERSION: &'static str;
}

/// A request to change one aggregate, routed to a registered handler.
///
/// The accessors feed request verification and event envelopes; they are
/// read once per dispatch.
pub trait Command: Send + Sync + 'static {
    /// Stable command type identifier used for handler lookup.
    const COMMAND_TYPE: &'static str;

    /// Tenant the command executes under.
    fn tenant_id(&self) -> &str;

    /// Caller-supplied id used by the store for idempotent retries.
    fn command_id(&self) -> &str;

    /// Id of the aggregate the command targets.
    fn aggregate_id(&self) -> &str;
}
