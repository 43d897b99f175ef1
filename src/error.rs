//! Crate-level error types for command verification, dispatch, and the
//! event store boundary.

/// Boxed error type accepted from domain command and apply handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One failed check on one request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Name of the offending field, as the caller supplied it.
    pub field: String,
    /// Human-readable description of what the field failed.
    pub message: String,
}

/// Accumulator for request verification.
///
/// Checks do not short-circuit: every failing field is recorded so the
/// caller can fix a request in one round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(Vec<FieldError>);

impl FieldErrors {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failed check against `field`.
    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Records an error when `value` is empty or whitespace-only.
    pub fn require(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.push(field, "must not be empty");
        }
    }

    /// Returns `true` when no check has failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The recorded failures, in check order.
    pub fn errors(&self) -> &[FieldError] {
        &self.0
    }

    /// Converts the accumulator into a result, consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Verify`] carrying every recorded failure when at
    /// least one check failed.
    pub fn into_result(self) -> Result<(), Error> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Verify(self))
        }
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", error.field, error.message)?;
            first = false;
        }
        Ok(())
    }
}

/// Error raised while assembling or consulting the event type registry.
///
/// Registry errors during startup are fatal: a process running with a
/// partial registry would silently drop events on replay.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A second registration arrived for an (event type, version) pair.
    #[error("event type {event_type} v{event_version} is already registered")]
    AlreadyRegistered {
        event_type: String,
        event_version: String,
    },

    /// A second handler set arrived for an aggregate type.
    #[error("aggregate type {aggregate_type} is already registered")]
    AggregateAlreadyRegistered { aggregate_type: String },

    /// Two event registrations derived the same apply-handler name.
    #[error("handler {method} is already registered on aggregate {aggregate_type}")]
    HandlerAlreadyRegistered {
        aggregate_type: String,
        method: String,
    },

    /// A second handler arrived for a command type.
    #[error("command {command_type} is already registered on aggregate {aggregate_type}")]
    CommandAlreadyRegistered {
        aggregate_type: String,
        command_type: String,
    },

    /// A stored or submitted event names a type the registry never saw.
    #[error("no registration for event type {event_type} v{event_version}")]
    UnknownEventType {
        event_type: String,
        event_version: String,
    },

    /// An operation targeted an aggregate type with no handler set.
    #[error("no registration for aggregate type {aggregate_type}")]
    UnknownAggregateType { aggregate_type: String },

    /// The registration itself is malformed (empty type or version).
    #[error("invalid registration for event type {event_type:?}: {reason}")]
    InvalidRegistration { event_type: String, reason: String },
}

/// Error raised while routing an event or command to its handler.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No apply handler matches the derived method name.
    ///
    /// Raised when an event arrives whose type and version map to a
    /// handler name nothing was registered under, typically a version
    /// bump without a matching handler.
    #[error("method {method} does not exist on aggregate {aggregate_type}")]
    MethodNotFound {
        aggregate_type: String,
        method: String,
    },

    /// No handler was registered for the command type.
    #[error("command {command_type} does not exist on aggregate {aggregate_type}")]
    CommandNotFound {
        aggregate_type: String,
        command_type: String,
    },

    /// The command is registered, but under the other handler kind.
    ///
    /// Creation commands must run through the creation path and mutation
    /// commands through the mutation path; crossing them would skip the
    /// existence checks each path performs.
    #[error(
        "command {command_type} on aggregate {aggregate_type} is registered \
         as a {actual} handler, not {expected}"
    )]
    KindMismatch {
        aggregate_type: String,
        command_type: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The decoded payload's concrete type did not match the handler's.
    #[error("payload type does not match handler {method} on aggregate {aggregate_type}")]
    BadPayload {
        aggregate_type: String,
        method: String,
    },

    /// The handler ran and returned a domain error.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),
}

/// Error raised while extracting relation key/value pairs from a payload.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelationError {
    /// A declared relation field is present but not a JSON string.
    #[error("relation field {field} must be a JSON string, found {found}")]
    NotAString { field: String, found: &'static str },
}

/// Error raised when a session is used after it was closed.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session already committed or rolled back.
    #[error("session {session_id} is {state}; no further operations are allowed")]
    Closed {
        session_id: String,
        state: &'static str,
    },
}

/// Top-level error for every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No stream exists for the requested aggregate id.
    ///
    /// Load reports absence through its `bool` return value; this variant
    /// is raised only where absence makes the operation impossible, such
    /// as a mutation command against an id that was never created.
    #[error("aggregate id not found: {aggregate_id}")]
    AggregateNotFound { aggregate_id: String },

    /// One or more request fields failed verification.
    #[error("verification failed: {0}")]
    Verify(FieldErrors),

    /// Registry assembly or lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Event or command routing failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Relation extraction failed.
    #[error(transparent)]
    Relation(#[from] RelationError),

    /// A closed session was used.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A snapshot write was refused by the store.
    ///
    /// The aggregate passed to the triggering load is left fully hydrated;
    /// only the snapshot is missing.
    #[error("snapshot save failed: {0}")]
    SnapshotSave(#[source] tonic::Status),

    /// The event store rejected or failed an RPC.
    ///
    /// Statuses pass through unchanged so callers can branch on
    /// [`tonic::Status::code`].
    #[error(transparent)]
    Transport(#[from] tonic::Status),

    /// JSON encoding or decoding of aggregate or event data failed.
    #[error("JSON codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The configured event store endpoint could not be parsed.
    #[error("invalid event store endpoint: {0}")]
    Endpoint(#[from] tonic::transport::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_errors_require_flags_empty_and_blank() {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", "");
        errors.require("aggregate_id", "   ");
        errors.require("command_id", "cmd-1");
        assert_eq!(errors.errors().len(), 2);
        assert_eq!(errors.errors()[0].field, "tenant_id");
        assert_eq!(errors.errors()[1].field, "aggregate_id");
    }

    #[test]
    fn field_errors_display_joins_with_semicolons() {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", "");
        errors.push("page_size", "must be greater than zero");
        assert_eq!(
            errors.to_string(),
            "tenant_id: must not be empty; page_size: must be greater than zero"
        );
    }

    #[test]
    fn field_errors_into_result_keeps_every_failure() {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", "");
        errors.require("command_id", "");
        let err = errors.into_result().unwrap_err();
        match err {
            Error::Verify(inner) => assert_eq!(inner.errors().len(), 2),
            other => panic!("expected Verify, got {other:?}"),
        }
    }

    #[test]
    fn field_errors_into_result_passes_when_clean() {
        let mut errors = FieldErrors::new();
        errors.require("tenant_id", "t1");
        assert!(errors.into_result().is_ok());
    }

    #[test]
    fn not_found_display_names_the_id() {
        let err = Error::AggregateNotFound {
            aggregate_id: "order-42".to_owned(),
        };
        assert_eq!(err.to_string(), "aggregate id not found: order-42");
    }

    #[test]
    fn registry_duplicate_display() {
        let err = RegistryError::AlreadyRegistered {
            event_type: "OrderPlaced".to_owned(),
            event_version: "1.0".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "event type OrderPlaced v1.0 is already registered"
        );
    }

    #[test]
    fn dispatch_method_not_found_display() {
        let err = DispatchError::MethodNotFound {
            aggregate_type: "order".to_owned(),
            method: "OnOrderPlacedV2".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "method OnOrderPlacedV2 does not exist on aggregate order"
        );
    }

    #[test]
    fn dispatch_handler_error_keeps_source() {
        let source: BoxError = "insufficient stock".into();
        let err = DispatchError::Handler(source);
        assert_eq!(err.to_string(), "handler failed: insufficient stock");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn session_closed_display_names_state() {
        let err = SessionError::Closed {
            session_id: "s-1".to_owned(),
            state: "committed",
        };
        assert_eq!(
            err.to_string(),
            "session s-1 is committed; no further operations are allowed"
        );
    }

    #[test]
    fn transport_status_passes_through_unchanged() {
        let status = tonic::Status::unavailable("store offline");
        let err = Error::from(status);
        match &err {
            Error::Transport(status) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
                assert_eq!(status.message(), "store offline");
            }
            other => panic!("expected Transport, got {other:?}"),
        }
        assert!(err.to_string().contains("store offline"));
    }

    #[test]
    fn snapshot_save_display_wraps_status() {
        let err = Error::SnapshotSave(tonic::Status::unavailable("disk full"));
        assert!(err.to_string().starts_with("snapshot save failed:"));
        assert!(std::error::Error::source(&err).is_some());
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries under `tokio::spawn`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<Error>();
            assert_send_sync::<RegistryError>();
            assert_send_sync::<DispatchError>();
            assert_send_sync::<RelationError>();
            assert_send_sync::<SessionError>();
            assert_send_sync::<FieldErrors>();
        }
    };
}
