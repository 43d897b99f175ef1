//! Handler-name derivation and per-aggregate handler tables.
//!
//! Apply handlers are looked up by a name derived from the event type and
//! version, never by payload inspection. The derivation is part of the
//! crate's compatibility surface: changing it would orphan every stored
//! event.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::aggregate::{Aggregate, Command, Event};
use crate::error::{BoxError, DispatchError, RegistryError};
use crate::event::PendingEvent;

/// Derives the apply-handler name for an event type and version.
///
/// Only the last dot-separated segment of the event type participates, so
/// reverse-domain names stay readable. The version is normalized to a
/// leading uppercase `V` with dots replaced by underscores.
///
/// # Examples
///
/// ```
/// use verso_es::handler_method_name;
///
/// assert_eq!(
///     handler_method_name("com.shop.OrderPlaced", "1.0"),
///     "OnOrderPlacedV1_0"
/// );
/// assert_eq!(handler_method_name("ItemAdded", "2"), "OnItemAddedV2");
/// assert_eq!(handler_method_name("ItemAdded", "v2"), "OnItemAddedV2");
/// ```
pub fn handler_method_name(event_type: &str, event_version: &str) -> String {
    let name = event_type.rsplit('.').next().unwrap_or(event_type);
    let bare = event_version
        .strip_prefix('V')
        .or_else(|| event_version.strip_prefix('v'))
        .unwrap_or(event_version);
    format!("On{name}V{}", bare.replace('.', "_"))
}

/// Which dispatch path a command handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Brings a new aggregate into existence; runs without hydration.
    Create,
    /// Changes an existing aggregate; runs against hydrated state.
    Mutate,
}

impl CommandKind {
    /// Human-readable kind name, used in dispatch errors.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Create => "creation",
            CommandKind::Mutate => "mutation",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ApplyFn<A> =
    Box<dyn Fn(&mut A, Box<dyn Any + Send>) -> Result<(), DispatchError> + Send + Sync>;

type CommandFn<A> =
    Box<dyn Fn(&A, &dyn Any) -> Result<Vec<PendingEvent>, DispatchError> + Send + Sync>;

struct CommandEntry<A> {
    kind: CommandKind,
    handler: CommandFn<A>,
}

/// Registered apply and command handlers for one aggregate type.
///
/// Entries are inserted during startup registration and only read after,
/// so lookups need no synchronization.
pub(crate) struct HandlerTable<A> {
    applies: HashMap<String, ApplyFn<A>>,
    commands: HashMap<String, CommandEntry<A>>,
}

// Manual `Debug` because the handler values are type-erased closures.
impl<A> fmt::Debug for HandlerTable<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("applies", &self.applies.keys().collect::<Vec<_>>())
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<A: Aggregate> HandlerTable<A> {
    pub(crate) fn new() -> Self {
        Self {
            applies: HashMap::new(),
            commands: HashMap::new(),
        }
    }

    /// Registers an apply handler under the name derived from `E`'s type
    /// and version constants.
    pub(crate) fn on_event<E, F>(&mut self, handler: F) -> Result<(), RegistryError>
    where
        E: Event,
        F: Fn(&mut A, E) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let method = handler_method_name(E::EVENT_TYPE, E::EVENT_VERSION);
        if self.applies.contains_key(&method) {
            return Err(RegistryError::HandlerAlreadyRegistered {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                method,
            });
        }

        let key = method.clone();
        self.applies.insert(
            key,
            Box::new(move |state, payload| {
                let event = payload
                    .downcast::<E>()
                    .map_err(|_| DispatchError::BadPayload {
                        aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                        method: method.clone(),
                    })?;
                handler(state, *event).map_err(DispatchError::Handler)
            }),
        );
        Ok(())
    }

    /// Registers a command handler under `C::COMMAND_TYPE`.
    pub(crate) fn on_command<C, F>(
        &mut self,
        kind: CommandKind,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        C: Command,
        F: Fn(&A, &C) -> Result<Vec<PendingEvent>, BoxError> + Send + Sync + 'static,
    {
        if self.commands.contains_key(C::COMMAND_TYPE) {
            return Err(RegistryError::CommandAlreadyRegistered {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                command_type: C::COMMAND_TYPE.to_owned(),
            });
        }

        self.commands.insert(
            C::COMMAND_TYPE.to_owned(),
            CommandEntry {
                kind,
                handler: Box::new(move |state, payload| {
                    let command =
                        payload
                            .downcast_ref::<C>()
                            .ok_or_else(|| DispatchError::BadPayload {
                                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                                method: C::COMMAND_TYPE.to_owned(),
                            })?;
                    handler(state, command).map_err(DispatchError::Handler)
                }),
            },
        );
        Ok(())
    }

    /// Routes a decoded payload to the apply handler registered under
    /// `method`, mutating `state` in place.
    pub(crate) fn dispatch_apply(
        &self,
        state: &mut A,
        method: &str,
        payload: Box<dyn Any + Send>,
    ) -> Result<(), DispatchError> {
        let handler = self
            .applies
            .get(method)
            .ok_or_else(|| DispatchError::MethodNotFound {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                method: method.to_owned(),
            })?;
        handler(state, payload)
    }

    /// Routes a command to its registered handler, enforcing the handler
    /// kind the caller expects.
    pub(crate) fn dispatch_command<C: Command>(
        &self,
        state: &A,
        command: &C,
        expected: CommandKind,
    ) -> Result<Vec<PendingEvent>, DispatchError> {
        let entry =
            self.commands
                .get(C::COMMAND_TYPE)
                .ok_or_else(|| DispatchError::CommandNotFound {
                    aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                    command_type: C::COMMAND_TYPE.to_owned(),
                })?;
        if entry.kind != expected {
            return Err(DispatchError::KindMismatch {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                command_type: C::COMMAND_TYPE.to_owned(),
                expected: expected.as_str(),
                actual: entry.kind.as_str(),
            });
        }
        (entry.handler)(state, command)
    }

    /// The kind a command type was registered under, if any.
    pub(crate) fn command_kind(&self, command_type: &str) -> Option<CommandKind> {
        self.commands.get(command_type).map(|entry| entry.kind)
    }
}
