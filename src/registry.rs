//! Event type registry: payload decoders and relation declarations.
//!
//! The registry is assembled while the manager is built and frozen from
//! then on. Replay depends on it being complete: an event type missing
//! from the registry makes hydration fail loudly instead of silently
//! skipping state.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::aggregate::Event;
use crate::error::{Error, RegistryError};
use crate::relation::RelationField;

type DecodeFn =
    Box<dyn Fn(&Value) -> Result<Box<dyn Any + Send>, serde_json::Error> + Send + Sync>;

/// Declarative registration for one event type.
///
/// Carries the relation fields to index and, optionally, a custom decoder
/// for payloads whose stored shape no longer matches the Rust type.
pub struct EventRegistration {
    relations: Vec<RelationField>,
    decoder: Option<DecodeFn>,
}

impl EventRegistration {
    /// Starts an empty registration: default decoder, no relations.
    pub fn new() -> Self {
        Self {
            relations: Vec::new(),
            decoder: None,
        }
    }

    /// Declares a payload field for relation extraction, indexed under its
    /// own name.
    pub fn relation(mut self, field: impl Into<String>) -> Self {
        self.relations.push(RelationField::new(field));
        self
    }

    /// Declares a payload field for relation extraction, indexed under
    /// `key`.
    pub fn relation_as(mut self, field: impl Into<String>, key: impl Into<String>) -> Self {
        self.relations.push(RelationField::keyed(field, key));
        self
    }

    /// Replaces the default serde decoder.
    ///
    /// Useful when stored payloads predate a field rename and need to be
    /// mapped into the current type by hand.
    pub fn decoder<E, F>(mut self, decode: F) -> Self
    where
        E: Event,
        F: Fn(&Value) -> Result<E, serde_json::Error> + Send + Sync + 'static,
    {
        self.decoder = Some(Box::new(move |value| {
            decode(value).map(|event| Box::new(event) as Box<dyn Any + Send>)
        }));
        self
    }
}

impl Default for EventRegistration {
    fn default() -> Self {
        Self::new()
    }
}

// Manual `Debug` because the decoder is a type-erased closure.
impl fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistration")
            .field("relations", &self.relations)
            .field("custom_decoder", &self.decoder.is_some())
            .finish()
    }
}

struct RegistryEntry {
    decode: DecodeFn,
    relations: Vec<RelationField>,
}

/// Frozen mapping from (event type, event version) to decoder and relation
/// declarations.
pub struct EventTypeRegistry {
    entries: HashMap<(String, String), RegistryEntry>,
}

// Manual `Debug` because entries hold type-erased decoders.
impl fmt::Debug for EventTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTypeRegistry")
            .field("registered", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventTypeRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Adds `E` to the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRegistration`] when `E`'s type or
    /// version constant is empty, and [`RegistryError::AlreadyRegistered`]
    /// when the (type, version) pair is taken. The earlier registration
    /// stays in effect in both cases.
    pub(crate) fn register<E: Event>(
        &mut self,
        registration: EventRegistration,
    ) -> Result<(), RegistryError> {
        if E::EVENT_TYPE.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration {
                event_type: E::EVENT_TYPE.to_owned(),
                reason: "event type must not be empty".to_owned(),
            });
        }
        if E::EVENT_VERSION.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration {
                event_type: E::EVENT_TYPE.to_owned(),
                reason: "event version must not be empty".to_owned(),
            });
        }

        let key = (E::EVENT_TYPE.to_owned(), E::EVENT_VERSION.to_owned());
        if self.entries.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered {
                event_type: key.0,
                event_version: key.1,
            });
        }

        let decode: DecodeFn = match registration.decoder {
            Some(decode) => decode,
            None => Box::new(|value: &Value| {
                serde_json::from_value::<E>(value.clone())
                    .map(|event| Box::new(event) as Box<dyn Any + Send>)
            }),
        };
        self.entries.insert(
            key,
            RegistryEntry {
                decode,
                relations: registration.relations,
            },
        );
        Ok(())
    }

    /// Decodes a stored payload into the typed event registered for the
    /// (type, version) pair.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownEventType`] for unregistered pairs
    /// and [`Error::Codec`] when the payload does not decode.
    pub fn resolve(
        &self,
        event_type: &str,
        event_version: &str,
        payload: &Value,
    ) -> Result<Box<dyn Any + Send>, Error> {
        let entry = self.entry(event_type, event_version)?;
        (entry.decode)(payload).map_err(Error::Codec)
    }

    /// Relation fields declared for the (type, version) pair.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownEventType`] for unregistered pairs.
    pub fn relation_fields(
        &self,
        event_type: &str,
        event_version: &str,
    ) -> Result<&[RelationField], RegistryError> {
        Ok(&self.entry(event_type, event_version)?.relations)
    }

    /// Whether the (type, version) pair is registered.
    pub fn contains(&self, event_type: &str, event_version: &str) -> bool {
        self.entries
            .contains_key(&(event_type.to_owned(), event_version.to_owned()))
    }

    /// Number of registered (type, version) pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no registrations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(
        &self,
        event_type: &str,
        event_version: &str,
    ) -> Result<&RegistryEntry, RegistryError> {
        self.entries
            .get(&(event_type.to_owned(), event_version.to_owned()))
            .ok_or_else(|| RegistryError::UnknownEventType {
                event_type: event_type.to_owned(),
                event_version: event_version.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::aggregate::test_fixtures::{ItemAdded, OrderPlaced};

    #[test]
    fn resolve_decodes_into_the_registered_type() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register::<ItemAdded>(EventRegistration::new())
            .expect("first registration");

        let boxed = registry
            .resolve("ItemAdded", "1", &json!({ "sku": "sku-9" }))
            .expect("registered payload decodes");
        let event = boxed.downcast::<ItemAdded>().expect("concrete type");
        assert_eq!(event.sku, "sku-9");
    }

    #[test]
    fn resolve_rejects_unregistered_types() {
        let registry = EventTypeRegistry::new();
        let err = registry
            .resolve("ItemAdded", "1", &json!({}))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::UnknownEventType { .. })
        ));
    }

    #[test]
    fn versions_are_registered_independently() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register::<ItemAdded>(EventRegistration::new())
            .expect("version 1 registers");

        assert!(registry.contains("ItemAdded", "1"));
        assert!(!registry.contains("ItemAdded", "2"));
        let err = registry.resolve("ItemAdded", "2", &json!({})).unwrap_err();
        assert!(matches!(
            err,
            Error::Registry(RegistryError::UnknownEventType { .. })
        ));
    }

    #[test]
    fn duplicate_registration_keeps_the_first_entry() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register::<ItemAdded>(
                EventRegistration::new()
                    .decoder(|_value| Ok(ItemAdded { sku: "first".into() })),
            )
            .expect("first registration");

        let err = registry
            .register::<ItemAdded>(EventRegistration::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));

        // The first decoder is still the one in effect.
        let boxed = registry
            .resolve("ItemAdded", "1", &json!({ "sku": "second" }))
            .expect("first registration still resolves");
        let event = boxed.downcast::<ItemAdded>().expect("concrete type");
        assert_eq!(event.sku, "first");
    }

    #[test]
    fn malformed_payloads_fail_the_decode() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register::<ItemAdded>(EventRegistration::new())
            .expect("first registration");

        let err = registry
            .resolve("ItemAdded", "1", &json!({ "sku": 42 }))
            .unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn relation_fields_round_trip_the_declaration() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register::<OrderPlaced>(
                EventRegistration::new()
                    .relation("order_id")
                    .relation_as("customer_id", "customerId"),
            )
            .expect("first registration");

        let fields = registry
            .relation_fields("com.verso.test.OrderPlaced", "1.0")
            .expect("registered type");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field(), "order_id");
        assert_eq!(fields[1].output_key(), "customerId");
    }

    #[test]
    fn undeclared_relations_resolve_to_an_empty_slice() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register::<ItemAdded>(EventRegistration::new())
            .expect("first registration");

        let fields = registry
            .relation_fields("ItemAdded", "1")
            .expect("registered type");
        assert!(fields.is_empty());
    }

    #[test]
    fn custom_decoder_bridges_legacy_payloads() {
        let mut registry = EventTypeRegistry::new();
        registry
            .register::<ItemAdded>(EventRegistration::new().decoder(|value| {
                // Early payloads stored the sku under "sku_code".
                let legacy: serde_json::Map<String, Value> =
                    serde_json::from_value(value.clone())?;
                let sku = legacy
                    .get("sku_code")
                    .or_else(|| legacy.get("sku"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                Ok(ItemAdded { sku })
            }))
            .expect("first registration");

        let boxed = registry
            .resolve("ItemAdded", "1", &json!({ "sku_code": "legacy-9" }))
            .expect("legacy payload decodes");
        let event = boxed.downcast::<ItemAdded>().expect("concrete type");
        assert_eq!(event.sku, "legacy-9");
    }

    #[test]
    fn empty_version_constants_are_rejected() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Unversioned;

        impl crate::aggregate::Event for Unversioned {
            const EVENT_TYPE: &'static str = "Unversioned";
            const EVENT_VERSION: &'static str = "";
        }

        let mut registry = EventTypeRegistry::new();
        let err = registry
            .register::<Unversioned>(EventRegistration::new())
            .unwrap_err();
        match err {
            RegistryError::InvalidRegistration { event_type, reason } => {
                assert_eq!(event_type, "Unversioned");
                assert!(reason.contains("version"));
            }
            other => panic!("expected InvalidRegistration, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn len_counts_type_version_pairs() {
        let mut registry = EventTypeRegistry::new();
        assert!(registry.is_empty());
        registry
            .register::<ItemAdded>(EventRegistration::new())
            .expect("first registration");
        registry
            .register::<OrderPlaced>(EventRegistration::new())
            .expect("second registration");
        assert_eq!(registry.len(), 2);
    }
}
