//! Relation extraction: pulling indexable key/value pairs out of event
//! payloads.
//!
//! Relations are how the store's relation index is fed. Each event type
//! declares, at registration time, which top-level payload fields should be
//! indexed; nothing is discovered by inspecting payloads at runtime.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::RelationError;

/// One declared relation field on an event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationField {
    field: String,
    key: Option<String>,
}

impl RelationField {
    /// Declares `field` for extraction, indexed under its own name.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            key: None,
        }
    }

    /// Declares `field` for extraction, indexed under `key` instead of the
    /// field name.
    pub fn keyed(field: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            key: Some(key.into()),
        }
    }

    /// The payload field this declaration reads.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The key the extracted value is indexed under.
    pub fn output_key(&self) -> &str {
        match &self.key {
            Some(key) if !key.is_empty() => key,
            _ => &self.field,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Extracts the declared relation fields from `payload`.
///
/// Fields absent from the payload (or explicitly `null`) are skipped, so
/// one declaration can serve several payload revisions. A declared field
/// that is present but not a JSON string is an error rather than a skip:
/// silently dropping it would leave a hole in the relation index.
///
/// Returns `Ok(None)` when nothing was declared or nothing matched, so
/// callers can leave the relations map off the wire entirely.
///
/// # Errors
///
/// Returns [`RelationError::NotAString`] naming the first offending field.
pub fn extract(
    fields: &[RelationField],
    payload: &Value,
) -> Result<Option<HashMap<String, String>>, RelationError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let mut relations = HashMap::new();
    for declared in fields {
        match payload.get(declared.field()) {
            None | Some(Value::Null) => continue,
            Some(Value::String(value)) => {
                relations.insert(declared.output_key().to_owned(), value.clone());
            }
            Some(other) => {
                return Err(RelationError::NotAString {
                    field: declared.field().to_owned(),
                    found: json_type_name(other),
                });
            }
        }
    }

    if relations.is_empty() {
        Ok(None)
    } else {
        Ok(Some(relations))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn no_declared_fields_extracts_nothing() {
        let payload = json!({ "id": "a-1", "user_id": "u-1" });
        assert_eq!(extract(&[], &payload), Ok(None));
    }

    #[test]
    fn only_declared_fields_are_extracted() {
        let fields = [
            RelationField::new("id"),
            RelationField::new("user_id"),
            RelationField::new("sys_id"),
        ];
        let payload = json!({
            "id": "a-1",
            "user_id": "u-1",
            "sys_id": "s-1",
            "nil_id": "ignored",
        });

        let relations = extract(&fields, &payload)
            .expect("string fields extract")
            .expect("three fields matched");
        assert_eq!(relations.len(), 3);
        assert_eq!(relations["id"], "a-1");
        assert_eq!(relations["user_id"], "u-1");
        assert_eq!(relations["sys_id"], "s-1");
        assert!(!relations.contains_key("nil_id"));
    }

    #[test]
    fn explicit_keys_rename_the_output() {
        let fields = [RelationField::keyed("customer_id", "customerId")];
        let payload = json!({ "customer_id": "cust-7" });

        let relations = extract(&fields, &payload)
            .expect("string field extracts")
            .expect("one field matched");
        assert_eq!(relations["customerId"], "cust-7");
        assert!(!relations.contains_key("customer_id"));
    }

    #[test]
    fn empty_explicit_key_falls_back_to_the_field_name() {
        let field = RelationField::keyed("id", "");
        assert_eq!(field.output_key(), "id");
    }

    #[test]
    fn absent_and_null_fields_are_skipped() {
        let fields = [RelationField::new("id"), RelationField::new("parent_id")];
        let payload = json!({ "id": "a-1", "parent_id": null });

        let relations = extract(&fields, &payload)
            .expect("absent fields skip")
            .expect("one field matched");
        assert_eq!(relations.len(), 1);
        assert_eq!(relations["id"], "a-1");
    }

    #[test]
    fn nothing_matching_extracts_none() {
        let fields = [RelationField::new("id")];
        let payload = json!({ "other": "x" });
        assert_eq!(extract(&fields, &payload), Ok(None));
    }

    #[test]
    fn non_string_values_are_an_error() {
        let fields = [RelationField::new("count")];
        let payload = json!({ "count": 3 });

        let err = extract(&fields, &payload).unwrap_err();
        match err {
            RelationError::NotAString { field, found } => {
                assert_eq!(field, "count");
                assert_eq!(found, "number");
            }
        }
    }

    #[test]
    fn nested_object_values_are_an_error_not_a_skip() {
        let fields = [RelationField::new("address")];
        let payload = json!({ "address": { "city": "Basel" } });

        let err = extract(&fields, &payload).unwrap_err();
        assert_eq!(
            err.to_string(),
            "relation field address must be a JSON string, found object"
        );
    }
}
