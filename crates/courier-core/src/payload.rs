//! Event payload encoding.
//!
//! Payloads are JSON objects. Values that JSON cannot carry natively are
//! written as their canonical strings: timestamps as RFC 3339, decimals as
//! plain decimal strings, UUIDs hyphenated. Serializing through
//! `serde_json::Value` keeps object keys sorted, so the wire body of an entry
//! is stable across encodings.

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};

/// Convert any serializable value into an event payload.
///
/// Fails unless the value serializes to a JSON object.
pub fn to_payload<T: Serialize>(value: &T) -> Result<JsonValue> {
    match serde_json::to_value(value)? {
        JsonValue::Object(map) => Ok(JsonValue::Object(map)),
        other => Err(Error::InvalidInput(format!(
            "event payload must be a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Compact, key-sorted body bytes sent to subscribers.
pub fn encode_body(payload: &JsonValue) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Incremental payload builder.
///
/// ```
/// use courier_core::payload::PayloadBuilder;
///
/// let payload = PayloadBuilder::new()
///     .field("status", "stored")
///     .field("size_bytes", 1000)
///     .build();
/// assert_eq!(payload["status"], "stored");
/// ```
#[derive(Debug, Default, Clone)]
pub struct PayloadBuilder {
    fields: Map<String, JsonValue>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field. Values that fail to serialize are stored as `null`.
    pub fn field<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        let value = serde_json::to_value(value).unwrap_or(JsonValue::Null);
        self.fields.insert(key.into(), value);
        self
    }

    /// Add a field only when `value` is `Some`.
    pub fn optional<T: Serialize>(self, key: impl Into<String>, value: Option<T>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    pub fn build(self) -> JsonValue {
        JsonValue::Object(self.fields)
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::str::FromStr;
    use uuid::Uuid;

    #[test]
    fn test_extended_types_encode_as_canonical_strings() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let id = Uuid::from_str("0190f6a2-7c4e-7a00-8000-000000000001").unwrap();
        let amount = BigDecimal::from_str("12.50").unwrap();

        let payload = PayloadBuilder::new()
            .field("at", at)
            .field("id", id)
            .field("amount", amount)
            .build();

        assert_eq!(payload["at"], "2026-01-02T03:04:05Z");
        assert_eq!(payload["id"], "0190f6a2-7c4e-7a00-8000-000000000001");
        assert_eq!(payload["amount"], "12.50");
    }

    #[test]
    fn test_body_keys_are_sorted_and_compact() {
        let payload = json!({"zeta": 1, "alpha": {"b": 2, "a": 1}});
        let body = encode_body(&payload).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"alpha":{"a":1,"b":2},"zeta":1}"#
        );
    }

    #[test]
    fn test_to_payload_requires_object() {
        #[derive(Serialize)]
        struct Stored {
            file_id: Uuid,
            size_bytes: i64,
        }

        let payload = to_payload(&Stored {
            file_id: Uuid::nil(),
            size_bytes: 10,
        })
        .unwrap();
        assert_eq!(payload["size_bytes"], 10);

        let err = to_payload(&vec![1, 2]).unwrap_err();
        assert!(err.to_string().contains("got array"));
    }

    #[test]
    fn test_optional_fields_skipped() {
        let payload = PayloadBuilder::new()
            .optional("batch_id", None::<Uuid>)
            .optional("error", Some("boom"))
            .build();
        assert_eq!(payload, json!({"error": "boom"}));
    }
}
