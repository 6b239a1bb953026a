//! Event to document mapping. The document model is schema-agnostic: any JSON
//! object payload is accepted as-is and an `id` field is injected. The id is
//! derived deterministically from the event's coordinates, so a redelivered
//! event always produces the same id and the downstream upsert stays
//! idempotent.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{Event, PartitionId};

/// A schema-agnostic JSON object with a populated `id` field.
pub type Document = serde_json::Map<String, Value>;

/// Key of the injected identity field.
pub const ID_FIELD: &str = "id";

/// Derives the identity of the document produced from an event:
/// `{partition}-{offset}`.
pub fn document_id(partition: &PartitionId, offset: i64) -> String {
    format!("{partition}-{offset}")
}

/// Parses the event payload into a [Document] and injects the identity field.
/// Payloads that are not valid JSON objects are rejected; the caller treats
/// that as an ordinary handler failure for this event.
pub fn to_document(event: &Event) -> Result<Document> {
    let value: Value = serde_json::from_slice(&event.payload)
        .map_err(|e| Error::Document(format!("payload is not valid JSON: {e}")))?;
    let Value::Object(mut document) = value else {
        return Err(Error::Document(format!(
            "payload is not a JSON object, found {}",
            json_type(&value)
        )));
    };
    document.insert(
        ID_FIELD.to_string(),
        Value::String(document_id(&event.partition, event.offset)),
    );
    Ok(document)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
