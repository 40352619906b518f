//! Realtime wire messages and their parsed form

use crate::core::ParseError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Outer message types that carry no entity change
const CONTROL_TYPES: &[&str] = &["ping", "pong", "heartbeat", "subscribed", "connected"];

/// What happened to the entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "entity_created")]
    Created,
    #[serde(rename = "entity_updated")]
    Updated,
    #[serde(rename = "entity_deleted")]
    Deleted,
    /// Any kind this client does not interpret
    Other(String),
}

impl EventKind {
    /// Parse a wire kind; unknown values are kept verbatim
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "entity_created" | "created" | "create" | "insert" | "inserted" => EventKind::Created,
            "entity_updated" | "updated" | "update" | "upsert" | "changed" => EventKind::Updated,
            "entity_deleted" | "deleted" | "delete" | "removed" | "remove" => EventKind::Deleted,
            _ => EventKind::Other(raw.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => f.write_str("entity_created"),
            EventKind::Updated => f.write_str("entity_updated"),
            EventKind::Deleted => f.write_str("entity_deleted"),
            EventKind::Other(raw) => f.write_str(raw),
        }
    }
}

/// A server-pushed change to one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeEvent {
    /// What happened
    pub kind: EventKind,
    /// Target collection
    pub collection: String,
    /// Target entity
    pub entity_id: String,
    /// New entity body (`Null` for deletes)
    pub data: Value,
}

impl RealtimeEvent {
    /// Build an event directly
    pub fn new(kind: EventKind, collection: impl Into<String>, entity_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            collection: collection.into(),
            entity_id: entity_id.into(),
            data,
        }
    }

    /// Encode in the wire shape accepted by [`parse_message`]
    pub fn to_message(&self) -> String {
        json!({
            "type": "update",
            "data": {
                "type": self.kind.to_string(),
                "collection": self.collection,
                "entityId": self.entity_id,
                "data": self.data,
            }
        })
        .to_string()
    }
}

/// Parse one raw message.
///
/// Returns `Ok(None)` for control messages. The collection comes from
/// `data.collection` or the outer `channel`; the entity id from `entityId`,
/// `entity_id` or `id`; the body from `data.data`, `data.payload` or else the
/// remaining fields of `data`.
pub fn parse_message(raw: &str) -> Result<Option<RealtimeEvent>, ParseError> {
    let message: Value = serde_json::from_str(raw)?;
    let Value::Object(mut outer) = message else {
        return Err(ParseError::InvalidField { field: "message", reason: "expected a JSON object".into() });
    };

    let message_type = outer
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField("type"))?;
    if CONTROL_TYPES.contains(&message_type) {
        return Ok(None);
    }

    let channel = outer.get("channel").and_then(Value::as_str).map(str::to_string);
    let mut data = match outer.remove("data") {
        Some(Value::Object(map)) => map,
        Some(_) => return Err(ParseError::InvalidField { field: "data", reason: "expected an object".into() }),
        None => return Err(ParseError::MissingField("data")),
    };

    let kind = match data.remove("type") {
        Some(Value::String(kind)) => EventKind::parse(&kind),
        Some(_) => return Err(ParseError::InvalidField { field: "data.type", reason: "expected a string".into() }),
        None => return Err(ParseError::MissingField("data.type")),
    };

    let collection = take_string(&mut data, &["collection"])
        .or(channel)
        .ok_or(ParseError::MissingField("collection"))?;
    let entity_id = take_string(&mut data, &["entityId", "entity_id", "id"]).ok_or(ParseError::MissingField("entityId"))?;

    let body = match (data.remove("data"), data.remove("payload")) {
        (Some(body), _) | (None, Some(body)) => body,
        (None, None) if data.is_empty() => Value::Null,
        (None, None) => Value::Object(data),
    };

    Ok(Some(RealtimeEvent { kind, collection, entity_id, data: body }))
}

/// `{"type":"subscribe","channels":[...]}`
pub fn subscribe_message(channels: &[String]) -> String {
    json!({ "type": "subscribe", "channels": channels }).to_string()
}

fn take_string(map: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.remove(*key) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
