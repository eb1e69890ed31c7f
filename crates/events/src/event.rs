use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "sales.order.shipped").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Maps an aggregate's event enum to and from its stored `(event_type, payload)`
/// form.
///
/// Implementors are enums serialized as adjacently tagged values
/// (`#[serde(tag = "type", content = "data")]`) whose variant names are renamed
/// to their `event_type()`. The stored payload is the `data` part only, so an
/// event can be re-read as a different variant by changing nothing but its
/// stored type name.
pub trait EventSchema: Event + Serialize + DeserializeOwned {
    /// Every event type name this aggregate knows how to replay.
    const EVENT_TYPES: &'static [&'static str];

    fn is_known_type(event_type: &str) -> bool {
        Self::EVENT_TYPES.contains(&event_type)
    }

    /// Serialize the event's data (without its type tag).
    fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        match serde_json::to_value(self)? {
            JsonValue::Object(mut tagged) => Ok(tagged.remove("data").unwrap_or(JsonValue::Null)),
            other => Ok(other),
        }
    }

    /// Rebuild an event of the given type from its stored payload.
    ///
    /// Returns `None` when the type name is not one of `EVENT_TYPES`.
    fn from_payload(
        event_type: &str,
        payload: JsonValue,
    ) -> Option<Result<Self, serde_json::Error>> {
        if !Self::is_known_type(event_type) {
            return None;
        }
        Some(serde_json::from_value(json!({ "type": event_type, "data": payload })))
    }
}
