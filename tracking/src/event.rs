use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Top-level fields the legacy consumers read, duplicated in the request context.
pub const LEGACY_CONTEXT_FIELDS: [&str; 7] = [
    "username",
    "session",
    "ip",
    "agent",
    "host",
    "referer",
    "accept_language",
];

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("payload is not valid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is not an object")]
    NotAnObject,
}

/// The `event` (or `data`) field of an event. Browser events carry it JSON-encoded,
/// everything else carries the object itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Raw(String),
    Parsed(Map<String, Value>),
}

impl Payload {
    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }

    /// Decode into a mapping, whatever the shape it arrived in.
    pub fn into_map(self) -> Result<Map<String, Value>, PayloadError> {
        match self {
            Payload::Parsed(map) => Ok(map),
            Payload::Raw(raw) => match serde_json::from_str::<Value>(&raw)? {
                Value::Object(map) => Ok(map),
                _ => Err(PayloadError::NotAnObject),
            },
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Payload::Raw(raw) => Value::String(raw),
            Payload::Parsed(map) => Value::Object(map),
        }
    }
}

impl TryFrom<Value> for Payload {
    type Error = PayloadError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(raw) => Ok(Payload::Raw(raw)),
            Value::Object(map) => Ok(Payload::Parsed(map)),
            _ => Err(PayloadError::NotAnObject),
        }
    }
}

/// An event travelling through the processor chain. Kept as an open JSON object since
/// processors and sinks each read a different subset of fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackedEvent(Map<String, Value>);

impl TrackedEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.0.remove(field)
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    pub fn context(&self) -> Option<&Map<String, Value>> {
        self.0.get("context").and_then(Value::as_object)
    }

    /// Mutable access to the context, if the event has one.
    pub fn context_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.0.get_mut("context").and_then(Value::as_object_mut)
    }

    pub fn context_str(&self, field: &str) -> Option<&str> {
        self.context()
            .and_then(|context| context.get(field))
            .and_then(Value::as_str)
    }

    /// The `event` field as a payload, when it holds a string or an object.
    pub fn payload(&self) -> Option<Payload> {
        self.0
            .get("event")
            .cloned()
            .and_then(|value| Payload::try_from(value).ok())
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.0.insert("event".to_owned(), payload.into_value());
    }

    /// Partition key for sinks that need one.
    pub fn key(&self) -> String {
        let user = self
            .context()
            .and_then(|context| context.get("user_id"))
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        format!("{}:{}", user, self.name().unwrap_or_default())
    }
}

impl From<Map<String, Value>> for TrackedEvent {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Remove from the context the fields that are also carried at the top level of a legacy
/// event, along with `client_id`.
pub fn remove_shim_context(event: &mut TrackedEvent) {
    if let Some(context) = event.context_mut() {
        for field in LEGACY_CONTEXT_FIELDS {
            context.remove(field);
        }
        context.remove("client_id");
    }
}

/// The envelope the analytics provider posts to the webhook. Every field is optional at
/// this stage, validation happens in the handler so each failure gets its own message.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct SegmentEnvelope {
    pub channel: Option<String>,
    pub action: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<Value>,
    pub timestamp: Option<String>,
    #[serde(rename = "receivedAt")]
    pub received_at: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl SegmentEnvelope {
    pub fn property_str(&self, field: &str) -> Option<&str> {
        self.properties.get(field).and_then(Value::as_str)
    }

    pub fn library_name(&self) -> Option<&str> {
        self.context
            .get("library")
            .and_then(|library| library.get("name"))
            .and_then(Value::as_str)
    }
}
