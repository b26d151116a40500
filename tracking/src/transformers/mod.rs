//! Rewrites of new-style events into the shape legacy consumers of the tracking logs
//! still expect.
//!
//! A [`Transformer`] is registered under a match key: an exact event name, or a dotted
//! prefix ending with `.`. For each event the registry picks the transformer with the
//! exact key or, failing that, the longest matching prefix, and the transformer rewrites a
//! [`Transformation`] holding the event and its decoded payload.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{Payload, PayloadError, TrackedEvent};
use crate::mapping::DottedPathMapping;

pub mod forum;
pub mod sequence;
pub mod video;

pub use forum::{ForumSettings, ForumThreadViewedTransformer};
pub use sequence::{NextSelectedTransformer, PreviousSelectedTransformer, TabSelectedTransformer};
pub use video::VideoTransformer;

#[derive(Error, Debug)]
pub enum TransformError {
    /// The event must not be emitted at all.
    #[error("event emission cancelled by transformer")]
    EmissionExit,
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("transformer match key must not be empty")]
    EmptyMatchKey,
    #[error("event has no name")]
    MissingName,
    #[error("no transformer registered for {0}")]
    NotRegistered(String),
}

/// Shape the payload arrived in, restored once the transformation is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadShape {
    Absent,
    Raw,
    Parsed,
}

/// One event being rewritten. Created per event and consumed by [`Transformation::finish`].
#[derive(Debug)]
pub struct Transformation {
    event: TrackedEvent,
    payload: Map<String, Value>,
    shape: PayloadShape,
}

impl Transformation {
    pub fn new(mut event: TrackedEvent) -> Result<Self, TransformError> {
        let (payload, shape) = match event.remove("event") {
            None => (Map::new(), PayloadShape::Absent),
            Some(value) => {
                let payload = Payload::try_from(value)?;
                let shape = if payload.is_raw() {
                    PayloadShape::Raw
                } else {
                    PayloadShape::Parsed
                };
                (payload.into_map()?, shape)
            }
        };

        Ok(Transformation {
            event,
            payload,
            shape,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.event.name()
    }

    pub fn set_name(&mut self, name: &str) {
        self.event.insert("name", name);
    }

    pub fn set_event_type(&mut self, event_type: &str) {
        self.event.insert("event_type", event_type);
    }

    pub fn context(&self) -> Option<&Map<String, Value>> {
        self.event.context()
    }

    pub fn context_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.event.context_mut()
    }

    /// Top-level event field.
    pub fn field(&self, field: &str) -> Option<&Value> {
        self.event.get(field)
    }

    pub fn set_field(&mut self, field: &str, value: impl Into<Value>) {
        self.event.insert(field, value);
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.payload
    }

    /// Move a payload entry to a new key, if present.
    pub fn rename_payload_key(&mut self, from: &str, to: &str) -> Option<&Value> {
        let value = self.payload.remove(from)?;
        self.payload.insert(to.to_owned(), value);
        self.payload.get(to)
    }

    /// Put the payload back in the shape it arrived in and hand back the event.
    pub fn finish(mut self) -> TrackedEvent {
        match self.shape {
            PayloadShape::Absent if self.payload.is_empty() => {}
            PayloadShape::Raw => {
                let raw = Value::Object(self.payload).to_string();
                self.event.set_payload(Payload::Raw(raw));
            }
            PayloadShape::Absent | PayloadShape::Parsed => {
                self.event.set_payload(Payload::Parsed(self.payload));
            }
        }
        self.event
    }
}

#[async_trait]
pub trait Transformer {
    fn match_key(&self) -> &str;

    fn matches(&self, name: &str) -> bool {
        let key = self.match_key();
        if key.ends_with('.') {
            name.starts_with(key)
        } else {
            name == key
        }
    }

    /// Whether the event also has to satisfy the legacy schema.
    fn is_legacy_event(&self, _event: &Transformation) -> bool {
        false
    }

    fn legacy_event_type(&self, _event: &Transformation) -> Option<String> {
        None
    }

    fn process_legacy_fields(&self, _event: &mut Transformation) {}

    async fn process_event(&self, _event: &mut Transformation) -> Result<(), TransformError> {
        Ok(())
    }

    async fn transform(&self, event: TrackedEvent) -> Result<TrackedEvent, TransformError> {
        let mut event = Transformation::new(event)?;

        if self.is_legacy_event(&event) {
            if let Some(event_type) = self.legacy_event_type(&event) {
                event.set_event_type(&event_type);
            }
            self.process_legacy_fields(&mut event);
        }
        self.process_event(&mut event).await?;

        Ok(event.finish())
    }
}

pub type SharedTransformer = Arc<dyn Transformer + Send + Sync>;

/// Transformers by match key. Filled once at startup, read-only afterwards.
#[derive(Default, Clone)]
pub struct TransformerRegistry {
    mapping: DottedPathMapping<SharedTransformer>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every transformer shipped with the pipeline.
    pub fn with_defaults(forum: ForumThreadViewedTransformer) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        let defaults: [SharedTransformer; 5] = [
            Arc::new(TabSelectedTransformer),
            Arc::new(NextSelectedTransformer),
            Arc::new(PreviousSelectedTransformer),
            Arc::new(VideoTransformer),
            Arc::new(forum),
        ];
        for transformer in defaults {
            registry.register(transformer)?;
        }
        Ok(registry)
    }

    /// Register a transformer under its match key, replacing any previous one.
    pub fn register(&mut self, transformer: SharedTransformer) -> Result<(), RegistryError> {
        let key = transformer.match_key().to_owned();
        if key.is_empty() {
            return Err(RegistryError::EmptyMatchKey);
        }
        if self.mapping.set(key.clone(), transformer).is_some() {
            tracing::debug!(match_key = %key, "replaced registered transformer");
        }
        Ok(())
    }

    pub fn create_transformer(
        &self,
        event: &TrackedEvent,
    ) -> Result<SharedTransformer, RegistryError> {
        let name = event.name().ok_or(RegistryError::MissingName)?;
        self.mapping
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(name.to_owned()))
    }

    pub fn match_keys(&self) -> impl Iterator<Item = &str> {
        self.mapping.keys()
    }
}
