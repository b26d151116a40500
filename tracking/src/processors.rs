//! Processors applied, in order, to every event before it reaches a sink.
//!
//! A processor returns the event to pass on, or [`ProcessorError::EmissionExit`] to drop
//! it. Any other error is logged by the chain, which then carries on with the event as it
//! was before the failing step.
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{remove_shim_context, TrackedEvent, LEGACY_CONTEXT_FIELDS};
use crate::transformers::{RegistryError, TransformError, TransformerRegistry};

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("event emission cancelled")]
    EmissionExit,
    #[error("transformation failed: {0}")]
    TransformFailed(TransformError),
}

impl From<TransformError> for ProcessorError {
    fn from(error: TransformError) -> Self {
        match error {
            TransformError::EmissionExit => ProcessorError::EmissionExit,
            other => ProcessorError::TransformFailed(other),
        }
    }
}

#[async_trait]
pub trait Processor {
    fn name(&self) -> &'static str;

    async fn process(&self, event: &TrackedEvent) -> Result<TrackedEvent, ProcessorError>;
}

pub type SharedProcessor = Arc<dyn Processor + Send + Sync>;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown processor: {0}")]
pub struct UnknownProcessor(String);

/// Processors that can be named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorKind {
    LegacyFieldMapping,
    EventTransformer,
    GoogleAnalytics,
    NameWhitelist,
}

impl FromStr for ProcessorKind {
    type Err = UnknownProcessor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "legacy_field_mapping" => Ok(ProcessorKind::LegacyFieldMapping),
            "event_transformer" | "prefixed_event" => Ok(ProcessorKind::EventTransformer),
            "google_analytics" => Ok(ProcessorKind::GoogleAnalytics),
            "name_whitelist" => Ok(ProcessorKind::NameWhitelist),
            other => Err(UnknownProcessor(other.to_owned())),
        }
    }
}

impl ProcessorKind {
    pub fn build(
        self,
        registry: &Arc<TransformerRegistry>,
        whitelist: &[String],
    ) -> SharedProcessor {
        match self {
            ProcessorKind::LegacyFieldMapping => Arc::new(LegacyFieldMapping),
            ProcessorKind::EventTransformer => {
                Arc::new(EventTransformerProcessor::new(registry.clone()))
            }
            ProcessorKind::GoogleAnalytics => Arc::new(GoogleAnalyticsProcessor),
            ProcessorKind::NameWhitelist => {
                Arc::new(NameWhitelistProcessor::new(whitelist.iter().cloned()))
            }
        }
    }
}

/// Run `processors` in order. `None` when one of them dropped the event.
pub async fn run_chain(
    processors: &[SharedProcessor],
    mut event: TrackedEvent,
) -> Option<TrackedEvent> {
    for processor in processors {
        match processor.process(&event).await {
            Ok(processed) => event = processed,
            Err(ProcessorError::EmissionExit) => {
                tracing::debug!(
                    processor = processor.name(),
                    name = event.name(),
                    "event dropped"
                );
                metrics::counter!("tracking_events_dropped_total", "cause" => processor.name())
                    .increment(1);
                return None;
            }
            Err(error) => {
                tracing::warn!(
                    processor = processor.name(),
                    name = event.name(),
                    %error,
                    "processor failed, continuing with unprocessed event"
                );
            }
        }
    }
    Some(event)
}

/// Move the fields legacy consumers read at the top level out of the context, and put the
/// payload under `event`.
pub struct LegacyFieldMapping;

impl LegacyFieldMapping {
    /// Take `field` from the context. Fall back on the existing top-level value, then on
    /// `default`.
    fn move_from_context(
        event: &mut TrackedEvent,
        context: &mut Map<String, Value>,
        field: &str,
        default: Value,
    ) {
        if let Some(value) = context.remove(field) {
            event.insert(field, value);
        } else if !event.contains(field) {
            event.insert(field, default);
        }
    }
}

#[async_trait]
impl Processor for LegacyFieldMapping {
    fn name(&self) -> &'static str {
        "legacy_field_mapping"
    }

    async fn process(&self, event: &TrackedEvent) -> Result<TrackedEvent, ProcessorError> {
        let mut event = event.clone();
        let mut context = match event.remove("context") {
            Some(Value::Object(context)) => context,
            _ => Map::new(),
        };
        let from_browser = context
            .get("event_source")
            .or_else(|| event.get("event_source"))
            .and_then(Value::as_str)
            == Some("browser");

        for field in LEGACY_CONTEXT_FIELDS {
            Self::move_from_context(&mut event, &mut context, field, Value::from(""));
        }

        match event.remove("data") {
            Some(data) => {
                event.insert("event", data);
            }
            None if !event.contains("event") => {
                event.insert("event", Map::new());
            }
            None => {}
        }
        if from_browser {
            let raw = event
                .get("event")
                .filter(|payload| payload.is_object())
                .map(Value::to_string);
            if let Some(raw) = raw {
                event.insert("event", raw);
            }
        }

        let timestamp = event.remove("timestamp");
        if let Some(time) = context.remove("timestamp").or(timestamp) {
            event.insert("time", time);
        }

        if !event.contains("event_type") {
            let name = event.name().unwrap_or_default().to_owned();
            event.insert("event_type", name);
        }
        if !event.contains("event_source") {
            event.insert("event_source", "server");
        }
        if !event.contains("page") {
            event.insert("page", Value::Null);
        }

        event.insert("context", context);
        remove_shim_context(&mut event);
        Ok(event)
    }
}

/// Hand the event to the transformer registered for its name, if any.
pub struct EventTransformerProcessor {
    registry: Arc<TransformerRegistry>,
}

impl EventTransformerProcessor {
    pub fn new(registry: Arc<TransformerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Processor for EventTransformerProcessor {
    fn name(&self) -> &'static str {
        "event_transformer"
    }

    async fn process(&self, event: &TrackedEvent) -> Result<TrackedEvent, ProcessorError> {
        let transformer = match self.registry.create_transformer(event) {
            Ok(transformer) => transformer,
            Err(RegistryError::NotRegistered(_) | RegistryError::MissingName) => {
                return Ok(event.clone())
            }
            Err(error) => {
                tracing::warn!(%error, "transformer lookup failed");
                return Ok(event.clone());
            }
        };

        Ok(transformer.transform(event.clone()).await?)
    }
}

/// Fields the web analytics integration reads at the top level.
pub struct GoogleAnalyticsProcessor;

#[async_trait]
impl Processor for GoogleAnalyticsProcessor {
    fn name(&self) -> &'static str {
        "google_analytics"
    }

    async fn process(&self, event: &TrackedEvent) -> Result<TrackedEvent, ProcessorError> {
        let mut copied = event.clone();
        if let Some(course_id) = event.context().and_then(|context| context.get("course_id")) {
            copied.insert("label", course_id.clone());
        }
        copied.insert("nonInteraction", 1);
        Ok(copied)
    }
}

/// Only lets through events whose name is listed.
pub struct NameWhitelistProcessor {
    names: HashSet<String>,
}

impl NameWhitelistProcessor {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            names: names.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Processor for NameWhitelistProcessor {
    fn name(&self) -> &'static str {
        "name_whitelist"
    }

    async fn process(&self, event: &TrackedEvent) -> Result<TrackedEvent, ProcessorError> {
        match event.name() {
            Some(name) if self.names.contains(name) => Ok(event.clone()),
            _ => Err(ProcessorError::EmissionExit),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::event::PayloadError;
    use crate::transformers::{ForumSettings, ForumThreadViewedTransformer};

    fn event(value: Value) -> TrackedEvent {
        serde_json::from_value(value).unwrap()
    }

    fn registry() -> Arc<TransformerRegistry> {
        let directory = Arc::new(MemoryDirectory::new());
        let forum =
            ForumThreadViewedTransformer::new(ForumSettings::default(), directory.clone(), directory);
        Arc::new(TransformerRegistry::with_defaults(forum).unwrap())
    }

    fn default_chain() -> Vec<SharedProcessor> {
        let registry = registry();
        [ProcessorKind::LegacyFieldMapping, ProcessorKind::EventTransformer]
            .into_iter()
            .map(|kind| kind.build(&registry, &[]))
            .collect()
    }

    #[test]
    fn parses_processor_names() {
        assert_eq!(
            "prefixed_event".parse::<ProcessorKind>(),
            Ok(ProcessorKind::EventTransformer)
        );
        assert_eq!(
            " google_analytics".parse::<ProcessorKind>(),
            Ok(ProcessorKind::GoogleAnalytics)
        );
        assert_eq!(
            "nope".parse::<ProcessorKind>(),
            Err(UnknownProcessor("nope".to_owned()))
        );
    }

    #[tokio::test]
    async fn legacy_mapping_moves_context_fields() {
        let out = LegacyFieldMapping
            .process(&event(json!({
                "name": "edx.course.enrollment.activated",
                "timestamp": "2014-08-27T16:33:39.215000+00:00",
                "context": {
                    "username": "alice",
                    "ip": "10.0.0.1",
                    "client_id": "ga-client",
                    "course_id": "course-v1:edX+DemoX+Demo_Course",
                    "user_id": 7
                },
                "data": {"mode": "audit"}
            })))
            .await
            .unwrap();

        assert_eq!(
            out.as_map(),
            json!({
                "name": "edx.course.enrollment.activated",
                "time": "2014-08-27T16:33:39.215000+00:00",
                "username": "alice",
                "session": "",
                "ip": "10.0.0.1",
                "agent": "",
                "host": "",
                "referer": "",
                "accept_language": "",
                "event_type": "edx.course.enrollment.activated",
                "event_source": "server",
                "page": null,
                "event": {"mode": "audit"},
                "context": {"course_id": "course-v1:edX+DemoX+Demo_Course", "user_id": 7}
            })
            .as_object()
            .unwrap()
        );
    }

    #[tokio::test]
    async fn legacy_mapping_encodes_browser_payloads() {
        let out = LegacyFieldMapping
            .process(&event(json!({
                "name": "page_close",
                "event_source": "browser",
                "context": {"timestamp": "t"},
                "data": {"a": 1}
            })))
            .await
            .unwrap();

        assert_eq!(out.get_str("event"), Some("{\"a\":1}"));
        assert_eq!(out.get_str("event_source"), Some("browser"));
        assert_eq!(out.get_str("time"), Some("t"));
    }

    #[tokio::test]
    async fn legacy_mapping_encodes_shaped_browser_payloads() {
        let out = LegacyFieldMapping
            .process(&event(json!({
                "name": "page_close",
                "event_source": "browser",
                "event": {"a": 1},
                "context": {}
            })))
            .await
            .unwrap();

        assert_eq!(out.get_str("event"), Some("{\"a\":1}"));
    }

    #[tokio::test]
    async fn legacy_mapping_defaults_leave_the_context_alone() {
        let out = LegacyFieldMapping
            .process(&event(json!({
                "name": "my.event",
                "context": {
                    "event_type": "context.type",
                    "event_source": "mobile",
                    "page": "https://example.com/courses",
                    "user_id": 7
                }
            })))
            .await
            .unwrap();

        assert_eq!(out.get_str("event_type"), Some("my.event"));
        assert_eq!(out.get_str("event_source"), Some("server"));
        assert_eq!(out.get("page"), Some(&Value::Null));
        assert_eq!(
            Value::Object(out.context().unwrap().clone()),
            json!({
                "event_type": "context.type",
                "event_source": "mobile",
                "page": "https://example.com/courses",
                "user_id": 7
            })
        );
    }

    #[tokio::test]
    async fn legacy_mapping_keeps_shaped_events() {
        let input = event(json!({
            "name": "my.event",
            "username": "alice",
            "event_type": "my.event",
            "event_source": "mobile",
            "time": "t",
            "page": "https://example.com",
            "ip": "10.0.0.1",
            "event": {"a": 1},
            "context": {"user_id": 7}
        }));
        let out = LegacyFieldMapping.process(&input).await.unwrap();

        for field in ["username", "event_type", "event_source", "time", "page", "ip", "event"] {
            assert_eq!(out.get(field), input.get(field), "{field} changed");
        }
        assert_eq!(out.get_str("session"), Some(""));
    }

    #[tokio::test]
    async fn analytics_processor_copies_course_id() {
        let input = event(json!({"name": "a", "context": {"course_id": "c"}}));
        let out = GoogleAnalyticsProcessor.process(&input).await.unwrap();

        assert_eq!(out.get_str("label"), Some("c"));
        assert_eq!(out.get("nonInteraction"), Some(&json!(1)));
        assert!(!input.contains("label"));
    }

    #[tokio::test]
    async fn whitelist_drops_unlisted_names() {
        let processor = NameWhitelistProcessor::new(["listed".to_owned()]);
        assert!(processor
            .process(&event(json!({"name": "listed"})))
            .await
            .is_ok());
        assert!(matches!(
            processor.process(&event(json!({"name": "other"}))).await,
            Err(ProcessorError::EmissionExit)
        ));
    }

    #[tokio::test]
    async fn chain_drops_forum_screen_views_with_other_labels() {
        let out = run_chain(
            &default_chain(),
            event(json!({
                "name": "edx.bi.app.navigation.screen",
                "context": {"label": "Course: Outline"},
                "data": {}
            })),
        )
        .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn chain_applies_transformers_after_mapping() {
        let out = run_chain(
            &default_chain(),
            event(json!({
                "name": "edx.ui.lms.sequence.tab_selected",
                "context": {"username": "alice"},
                "data": {"current_tab": 1, "target_tab": 2}
            })),
        )
        .await
        .unwrap();

        assert_eq!(out.get_str("event_type"), Some("seq_goto"));
        assert_eq!(out.get_str("username"), Some("alice"));
        assert_eq!(out.get("event").unwrap()["new"], json!(2));
    }

    struct Failing;

    #[async_trait]
    impl Processor for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn process(&self, _event: &TrackedEvent) -> Result<TrackedEvent, ProcessorError> {
            Err(ProcessorError::TransformFailed(TransformError::InvalidPayload(
                PayloadError::NotAnObject,
            )))
        }
    }

    #[tokio::test]
    async fn failing_processor_does_not_stop_the_chain() {
        let chain: Vec<SharedProcessor> = vec![Arc::new(Failing), Arc::new(GoogleAnalyticsProcessor)];
        let out = run_chain(&chain, event(json!({"name": "a"}))).await.unwrap();
        assert_eq!(out.get("nonInteraction"), Some(&json!(1)));
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn unregistered_events_only_move_shim_fields(
                name in "[a-z]{1,8}\\.[a-z]{1,8}",
                username in "[a-z]{0,8}",
                payload in prop::collection::hash_map("[a-z]{1,6}", any::<i32>(), 0..4),
            ) {
                let input = event(json!({
                    "name": name,
                    "context": {"username": username, "user_id": 3},
                    "data": payload,
                }));

                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                let expected = rt.block_on(LegacyFieldMapping.process(&input)).unwrap();
                let out = rt.block_on(run_chain(&default_chain(), input)).unwrap();

                prop_assert_eq!(out, expected);
            }
        }
    }
}
