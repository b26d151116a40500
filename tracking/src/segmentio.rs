//! Ingest endpoint for events relayed by the analytics provider's webhook.
use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, instrument, warn, Span};

use crate::api::{WebhookError, WebhookResponse};
use crate::config::{CommaSeparated, Config};
use crate::directory::User;
use crate::event::{remove_shim_context, SegmentEnvelope, TrackedEvent};
use crate::keys::CourseKey;
use crate::prometheus::report_rejected_webhook;
use crate::router;
use crate::time::{format_event_time, parse_segment_timestamp};
use crate::tracker::{self, ContextGuard};

pub const SEGMENTIO_CONTEXT: &str = "edx.segmentio";

#[derive(Debug, Clone, Default)]
pub struct WebhookSettings {
    pub secret: Option<String>,
    pub allowed_channels: CommaSeparated,
    pub allowed_actions: CommaSeparated,
    pub source_map: HashMap<String, String>,
    pub disallowed_substring_names: CommaSeparated,
}

impl WebhookSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            secret: config.webhook_secret.clone(),
            allowed_channels: config.allowed_channels.clone(),
            allowed_actions: config.allowed_actions.clone(),
            source_map: config.source_map.0.clone(),
            disallowed_substring_names: config.disallowed_substring_names.clone(),
        }
    }

    /// An unset secret matches nothing.
    fn is_authorized(&self, key: Option<&str>) -> bool {
        match (&self.secret, key) {
            (Some(secret), Some(key)) => secret.as_bytes().ct_eq(key.as_bytes()).into(),
            _ => false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub key: Option<String>,
}

/// An envelope that passed validation.
struct ValidEnvelope {
    envelope: SegmentEnvelope,
    user: User,
    event_type: String,
    time: String,
    received_at: String,
    course: Option<(String, CourseKey)>,
}

pub async fn event(
    State(state): State<router::State>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookError> {
    tracker::scope(ingest(state, query, body))
        .await
        .map(Json)
        .map_err(|error| {
            report_rejected_webhook(error.cause());
            error
        })
}

#[instrument(skip_all, fields(channel, action, event_type))]
async fn ingest(
    state: router::State,
    query: WebhookQuery,
    body: Bytes,
) -> Result<WebhookResponse, WebhookError> {
    if !state.webhook.is_authorized(query.key.as_deref()) {
        warn!("rejected webhook call with an invalid key");
        return Err(WebhookError::Unauthorized);
    }

    let raw: Value = serde_json::from_slice(&body).map_err(|error| {
        warn!(%error, "webhook body is not valid json");
        WebhookError::InvalidJson(error)
    })?;
    if !raw.is_object() {
        warn!(envelope = %raw, "webhook body is not a json object");
        return Err(WebhookError::InvalidJson(serde::de::Error::custom(
            "expected a json object",
        )));
    }
    let envelope: SegmentEnvelope = serde_json::from_value(raw.clone()).map_err(|error| {
        warn!(%error, envelope = %raw, "webhook body is not an envelope");
        WebhookError::InvalidJson(error)
    })?;

    let valid = match validate(&state, envelope).await {
        Ok(valid) => valid,
        Err(
            error @ (WebhookError::ChannelIgnored
            | WebhookError::ActionIgnored
            | WebhookError::EventNameIgnored),
        ) => {
            debug!(%error, "webhook event ignored");
            return Ok(WebhookResponse {
                committed: false,
                message: Some(error.to_string()),
            });
        }
        Err(error) => {
            warn!(%error, envelope = %raw, "invalid webhook event");
            return Err(error);
        }
    };

    emit(&state, valid).await;
    Ok(WebhookResponse::committed())
}

fn user_id(envelope: &SegmentEnvelope) -> Result<i64, WebhookError> {
    match &envelope.user_id {
        None | Some(Value::Null) => Err(WebhookError::MissingUserId),
        Some(Value::Number(id)) => id.as_i64().ok_or(WebhookError::InvalidUserId),
        Some(Value::String(id)) if id.is_empty() => Err(WebhookError::MissingUserId),
        Some(Value::String(id)) => id.trim().parse().map_err(|_| WebhookError::InvalidUserId),
        Some(_) => Err(WebhookError::InvalidUserId),
    }
}

fn course_id(envelope: &SegmentEnvelope) -> Option<String> {
    envelope
        .properties
        .get("context")
        .and_then(|context| context.get("course_id"))
        .or_else(|| envelope.context.get("course_id"))
        .and_then(Value::as_str)
        .filter(|course_id| !course_id.is_empty())
        .map(str::to_owned)
}

async fn validate(
    state: &router::State,
    envelope: SegmentEnvelope,
) -> Result<ValidEnvelope, WebhookError> {
    let settings = &state.webhook;
    let span = Span::current();

    let channel = envelope.channel.as_deref().unwrap_or_default();
    span.record("channel", channel);
    if !settings.allowed_channels.contains_ignore_case(channel) {
        return Err(WebhookError::ChannelIgnored);
    }

    let action = envelope.action.as_deref().unwrap_or_default();
    span.record("action", action);
    if !settings.allowed_actions.contains_ignore_case(action) {
        return Err(WebhookError::ActionIgnored);
    }

    let name = envelope
        .property_str("name")
        .or_else(|| envelope.property_str("event_type"))
        .unwrap_or_default();
    if settings
        .disallowed_substring_names
        .iter()
        .any(|disallowed| name.contains(disallowed))
    {
        return Err(WebhookError::EventNameIgnored);
    }

    let user = state
        .users
        .lookup_user(user_id(&envelope)?)
        .await?
        .ok_or(WebhookError::UnknownUser)?;

    let timestamp = envelope
        .timestamp
        .as_deref()
        .ok_or(WebhookError::MissingTimestamp)?;
    let received_at = envelope
        .received_at
        .as_deref()
        .ok_or(WebhookError::MissingReceivedAt)?;
    let time = parse_segment_timestamp(timestamp).map_err(WebhookError::InvalidTimestamp)?;
    let received_at =
        parse_segment_timestamp(received_at).map_err(WebhookError::InvalidTimestamp)?;

    let event_type = envelope
        .property_str("event_type")
        .filter(|event_type| !event_type.is_empty())
        .ok_or(WebhookError::MissingEventType)?
        .to_owned();
    span.record("event_type", event_type.as_str());

    let course = course_id(&envelope).and_then(|course_id| match course_id.parse::<CourseKey>() {
        Ok(course) => Some((course_id, course)),
        Err(error) => {
            warn!(%error, "webhook event carries an invalid course_id");
            None
        }
    });

    Ok(ValidEnvelope {
        envelope,
        user,
        event_type,
        time: format_event_time(time),
        received_at: format_event_time(received_at),
        course,
    })
}

fn segmentio_context(valid: &ValidEnvelope) -> Map<String, Value> {
    let envelope = &valid.envelope;
    let mut context = envelope
        .properties
        .get("context")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    context.insert("client".to_owned(), envelope.context.clone().into());
    if let Some(app) = envelope.context.get("app") {
        let field = |name: &str| app.get(name).cloned().unwrap_or_else(|| "".into());
        context.insert(
            "application".to_owned(),
            serde_json::json!({"name": field("name"), "version": field("version")}),
        );
    }
    context.insert("user_id".to_owned(), valid.user.id.into());
    context.insert("received_at".to_owned(), valid.received_at.clone().into());
    match &valid.course {
        Some((course_id, course)) => {
            context.insert("course_id".to_owned(), course_id.clone().into());
            context.insert("org_id".to_owned(), course.org.clone().into());
        }
        None => {
            context.remove("course_id");
        }
    }
    context
}

fn event_source(settings: &router::State, envelope: &SegmentEnvelope) -> String {
    envelope
        .library_name()
        .and_then(|library| settings.webhook.source_map.get(library))
        .cloned()
        .unwrap_or_else(|| {
            envelope
                .channel
                .as_deref()
                .unwrap_or_default()
                .to_lowercase()
        })
}

async fn emit(state: &router::State, valid: ValidEnvelope) {
    let _guard = ContextGuard::enter(SEGMENTIO_CONTEXT, segmentio_context(&valid));
    let envelope = &valid.envelope;

    let page = envelope
        .property_str("page")
        .or_else(|| {
            envelope
                .context
                .get("page")
                .and_then(|page| page.get("url"))
                .and_then(Value::as_str)
        })
        .map(str::to_owned);
    let host = page
        .as_deref()
        .and_then(|page| url::Url::parse(page).ok())
        .and_then(|url| url.host_str().map(str::to_owned))
        .unwrap_or_default();
    let context_str = |field: &str| {
        envelope
            .context
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    let ip = envelope
        .property_str("ip")
        .map(str::to_owned)
        .unwrap_or_else(|| context_str("ip"));

    let mut event = TrackedEvent::new();
    event.insert("username", valid.user.username.clone());
    event.insert("event_type", valid.event_type.clone());
    event.insert(
        "name",
        envelope
            .property_str("name")
            .unwrap_or(&valid.event_type)
            .to_owned(),
    );
    event.insert("event_source", event_source(state, envelope));
    event.insert("time", valid.time.clone());
    event.insert("context", tracker::resolve_context());
    event.insert("page", page);
    event.insert("host", host);
    event.insert("agent", context_str("userAgent"));
    event.insert("ip", ip);
    event.insert(
        "event",
        envelope
            .properties
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    );
    remove_shim_context(&mut event);

    state.events.send(event).await;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn settings(secret: Option<&str>) -> WebhookSettings {
        WebhookSettings {
            secret: secret.map(str::to_owned),
            ..Default::default()
        }
    }

    fn envelope(user_id: Value) -> SegmentEnvelope {
        serde_json::from_value(json!({ "userId": user_id })).unwrap()
    }

    #[test]
    fn only_the_configured_secret_is_accepted() {
        let settings = settings(Some("secret"));
        assert!(settings.is_authorized(Some("secret")));
        assert!(!settings.is_authorized(Some("secrets")));
        assert!(!settings.is_authorized(Some("")));
        assert!(!settings.is_authorized(None));
    }

    #[test]
    fn unset_secret_rejects_everything() {
        let settings = settings(None);
        assert!(!settings.is_authorized(Some("")));
        assert!(!settings.is_authorized(None));
    }

    #[test]
    fn user_id_can_be_a_number_or_a_numeric_string() {
        assert_eq!(user_id(&envelope(json!(42))).unwrap(), 42);
        assert_eq!(user_id(&envelope(json!("42"))).unwrap(), 42);

        assert!(matches!(
            user_id(&envelope(Value::Null)),
            Err(WebhookError::MissingUserId)
        ));
        assert!(matches!(
            user_id(&SegmentEnvelope::default()),
            Err(WebhookError::MissingUserId)
        ));
        assert!(matches!(
            user_id(&envelope(json!("forty-two"))),
            Err(WebhookError::InvalidUserId)
        ));
        assert!(matches!(
            user_id(&envelope(json!(4.2))),
            Err(WebhookError::InvalidUserId)
        ));
    }

    #[test]
    fn course_id_prefers_the_event_context() {
        let envelope: SegmentEnvelope = serde_json::from_value(json!({
            "context": {"course_id": "course-v1:edX+Other+Run"},
            "properties": {"context": {"course_id": "course-v1:edX+DemoX+Demo_Course"}},
        }))
        .unwrap();
        assert_eq!(
            course_id(&envelope).as_deref(),
            Some("course-v1:edX+DemoX+Demo_Course")
        );
        assert_eq!(course_id(&SegmentEnvelope::default()), None);
    }
}
