//! Delivery to the analytics provider, optionally duplicated to a per-site account.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{EventSink, SinkError};
use crate::event::TrackedEvent;

/// Integration sub-context read by the web analytics destination.
pub const GOOGLE_ANALYTICS: &str = "Google Analytics";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsMethod {
    Track,
    Identify,
    Group,
    Alias,
    Page,
    Screen,
}

impl AnalyticsMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsMethod::Track => "track",
            AnalyticsMethod::Identify => "identify",
            AnalyticsMethod::Group => "group",
            AnalyticsMethod::Alias => "alias",
            AnalyticsMethod::Page => "page",
            AnalyticsMethod::Screen => "screen",
        }
    }
}

impl fmt::Display for AnalyticsMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub properties: Map<String, Value>,
    pub context: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[async_trait]
pub trait AnalyticsClient {
    async fn call(
        &self,
        method: AnalyticsMethod,
        message: AnalyticsMessage,
    ) -> Result<(), SinkError>;
}

pub type SharedAnalyticsClient = Arc<dyn AnalyticsClient + Send + Sync>;

/// Client for the provider's HTTP API.
pub struct HttpAnalyticsClient {
    client: reqwest::Client,
    host: String,
    write_key: String,
}

impl HttpAnalyticsClient {
    pub fn new(host: &str, write_key: &str, timeout: Duration) -> Result<Self, SinkError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("edx-tracking")
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_owned(),
            write_key: write_key.to_owned(),
        })
    }
}

#[async_trait]
impl AnalyticsClient for HttpAnalyticsClient {
    async fn call(
        &self,
        method: AnalyticsMethod,
        message: AnalyticsMessage,
    ) -> Result<(), SinkError> {
        let url = format!("{}/v1/{}", self.host, method);
        let response = self
            .client
            .post(url)
            .basic_auth(&self.write_key, Some(""))
            .json(&message)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SinkError::UnexpectedStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

/// A second account receiving a copy of every call.
pub struct PerSiteClient {
    pub client: SharedAnalyticsClient,
    pub tracking_id: Option<String>,
}

/// Sends every call to the primary client, then to the per-site one when configured.
/// Only the primary outcome is reported.
pub struct FanoutClient {
    primary: SharedAnalyticsClient,
    per_site: Option<PerSiteClient>,
}

impl FanoutClient {
    pub fn new(primary: SharedAnalyticsClient, per_site: Option<PerSiteClient>) -> Self {
        Self { primary, per_site }
    }

    fn per_site_message(
        mut message: AnalyticsMessage,
        tracking_id: Option<&str>,
    ) -> AnalyticsMessage {
        if message.message_id.is_some() {
            message.message_id = Some(Uuid::now_v7().to_string());
        }

        match tracking_id {
            Some(tracking_id) => {
                if let Some(integration) = message
                    .context
                    .get_mut(GOOGLE_ANALYTICS)
                    .and_then(Value::as_object_mut)
                {
                    integration.insert("trackingId".to_owned(), tracking_id.into());
                }
            }
            None => {
                message.context.remove(GOOGLE_ANALYTICS);
            }
        }
        message
    }
}

#[async_trait]
impl AnalyticsClient for FanoutClient {
    async fn call(
        &self,
        method: AnalyticsMethod,
        message: AnalyticsMessage,
    ) -> Result<(), SinkError> {
        let Some(per_site) = &self.per_site else {
            return self.primary.call(method, message).await;
        };

        let copy = Self::per_site_message(message.clone(), per_site.tracking_id.as_deref());
        let result = self.primary.call(method, message).await;

        if let Err(error) = per_site.client.call(method, copy).await {
            tracing::warn!(%method, %error, "per-site analytics call failed");
        }
        result
    }
}

/// Turns emitted events into `track` calls.
pub struct SegmentSink {
    client: SharedAnalyticsClient,
    tracking_id: Option<String>,
}

impl SegmentSink {
    pub fn new(client: SharedAnalyticsClient, tracking_id: Option<String>) -> Self {
        Self {
            client,
            tracking_id,
        }
    }

    /// Top-level field, or the context one when the shim has not moved it.
    fn field<'a>(event: &'a TrackedEvent, field: &str) -> Option<&'a str> {
        event
            .get_str(field)
            .filter(|value| !value.is_empty())
            .or_else(|| event.context_str(field))
            .filter(|value| !value.is_empty())
    }

    fn analytics_context(&self, event: &TrackedEvent) -> Map<String, Value> {
        let mut context = Map::new();

        let mut integration = Map::new();
        if let Some(client_id) = event.context_str("client_id") {
            integration.insert("clientId".to_owned(), client_id.into());
        }
        if let Some(tracking_id) = &self.tracking_id {
            integration.insert("trackingId".to_owned(), tracking_id.clone().into());
        }
        if !integration.is_empty() {
            context.insert(GOOGLE_ANALYTICS.to_owned(), integration.into());
        }

        if let Some(ip) = Self::field(event, "ip") {
            context.insert("ip".to_owned(), ip.into());
        }
        if let Some(agent) = Self::field(event, "agent") {
            context.insert("userAgent".to_owned(), agent.into());
        }

        let path = event.context_str("path");
        let referrer = Self::field(event, "referer");
        let url = Self::field(event, "page").map(str::to_owned).or_else(|| {
            let host = Self::field(event, "host")?;
            path.map(|path| format!("//{host}{path}"))
        });
        if path.is_some() || referrer.is_some() || url.is_some() {
            context.insert(
                "page".to_owned(),
                serde_json::json!({"path": path, "referrer": referrer, "url": url}),
            );
        }
        context
    }
}

#[async_trait]
impl EventSink for SegmentSink {
    async fn send(&self, event: TrackedEvent) -> Result<(), SinkError> {
        let user_id = event.context().and_then(|context| context.get("user_id"));
        let (Some(name), Some(user_id)) = (event.name(), user_id) else {
            tracing::debug!(name = event.name(), "event has no name or user, not forwarded");
            return Ok(());
        };
        let user_id = match user_id {
            Value::String(id) if !id.is_empty() => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => {
                tracing::debug!(name, "event has no user, not forwarded");
                return Ok(());
            }
        };

        let mut properties = event
            .payload()
            .and_then(|payload| payload.into_map().ok())
            .unwrap_or_default();
        for field in ["label", "nonInteraction"] {
            if let Some(value) = event.get(field) {
                properties.insert(field.to_owned(), value.clone());
            }
        }

        let message = AnalyticsMessage {
            user_id: Some(user_id),
            event: Some(name.to_owned()),
            properties,
            context: self.analytics_context(&event),
            message_id: Some(Uuid::now_v7().to_string()),
            timestamp: event
                .get_str("time")
                .or_else(|| event.get_str("timestamp"))
                .map(str::to_owned),
        };

        self.client.call(AnalyticsMethod::Track, message).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<(AnalyticsMethod, AnalyticsMessage)>>,
        fail: bool,
    }

    impl RecordingClient {
        fn calls(&self) -> Vec<(AnalyticsMethod, AnalyticsMessage)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AnalyticsClient for RecordingClient {
        async fn call(
            &self,
            method: AnalyticsMethod,
            message: AnalyticsMessage,
        ) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push((method, message));
            if self.fail {
                return Err(SinkError::UnexpectedStatus(500));
            }
            Ok(())
        }
    }

    fn message_with_integration() -> AnalyticsMessage {
        AnalyticsMessage {
            user_id: Some("7".to_owned()),
            event: Some("edx.course.enrollment.activated".to_owned()),
            context: json!({GOOGLE_ANALYTICS: {"clientId": "abc", "trackingId": "UA-1"}})
                .as_object()
                .cloned()
                .unwrap(),
            message_id: Some("original".to_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn per_site_copy_gets_its_own_id_and_tracking_id() {
        let primary = Arc::new(RecordingClient::default());
        let secondary = Arc::new(RecordingClient::default());
        let fanout = FanoutClient::new(
            primary.clone(),
            Some(PerSiteClient {
                client: secondary.clone(),
                tracking_id: Some("UA-2".to_owned()),
            }),
        );

        fanout
            .call(AnalyticsMethod::Track, message_with_integration())
            .await
            .unwrap();

        let primary_calls = primary.calls();
        let secondary_calls = secondary.calls();
        assert_eq!(primary_calls.len(), 1);
        assert_eq!(secondary_calls.len(), 1);
        assert_eq!(primary_calls[0].1, message_with_integration());

        let copy = &secondary_calls[0].1;
        assert_eq!(secondary_calls[0].0, AnalyticsMethod::Track);
        assert_ne!(copy.message_id, primary_calls[0].1.message_id);
        assert!(copy.message_id.is_some());
        assert_eq!(
            copy.context[GOOGLE_ANALYTICS],
            json!({"clientId": "abc", "trackingId": "UA-2"})
        );
    }

    #[tokio::test]
    async fn per_site_copy_drops_integration_without_tracking_id() {
        let primary = Arc::new(RecordingClient::default());
        let secondary = Arc::new(RecordingClient {
            fail: true,
            ..Default::default()
        });
        let fanout = FanoutClient::new(
            primary.clone(),
            Some(PerSiteClient {
                client: secondary.clone(),
                tracking_id: None,
            }),
        );

        // The per-site failure is not reported
        fanout
            .call(AnalyticsMethod::Identify, message_with_integration())
            .await
            .unwrap();

        let copy = &secondary.calls()[0].1;
        assert!(!copy.context.contains_key(GOOGLE_ANALYTICS));
        assert!(primary.calls()[0].1.context.contains_key(GOOGLE_ANALYTICS));
    }

    #[tokio::test]
    async fn sink_builds_track_calls() {
        let client = Arc::new(RecordingClient::default());
        let sink = SegmentSink::new(client.clone(), Some("UA-1".to_owned()));
        let event: TrackedEvent = serde_json::from_value(json!({
            "name": "edx.course.enrollment.activated",
            "time": "2014-08-27T16:33:39.215000+00:00",
            "ip": "10.0.0.1",
            "agent": "Mozilla",
            "host": "lms.example.com",
            "referer": "",
            "page": null,
            "label": "course-v1:edX+DemoX+Demo_Course",
            "nonInteraction": 1,
            "context": {"user_id": 7, "client_id": "ga", "path": "/courses/x"},
            "event": {"mode": "audit"}
        }))
        .unwrap();

        sink.send(event).await.unwrap();

        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        let (method, message) = &calls[0];
        assert_eq!(*method, AnalyticsMethod::Track);
        assert_eq!(message.user_id.as_deref(), Some("7"));
        assert_eq!(
            Value::Object(message.properties.clone()),
            json!({"mode": "audit", "label": "course-v1:edX+DemoX+Demo_Course", "nonInteraction": 1})
        );
        assert_eq!(
            Value::Object(message.context.clone()),
            json!({
                GOOGLE_ANALYTICS: {"clientId": "ga", "trackingId": "UA-1"},
                "ip": "10.0.0.1",
                "userAgent": "Mozilla",
                "page": {"path": "/courses/x", "referrer": null, "url": "//lms.example.com/courses/x"}
            })
        );
        assert_eq!(
            message.timestamp.as_deref(),
            Some("2014-08-27T16:33:39.215000+00:00")
        );
    }

    #[tokio::test]
    async fn anonymous_events_are_not_forwarded() {
        let client = Arc::new(RecordingClient::default());
        let sink = SegmentSink::new(client.clone(), None);
        let event: TrackedEvent =
            serde_json::from_value(json!({"name": "a", "context": {"user_id": ""}})).unwrap();

        sink.send(event).await.unwrap();
        assert!(client.calls().is_empty());
    }

    #[test]
    fn messages_use_the_api_field_names() {
        let encoded = serde_json::to_value(message_with_integration()).unwrap();
        assert_eq!(encoded["userId"], json!("7"));
        assert_eq!(encoded["messageId"], json!("original"));
        assert!(encoded.get("timestamp").is_none());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn fanout_calls_twice_with_a_fresh_message_id(
                method in prop_oneof![
                    Just(AnalyticsMethod::Track),
                    Just(AnalyticsMethod::Identify),
                    Just(AnalyticsMethod::Group),
                    Just(AnalyticsMethod::Alias),
                    Just(AnalyticsMethod::Page),
                    Just(AnalyticsMethod::Screen),
                ],
                message_id in "[a-z0-9-]{1,36}",
            ) {
                let primary = Arc::new(RecordingClient::default());
                let secondary = Arc::new(RecordingClient::default());
                let fanout = FanoutClient::new(
                    primary.clone(),
                    Some(PerSiteClient { client: secondary.clone(), tracking_id: None }),
                );
                let message = AnalyticsMessage {
                    message_id: Some(message_id.clone()),
                    ..Default::default()
                };

                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(fanout.call(method, message)).unwrap();

                let calls: Vec<_> = primary.calls().into_iter().chain(secondary.calls()).collect();
                prop_assert_eq!(calls.len(), 2);
                prop_assert_eq!(calls[0].0, method);
                prop_assert_eq!(calls[1].0, method);
                prop_assert_eq!(calls[0].1.message_id.as_deref(), Some(message_id.as_str()));
                prop_assert_ne!(calls[1].1.message_id.as_deref(), Some(message_id.as_str()));
            }
        }
    }
}
