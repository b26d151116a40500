#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use tracking::config::Config;
use tracking::directory::{MemoryDirectory, UserDirectory};
use tracking::event::TrackedEvent;
use tracking::router::router;
use tracking::routing::EventRouter;
use tracking::server::tracking_logs_backend;
use tracking::sinks::{EventSink, SinkError};
use tracking::time::TimeSource;
use tracking::transformers::{ForumThreadViewedTransformer, TransformerRegistry};

pub const SECRET: &str = "secret";
pub const USER_ID: i64 = 42;
pub const USERNAME: &str = "alice";
pub const NOW: &str = "2014-08-27T16:33:39.215000+00:00";

#[derive(Clone)]
pub struct FixedTime {
    pub time: String,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> String {
        self.time.to_string()
    }
}

#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<TrackedEvent>>>,
}

impl MemorySink {
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn send(&self, event: TrackedEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub fn config(overrides: &[(&str, &str)]) -> Config {
    let mut values = vec![("WEBHOOK_SECRET", SECRET)];
    values.extend_from_slice(overrides);
    Config::with_defaults(&values).unwrap()
}

/// The whole application with the default processors, delivering to `sink`.
pub fn setup_router_with(
    sink: MemorySink,
    users: Arc<dyn UserDirectory + Send + Sync>,
    overrides: &[(&str, &str)],
) -> Router {
    let config = config(overrides);
    let forum = Arc::new(MemoryDirectory::new());
    let registry = Arc::new(
        TransformerRegistry::with_defaults(ForumThreadViewedTransformer::new(
            config.forum_settings(),
            users.clone(),
            forum,
        ))
        .unwrap(),
    );
    let processors = config
        .event_tracking_processors
        .0
        .iter()
        .map(|kind| kind.build(&registry, &[]))
        .collect();
    let timesource = Arc::new(FixedTime {
        time: NOW.to_owned(),
    });
    let events = EventRouter::new(processors, config.sink_timeout.0, timesource.clone())
        .with_backend(tracking_logs_backend(&registry, Arc::new(sink)));

    router(&config, Arc::new(events), users, timesource, false)
}

pub fn setup_router(sink: MemorySink, overrides: &[(&str, &str)]) -> Router {
    let users = Arc::new(MemoryDirectory::new().with_user(USER_ID, USERNAME));
    setup_router_with(sink, users, overrides)
}

pub async fn post_raw(app: Router, uri: &str, body: String) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

pub async fn post_webhook(app: Router, envelope: &Value) -> (StatusCode, Value) {
    post_raw(
        app,
        &format!("/segmentio/event?key={SECRET}"),
        envelope.to_string(),
    )
    .await
}
