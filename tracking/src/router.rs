use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::directory::UserDirectory;
use crate::middleware::{track_request, RequestTracking};
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::routing::EventRouter;
use crate::segmentio::{self, WebhookSettings};
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub events: Arc<EventRouter>,
    pub users: Arc<dyn UserDirectory + Send + Sync>,
    pub webhook: Arc<WebhookSettings>,
}

async fn index() -> &'static str {
    "tracking"
}

pub fn router(
    config: &Config,
    events: Arc<EventRouter>,
    users: Arc<dyn UserDirectory + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    metrics: bool,
) -> Router {
    let tracking = Arc::new(RequestTracking {
        events: events.clone(),
        timesource,
        ignore_patterns: config.ignore_url_patterns.clone(),
        censored_keys: config.censored_keys.iter().map(str::to_owned).collect(),
        max_body_chars: config.max_body_chars,
    });
    let state = State {
        events,
        users,
        webhook: Arc::new(WebhookSettings::from_config(config)),
    };

    let webhook_path = config.webhook_path.0.as_str();
    let router = Router::new()
        .route("/", get(index))
        .route(webhook_path, post(segmentio::event))
        .route(&format!("{webhook_path}/"), post(segmentio::event))
        .layer(axum::middleware::from_fn_with_state(tracking, track_request))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when tracking is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
