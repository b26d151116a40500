use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::directory::{DirectoryError, ForumDirectory, PgDirectory, UserDirectory};
use crate::processors::{ProcessorKind, SharedProcessor};
use crate::router;
use crate::routing::{Backend, EventRouter};
use crate::sinks::segment::{PerSiteClient, SharedAnalyticsClient};
use crate::sinks::{
    EventSink, FanoutClient, HttpAnalyticsClient, LogSink, SegmentSink, SinkError,
};
use crate::time::{SystemTime, TimeSource};
use crate::transformers::{ForumThreadViewedTransformer, RegistryError, TransformerRegistry};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to set up the user directory: {0}")]
    DirectoryError(#[from] DirectoryError),
    #[error("failed to register transformers: {0}")]
    RegistryError(#[from] RegistryError),
    #[error("failed to set up the analytics client: {0}")]
    SinkError(#[from] SinkError),
    #[error("server error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Tracking log backend: legacy field layout, then the registered transformers.
pub fn tracking_logs_backend(
    registry: &Arc<TransformerRegistry>,
    sink: Arc<dyn EventSink + Send + Sync>,
) -> Backend {
    let processors = [
        ProcessorKind::LegacyFieldMapping,
        ProcessorKind::EventTransformer,
    ]
    .into_iter()
    .map(|kind| kind.build(registry, &[]))
    .collect();

    Backend::new("tracking_logs", processors, sink)
}

/// Analytics backend: whitelisted events only, tagged for the analytics integration.
pub fn analytics_backend(
    registry: &Arc<TransformerRegistry>,
    whitelist: &[String],
    client: SharedAnalyticsClient,
    tracking_id: Option<String>,
) -> Backend {
    let processors: Vec<SharedProcessor> = [
        ProcessorKind::NameWhitelist,
        ProcessorKind::GoogleAnalytics,
    ]
    .into_iter()
    .map(|kind| kind.build(registry, whitelist))
    .collect();

    Backend::new("segment", processors, Arc::new(SegmentSink::new(client, tracking_id)))
}

fn segment_backend(
    config: &Config,
    registry: &Arc<TransformerRegistry>,
    write_key: &str,
) -> Result<Backend, ServerError> {
    let timeout = config.sink_timeout.0;
    let primary: SharedAnalyticsClient = Arc::new(HttpAnalyticsClient::new(
        &config.segment_host,
        write_key,
        timeout,
    )?);
    let per_site = match &config.per_site_override_key {
        Some(key) => Some(PerSiteClient {
            client: Arc::new(HttpAnalyticsClient::new(&config.segment_host, key, timeout)?),
            tracking_id: config.per_site_ga_tracking_id.clone(),
        }),
        None => None,
    };

    Ok(analytics_backend(
        registry,
        &config.segment_emit_whitelist.0,
        Arc::new(FanoutClient::new(primary, per_site)),
        config.google_analytics_tracking_id.clone(),
    ))
}

/// Assemble the global processors and every configured backend.
pub fn event_router(
    config: &Config,
    users: Arc<dyn UserDirectory + Send + Sync>,
    forum: Arc<dyn ForumDirectory + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
) -> Result<EventRouter, ServerError> {
    let registry = Arc::new(TransformerRegistry::with_defaults(
        ForumThreadViewedTransformer::new(config.forum_settings(), users, forum),
    )?);
    let whitelist = &config.segment_emit_whitelist.0;
    let processors = config
        .event_tracking_processors
        .0
        .iter()
        .map(|kind| kind.build(&registry, whitelist))
        .collect();

    let mut events = EventRouter::new(processors, config.sink_timeout.0, timesource)
        .with_backend(tracking_logs_backend(
            &registry,
            Arc::new(LogSink::new(config.track_max_event)),
        ));
    if let Some(write_key) = &config.segment_write_key {
        events = events.with_backend(segment_backend(config, &registry, write_key)?);
    }

    Ok(events)
}

pub async fn serve<F>(
    config: Config,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let directory = Arc::new(PgDirectory::new(
        &config.database_url,
        config.max_pg_connections,
    )?);
    let timesource = Arc::new(SystemTime {});

    let events = event_router(&config, directory.clone(), directory.clone(), timesource.clone())?;
    tracing::info!(
        backends = ?events.backends().collect::<Vec<_>>(),
        "event pipeline ready"
    );

    let app = router::router(
        &config,
        Arc::new(events),
        directory,
        timesource,
        config.export_prometheus,
    );

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::event::TrackedEvent;
    use crate::sinks::{AnalyticsClient, AnalyticsMessage, AnalyticsMethod};
    use crate::tracker::{self, ContextGuard};

    fn build(overrides: &[(&str, &str)]) -> EventRouter {
        let config = Config::with_defaults(overrides).unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        event_router(&config, directory.clone(), directory, Arc::new(SystemTime {})).unwrap()
    }

    fn registry() -> Arc<TransformerRegistry> {
        let config = Config::with_defaults(&[]).unwrap();
        let directory = Arc::new(MemoryDirectory::new());
        Arc::new(
            TransformerRegistry::with_defaults(ForumThreadViewedTransformer::new(
                config.forum_settings(),
                directory.clone(),
                directory,
            ))
            .unwrap(),
        )
    }

    #[derive(Default)]
    struct RecordingClient {
        messages: Mutex<Vec<AnalyticsMessage>>,
    }

    #[async_trait]
    impl AnalyticsClient for RecordingClient {
        async fn call(
            &self,
            _method: AnalyticsMethod,
            message: AnalyticsMessage,
        ) -> Result<(), SinkError> {
            self.messages.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemorySink {
        events: Mutex<Vec<TrackedEvent>>,
    }

    #[async_trait]
    impl EventSink for MemorySink {
        async fn send(&self, event: TrackedEvent) -> Result<(), SinkError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[test]
    fn tracking_logs_are_always_configured() {
        let events = build(&[]);
        assert_eq!(events.backends().collect::<Vec<_>>(), ["tracking_logs"]);
    }

    #[test]
    fn write_key_enables_the_analytics_backend() {
        let events = build(&[
            ("SEGMENT_WRITE_KEY", "write-key"),
            ("PER_SITE_OVERRIDE_KEY", "per-site-key"),
            ("SEGMENT_EMIT_WHITELIST", "edx.course.enrollment.activated"),
        ]);
        assert_eq!(
            events.backends().collect::<Vec<_>>(),
            ["tracking_logs", "segment"]
        );
    }

    #[tokio::test]
    async fn analytics_client_id_survives_the_tracking_log_shim() {
        let registry = registry();
        let logs = Arc::new(MemorySink::default());
        let client = Arc::new(RecordingClient::default());
        let events = EventRouter::new(vec![], Duration::from_secs(1), Arc::new(SystemTime {}))
            .with_backend(tracking_logs_backend(&registry, logs.clone()))
            .with_backend(analytics_backend(
                &registry,
                &["edx.course.enrollment.activated".to_owned()],
                client.clone(),
                Some("UA-1".to_owned()),
            ));

        tracker::scope(async {
            let _guard = ContextGuard::enter(
                "edx.request",
                json!({"user_id": 7, "username": "alice", "client_id": "ga-client"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            );
            let data = json!({"mode": "audit"}).as_object().cloned().unwrap();
            events.emit("edx.course.enrollment.activated", data).await;
        })
        .await;

        let messages = client.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].context["Google Analytics"],
            json!({"clientId": "ga-client", "trackingId": "UA-1"})
        );

        let logged = logs.events.lock().unwrap().clone();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].get_str("username"), Some("alice"));
        assert!(!logged[0].context().unwrap().contains_key("client_id"));
    }
}
